use std::fmt;

/// Storage-level failures surfaced by a [`crate::storage::RecordStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A write was attempted against a stale version (optimistic concurrency).
    VersionConflict {
        /// Record whose version did not match.
        record_id: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },
    /// The record does not exist.
    NotFound(String),
    /// A record with the same id was already inserted.
    Duplicate(String),
    /// The backing store refused the write (I/O, network, injected failure).
    Unavailable(String),
    /// A lock guarding the store was poisoned by a panicking writer.
    Poisoned,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::VersionConflict {
                record_id,
                expected,
                actual,
            } => write!(
                f,
                "Stale write for record {}: expected version {}, found {}",
                record_id, expected, actual
            ),
            StoreError::NotFound(id) => write!(f, "Record not found: {}", id),
            StoreError::Duplicate(id) => write!(f, "Record already exists: {}", id),
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Poisoned => write!(f, "Store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Pipeline-level error types.
///
/// Per-record problems (parse failures, structural violations, regressions,
/// ambiguous matches, merge conflicts) are reported, not raised. Only the
/// variants below escape a stage.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// Input cannot be interpreted as a record at all.
    Parse(String),
    /// Storage-related errors.
    Store(StoreError),
    /// Invalid configuration value.
    Config(String),
    /// The batch cannot continue (storage breaker open, worker pool failure).
    ResourceExhausted(String),
    /// File or stream I/O failure.
    Io(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<PipelineError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Parse(msg) => write!(f, "Parse failure: {}", msg),
            PipelineError::Store(e) => write!(f, "Storage error: {}", e),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            PipelineError::Io(msg) => write!(f, "I/O error: {}", msg),
            PipelineError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    /// Returns the innermost error, skipping context wrappers.
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the batch must stop (as opposed to a per-record or per-cluster failure).
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), PipelineError::ResourceExhausted(_))
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store(err)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `PipelineError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, PipelineError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipelineError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for StoreError to add context
impl<T> ResultExt<T> for Result<T, StoreError> {
    fn context(self, context: impl Into<String>) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError::WithContext {
            source: Box::new(PipelineError::Store(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipelineError::WithContext {
            source: Box::new(PipelineError::Store(e)),
            context: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain_display() {
        let err: Result<(), StoreError> = Err(StoreError::NotFound("abc".to_string()));
        let wrapped = err.context("loading survivor").unwrap_err();
        let display = wrapped.to_string();
        assert!(display.contains("loading survivor"));
        assert!(display.contains("Record not found: abc"));
    }

    #[test]
    fn test_root_and_fatal() {
        let err: Result<(), PipelineError> =
            Err(PipelineError::ResourceExhausted("breaker open".to_string()));
        let wrapped = err.with_context(|| "cluster 1".to_string()).unwrap_err();
        assert!(wrapped.is_fatal());
        assert!(matches!(wrapped.root(), PipelineError::ResourceExhausted(_)));

        let not_fatal = PipelineError::Parse("no BEGIN:VCARD".to_string());
        assert!(!not_fatal.is_fatal());
    }
}
