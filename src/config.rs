use serde::{Deserialize, Serialize};

/// Tunables for one deployment of the pipeline.
///
/// The auto-merge threshold has no principled "right" value; it is a
/// deployment decision and is only checked for consistency with the review band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// ISO 3166 alpha-2 region used to parse national phone numbers.
    pub default_region: String,
    /// Pairs scoring at or above this are linked for merging.
    pub auto_merge_threshold: f64,
    /// Pairs scoring in `[review_threshold, auto_merge_threshold)` go to manual review.
    pub review_threshold: f64,
    /// Source labels, highest priority first, for single-valued merge fields.
    pub source_priority: Vec<String>,
    /// Enabled quality rules; empty means all built-in rules.
    pub quality_rules: Vec<String>,
    pub phone_block_digits: usize,
    pub email_block_prefix: usize,
    /// Blocks with more members than this are skipped (and logged).
    pub max_block_size: usize,
    /// Worker pool size; 0 lets rayon decide.
    pub worker_threads: usize,
    /// Consecutive storage failures before the circuit breaker opens.
    pub store_failure_threshold: u32,
    /// Where the binary writes the deduplicated export.
    pub output_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_region: "US".to_string(),
            auto_merge_threshold: 0.90,
            review_threshold: 0.60,
            source_priority: Vec::new(),
            quality_rules: Vec::new(),
            phone_block_digits: 7,
            email_block_prefix: 4,
            max_block_size: 500,
            worker_threads: 0,
            store_failure_threshold: 5,
            output_path: "deduplicated.vcf".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source (the process
    /// environment in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            default_region: var("DEFAULT_REGION")
                .map(|region| {
                    let region = region.trim().to_ascii_uppercase();
                    if region.len() != 2 || !region.chars().all(|c| c.is_ascii_alphabetic()) {
                        anyhow::bail!("DEFAULT_REGION must be a two-letter country code");
                    }
                    Ok(region)
                })
                .transpose()?
                .unwrap_or(defaults.default_region),
            auto_merge_threshold: parse_score(var("AUTO_MERGE_THRESHOLD"), "AUTO_MERGE_THRESHOLD")?
                .unwrap_or(defaults.auto_merge_threshold),
            review_threshold: parse_score(var("REVIEW_THRESHOLD"), "REVIEW_THRESHOLD")?
                .unwrap_or(defaults.review_threshold),
            source_priority: var("SOURCE_PRIORITY")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            quality_rules: var("QUALITY_RULES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            phone_block_digits: parse_positive(var("PHONE_BLOCK_DIGITS"), "PHONE_BLOCK_DIGITS")?
                .unwrap_or(defaults.phone_block_digits),
            email_block_prefix: parse_positive(var("EMAIL_BLOCK_PREFIX"), "EMAIL_BLOCK_PREFIX")?
                .unwrap_or(defaults.email_block_prefix),
            max_block_size: parse_positive(var("MAX_BLOCK_SIZE"), "MAX_BLOCK_SIZE")?
                .unwrap_or(defaults.max_block_size),
            worker_threads: var("WORKER_THREADS")
                .map(|v| {
                    v.trim()
                        .parse::<usize>()
                        .map_err(|_| anyhow::anyhow!("WORKER_THREADS must be a non-negative integer"))
                })
                .transpose()?
                .unwrap_or(defaults.worker_threads),
            store_failure_threshold: var("STORE_FAILURE_THRESHOLD")
                .map(|v| {
                    v.trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            anyhow::anyhow!("STORE_FAILURE_THRESHOLD must be a positive integer")
                        })
                })
                .transpose()?
                .unwrap_or(defaults.store_failure_threshold),
            output_path: var("OUTPUT_PATH").unwrap_or(defaults.output_path),
        };
        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Default phone region: {}", config.default_region);
        tracing::debug!(
            "Thresholds: auto-merge {:.2}, review {:.2}",
            config.auto_merge_threshold,
            config.review_threshold
        );
        if !config.source_priority.is_empty() {
            tracing::info!("Source priority: {}", config.source_priority.join(" > "));
        }

        Ok(config)
    }

    /// Cross-field checks: `0 <= review <= auto <= 1`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.auto_merge_threshold) {
            anyhow::bail!("AUTO_MERGE_THRESHOLD must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.review_threshold) {
            anyhow::bail!("REVIEW_THRESHOLD must be within [0, 1]");
        }
        if self.review_threshold > self.auto_merge_threshold {
            anyhow::bail!(
                "REVIEW_THRESHOLD ({}) cannot exceed AUTO_MERGE_THRESHOLD ({})",
                self.review_threshold,
                self.auto_merge_threshold
            );
        }
        Ok(())
    }
}

fn parse_score(value: Option<String>, name: &str) -> anyhow::Result<Option<f64>> {
    value
        .map(|v| {
            let score: f64 = v
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a number", name))?;
            if !score.is_finite() {
                anyhow::bail!("{} must be finite", name);
            }
            Ok(score)
        })
        .transpose()
}

fn parse_positive(value: Option<String>, name: &str) -> anyhow::Result<Option<usize>> {
    value
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| anyhow::anyhow!("{} must be a positive integer", name))
        })
        .transpose()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
