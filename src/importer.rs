use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Property, Provenance, Record, RecordId};
use crate::vcard;

/// Raw export text from one source (an address book, a groupware dump, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBatch {
    /// Source label; becomes the provenance of every record in the text.
    pub source: String,
    pub text: String,
}

impl SourceBatch {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }
}

/// A chunk of input that could not be read as a record at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFailure {
    pub source: String,
    /// Position of the chunk among the cards of its source.
    pub index: usize,
    pub reason: String,
    pub raw: String,
}

#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub records: Vec<Record>,
    pub failures: Vec<ImportFailure>,
}

/// Turns raw source text into records at version 1.
///
/// Ids come from the card's `UID`; cards without one, or whose `UID` was
/// already taken earlier in the batch, get a fresh UUID. A displaced `UID`
/// is kept as `X-SOURCE-UID` so nothing is lost.
#[derive(Debug, Default)]
pub struct Importer {
    seen: HashSet<RecordId>,
}

impl Importer {
    pub fn new() -> Self {
        Self::default()
    }

    /// An importer that treats `ids` (records already stored) as taken.
    pub fn with_known_ids(ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self {
            seen: ids.into_iter().collect(),
        }
    }

    pub fn import(&mut self, batch: &SourceBatch, imported_at: DateTime<Utc>) -> ImportResult {
        let mut result = ImportResult::default();

        for (index, card) in vcard::split_cards(&batch.text).into_iter().enumerate() {
            let card = match card {
                Ok(card) => card,
                Err(failure) => {
                    warn!(
                        "Parse failure in source {} (card {}): {}",
                        batch.source, index, failure.reason
                    );
                    result.failures.push(ImportFailure {
                        source: batch.source.clone(),
                        index,
                        reason: failure.reason,
                        raw: failure.raw,
                    });
                    continue;
                }
            };

            let provenance = Provenance {
                source: batch.source.clone(),
                imported_at,
            };
            let mut record = vcard::record_from_card(&card, Uuid::new_v4().to_string(), provenance);
            if !self.seen.insert(record.id.clone()) {
                let fresh = Uuid::new_v4().to_string();
                warn!(
                    "Duplicate UID {} in source {}; re-keyed as {}",
                    record.id, batch.source, fresh
                );
                record
                    .extra
                    .push(Property::new("X-SOURCE-UID", vcard::escape_text(&record.id)));
                record.id = fresh;
                self.seen.insert(record.id.clone());
            }
            record.version = 1;
            result.records.push(record);
        }

        info!(
            "📥 Imported {} record(s) from {} ({} parse failure(s))",
            result.records.len(),
            batch.source,
            result.failures.len()
        );
        result
    }
}
