//! Blocking: cheap fingerprints that bound pairwise comparison.
//!
//! Keys only decide which pairs get *scored*, never whether they match.
//! Fingerprinting is a parallel map over records; assembling buckets is a
//! single sequential reduce into a sorted map.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::models::{Record, RecordId};
use crate::normalize::{email_key, phone_key, soundex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingConfig {
    /// Trailing digits of a phone used as its key.
    pub phone_digits: usize,
    /// Leading characters of an email local part used as its key.
    pub email_prefix: usize,
    /// Larger blocks are skipped.
    pub max_block_size: usize,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for BlockingConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            phone_digits: config.phone_block_digits,
            email_prefix: config.email_block_prefix,
            max_block_size: config.max_block_size,
        }
    }
}

/// Two records that share at least one block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidatePair {
    /// Smaller id of the pair.
    pub a: RecordId,
    pub b: RecordId,
    /// First (sorted) block key the pair shares.
    pub block_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    pub blocks: BTreeMap<String, Vec<RecordId>>,
    /// Blocks over the size limit, with their size.
    pub skipped: Vec<(String, usize)>,
}

/// Block keys of one record: `email:`, `phone:` and `soundex:` fingerprints.
pub fn block_keys(record: &Record, config: &BlockingConfig) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for email in &record.emails {
        let key = email_key(email);
        let local = key.split('@').next().unwrap_or_default();
        if !local.is_empty() {
            let prefix: String = local.chars().take(config.email_prefix).collect();
            keys.insert(format!("email:{}", prefix));
        }
    }
    for phone in &record.phones {
        let digits = phone_key(phone);
        if digits.len() >= config.phone_digits {
            keys.insert(format!("phone:{}", &digits[digits.len() - config.phone_digits..]));
        }
    }
    if let Some(code) = record.family_name().as_deref().and_then(soundex) {
        keys.insert(format!("soundex:{}", code));
    }
    keys
}

impl BlockIndex {
    /// Builds the index over active records.
    pub fn build(records: &[Record], config: &BlockingConfig) -> Self {
        let fingerprints: Vec<(RecordId, BTreeSet<String>)> = records
            .par_iter()
            .filter(|r| r.is_active())
            .map(|r| (r.id.clone(), block_keys(r, config)))
            .collect();

        let mut all: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
        for (id, keys) in fingerprints {
            for key in keys {
                all.entry(key).or_default().push(id.clone());
            }
        }

        let mut index = BlockIndex::default();
        for (key, members) in all {
            if members.len() > config.max_block_size {
                warn!(
                    "Skipping oversized block {} ({} records > {})",
                    key,
                    members.len(),
                    config.max_block_size
                );
                index.skipped.push((key, members.len()));
            } else if members.len() > 1 {
                index.blocks.insert(key, members);
            }
        }
        debug!(
            "Blocking produced {} block(s), {} skipped",
            index.blocks.len(),
            index.skipped.len()
        );
        index
    }

    /// Distinct candidate pairs across all blocks, sorted.
    pub fn candidate_pairs(&self) -> Vec<CandidatePair> {
        let mut seen: BTreeMap<(RecordId, RecordId), String> = BTreeMap::new();
        for (key, members) in &self.blocks {
            for (i, left) in members.iter().enumerate() {
                for right in &members[i + 1..] {
                    if left == right {
                        continue;
                    }
                    let pair = if left < right {
                        (left.clone(), right.clone())
                    } else {
                        (right.clone(), left.clone())
                    };
                    // blocks iterate in key order, so the first key wins
                    seen.entry(pair).or_insert_with(|| key.clone());
                }
            }
        }
        seen.into_iter()
            .map(|((a, b), block_key)| CandidatePair { a, b, block_key })
            .collect()
    }
}
