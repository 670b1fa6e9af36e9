//! Contact Compliance Library
//!
//! This library brings batches of vCard contact records from heterogeneous
//! sources into structural compliance, improves their data quality and
//! collapses duplicate records into surviving records with a full,
//! checksummed audit trail.
//!
//! # Modules
//!
//! - `core`: Compliance and deduplication stages.
//! - `integrations`: Storage, audit, import/export and review collaborators.
//! - `audit`: Append-only, checksummed record history.
//! - `blocking`: Blocking keys that bound pairwise comparison.
//! - `casing`: Title-casing for personal names.
//! - `circuit_breaker`: Circuit breaker guarding store commits.
//! - `compliance`: Validate/repair/rewrite state machine.
//! - `config`: Configuration management.
//! - `errors`: Error handling types.
//! - `executor`: Transactional merge execution and unmerge.
//! - `importer`: Source text to versioned records.
//! - `merge`: Clustering and merge planning.
//! - `models`: Core data models.
//! - `normalize`: Email, phone, organization and name normalization.
//! - `photo`: Image header sniffing.
//! - `pipeline`: The batch pipeline.
//! - `repairer`: Structural repairs.
//! - `review`: Manual review queue.
//! - `rewriter`: Quality rewrite rules.
//! - `scoring`: Pairwise similarity scoring.
//! - `storage`: Record store contract and in-memory store.
//! - `validator`: Structural validation.
//! - `vcard`: vCard parsing and serialization.

pub mod core;
pub mod integrations;

pub mod audit;
pub mod blocking;
pub mod casing;
pub mod circuit_breaker;
pub mod compliance;
pub mod config;
pub mod errors;
pub mod executor;
pub mod importer;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod photo;
pub mod pipeline;
pub mod repairer;
pub mod review;
pub mod rewriter;
pub mod scoring;
pub mod storage;
pub mod validator;
pub mod vcard;
