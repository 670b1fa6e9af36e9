//! Deterministic repair of structural violations.
//!
//! Repair only adds: a missing display name, structured name or version
//! marker is synthesized from data already on the record. Findings that cannot
//! be fixed by adding a field (control characters, broken embedded cards) are
//! left in place so the record is rejected on re-validation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Record, RecordId, StructuredName};
use crate::validator::{FindingCode, ValidationFinding, LOWEST_ACCEPTED_VERSION};

/// Placeholder display name when nothing on the record can supply one.
pub const UNKNOWN_CONTACT: &str = "Unknown Contact";

/// Where a synthesized display name came from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayNameSource {
    StructuredName,
    Organization,
    EmailLocalPart,
    Phone,
    Sentinel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RepairAction {
    SetVersion {
        previous: Option<String>,
        value: String,
    },
    SynthesizeDisplayName {
        value: String,
        source: DisplayNameSource,
    },
    BackfillStructuredName {
        family: String,
        given: String,
    },
}

/// Everything the repairer synthesized for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub record_id: RecordId,
    pub version_before: u64,
    pub version_after: u64,
    pub actions: Vec<RepairAction>,
}

impl RepairReport {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Repairs `record` according to its `findings`, returning a new version.
///
/// A record without repairable error findings is returned unchanged (same version).
pub fn repair(record: &Record, findings: &[ValidationFinding]) -> (Record, RepairReport) {
    let has = |code: FindingCode| findings.iter().any(|f| f.is_error() && f.code == code);
    let mut repaired = record.clone();
    let mut actions = Vec::new();

    if has(FindingCode::MissingVersion) || has(FindingCode::UnsupportedVersion) {
        let previous = repaired
            .format_version
            .replace(LOWEST_ACCEPTED_VERSION.to_string());
        actions.push(RepairAction::SetVersion {
            previous,
            value: LOWEST_ACCEPTED_VERSION.to_string(),
        });
    }

    if has(FindingCode::MissingFormattedName) {
        let (value, source) = synthesize_display_name(&repaired);
        repaired.names.formatted = Some(value.clone());
        actions.push(RepairAction::SynthesizeDisplayName { value, source });
    }

    if has(FindingCode::MissingStructuredName) {
        let display = repaired.display_name().unwrap_or(UNKNOWN_CONTACT).to_string();
        let name = split_display_name(&display);
        actions.push(RepairAction::BackfillStructuredName {
            family: name.family.clone(),
            given: name.given.clone(),
        });
        repaired.names.structured = Some(name);
    }

    if !actions.is_empty() {
        repaired.touch();
        debug!(
            "Repaired record {} (v{} -> v{}): {} action(s)",
            repaired.id,
            record.version,
            repaired.version,
            actions.len()
        );
    }

    let report = RepairReport {
        record_id: record.id.clone(),
        version_before: record.version,
        version_after: repaired.version,
        actions,
    };
    (repaired, report)
}

/// Picks a display name: structured name, organization, email local part,
/// first phone, then the fixed sentinel.
pub fn synthesize_display_name(record: &Record) -> (String, DisplayNameSource) {
    if let Some(n) = &record.names.structured {
        let display = n.display();
        if !display.is_empty() {
            return (display, DisplayNameSource::StructuredName);
        }
    }
    if let Some(org) = &record.organization {
        let name = org.name.trim();
        if !name.is_empty() {
            return (name.to_string(), DisplayNameSource::Organization);
        }
    }
    let local_part = record
        .emails
        .iter()
        .filter_map(|e| e.trim().split('@').next())
        .map(str::trim)
        .find(|l| !l.is_empty());
    if let Some(local) = local_part {
        return (local.to_string(), DisplayNameSource::EmailLocalPart);
    }
    if let Some(phone) = record.phones.iter().map(|p| p.trim()).find(|p| !p.is_empty()) {
        return (format!("Contact {}", phone), DisplayNameSource::Phone);
    }
    (UNKNOWN_CONTACT.to_string(), DisplayNameSource::Sentinel)
}

/// Last whitespace token becomes the family name, the rest the given name.
pub fn split_display_name(display: &str) -> StructuredName {
    let tokens: Vec<&str> = display.split_whitespace().collect();
    match tokens.split_last() {
        Some((family, given)) => StructuredName {
            family: family.to_string(),
            given: given.join(" "),
            ..Default::default()
        },
        None => StructuredName::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Organization, Provenance};
    use crate::validator::{error_count, validate};
    use chrono::Utc;

    fn bare(id: &str) -> Record {
        Record::new(
            id,
            Provenance {
                source: "test".to_string(),
                imported_at: Utc::now(),
            },
        )
    }

    fn repair_fully(record: &Record) -> (Record, RepairReport) {
        repair(record, &validate(record))
    }

    #[test]
    fn test_display_name_from_email_local_part() {
        let mut r = bare("r1");
        r.emails.push("jane.doe@example.com".to_string());
        let (fixed, report) = repair_fully(&r);
        assert_eq!(fixed.display_name(), Some("jane.doe"));
        assert_eq!(fixed.format_version.as_deref(), Some("3.0"));
        assert_eq!(fixed.names.structured.as_ref().unwrap().family, "jane.doe");
        assert_eq!(error_count(&validate(&fixed)), 0);
        assert_eq!(report.actions.len(), 3);
        assert_eq!(fixed.version, r.version + 1);
    }

    #[test]
    fn test_display_name_priority() {
        let mut r = bare("r1");
        r.phones.push("+15550100".to_string());
        assert_eq!(
            synthesize_display_name(&r),
            ("Contact +15550100".to_string(), DisplayNameSource::Phone)
        );
        r.organization = Some(Organization::named("Acme"));
        assert_eq!(synthesize_display_name(&r).1, DisplayNameSource::Organization);
        r.names.structured = Some(StructuredName {
            family: "Doe".to_string(),
            given: "Jane".to_string(),
            ..Default::default()
        });
        assert_eq!(
            synthesize_display_name(&r),
            ("Jane Doe".to_string(), DisplayNameSource::StructuredName)
        );
        assert_eq!(
            synthesize_display_name(&bare("x")).0,
            UNKNOWN_CONTACT.to_string()
        );
    }

    #[test]
    fn test_backfill_and_version_upgrade() {
        let mut r = bare("r1");
        r.format_version = Some("2.1".to_string());
        r.names.formatted = Some("Mary Ann Smith".to_string());
        let (fixed, report) = repair_fully(&r);
        let n = fixed.names.structured.as_ref().unwrap();
        assert_eq!((n.family.as_str(), n.given.as_str()), ("Smith", "Mary Ann"));
        assert!(report.actions.contains(&RepairAction::SetVersion {
            previous: Some("2.1".to_string()),
            value: "3.0".to_string()
        }));
        // the display name was already there
        assert_eq!(fixed.names.formatted, r.names.formatted);
    }

    #[test]
    fn test_clean_record_untouched() {
        let mut r = bare("r1");
        r.format_version = Some("4.0".to_string());
        r.names.formatted = Some("Solo".to_string());
        let (fixed, report) = repair_fully(&r);
        assert!(report.is_empty());
        assert_eq!(fixed, r);
    }

    #[test]
    fn test_unrepairable_finding_left_alone() {
        let mut r = bare("r1");
        r.format_version = Some("4.0".to_string());
        r.names.formatted = Some("Bad\u{1}Name".to_string());
        let (fixed, report) = repair_fully(&r);
        assert!(report.is_empty());
        assert_eq!(error_count(&validate(&fixed)), 1);
    }
}
