//! Structural validation of contact records.
//!
//! Every check is a pure read over a [`Record`]. Malformed input produces
//! `Error` findings; nothing here panics or returns `Err`.

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Provenance, Record};
use crate::vcard;

/// Format versions the validator accepts, lowest first.
pub const ACCEPTED_VERSIONS: [&str; 2] = ["3.0", "4.0"];

/// Version the repairer writes when the marker is missing or unsupported.
pub const LOWEST_ACCEPTED_VERSION: &str = ACCEPTED_VERSIONS[0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// Machine-readable finding codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingCode {
    ParseFailure,
    ParseWarning,
    MissingVersion,
    UnsupportedVersion,
    MissingFormattedName,
    MissingStructuredName,
    ControlCharacter,
    EmptyValue,
    PhoneWithoutDigits,
    EmailWithoutAt,
    InvalidPhoto,
    UnknownPhotoType,
    InvalidBinary,
    InvalidUri,
    InvalidEmbeddedCard,
    InvalidPropertyName,
}

impl fmt::Display for FindingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // same spelling as the serialized form
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub code: FindingCode,
    /// vCard property the finding is about (`FN`, `TEL`, `X-FOO`, ...).
    pub field: String,
    pub message: String,
}

impl ValidationFinding {
    fn error(code: FindingCode, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(code: FindingCode, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Number of `Error` findings.
pub fn error_count(findings: &[ValidationFinding]) -> usize {
    findings.iter().filter(|f| f.is_error()).count()
}

pub fn is_structurally_valid(record: &Record) -> bool {
    error_count(&validate(record)) == 0
}

/// Validates one parsed record.
pub fn validate(record: &Record) -> Vec<ValidationFinding> {
    let mut findings = Vec::new();
    check_version(record, &mut findings);
    check_names(record, &mut findings);
    check_contact_values(record, &mut findings);
    check_photo(record, &mut findings);
    check_extras(record, &mut findings);
    findings
}

/// Validates a batch in parallel; output order matches input order.
pub fn validate_batch(records: &[Record]) -> Vec<Vec<ValidationFinding>> {
    records.par_iter().map(validate).collect()
}

/// Validates serialized vCard text, one findings list per card (or unreadable chunk).
pub fn validate_serialized(text: &str) -> Vec<Vec<ValidationFinding>> {
    vcard::split_cards(text)
        .into_iter()
        .enumerate()
        .map(|(index, card)| match card {
            Ok(card) => {
                let provenance = Provenance {
                    source: "inline".to_string(),
                    imported_at: Utc::now(),
                };
                let record = vcard::record_from_card(&card, format!("card-{}", index), provenance);
                let mut findings = validate(&record);
                findings.extend(card.warnings.iter().map(|w| {
                    ValidationFinding::warning(FindingCode::ParseWarning, "VCARD", w.clone())
                }));
                findings
            }
            Err(failure) => vec![ValidationFinding::error(
                FindingCode::ParseFailure,
                "VCARD",
                failure.reason,
            )],
        })
        .collect()
}

fn check_version(record: &Record, findings: &mut Vec<ValidationFinding>) {
    match record.format_version.as_deref().map(str::trim) {
        None | Some("") => findings.push(ValidationFinding::error(
            FindingCode::MissingVersion,
            "VERSION",
            "format version marker is missing",
        )),
        Some(v) if !ACCEPTED_VERSIONS.contains(&v) => findings.push(ValidationFinding::error(
            FindingCode::UnsupportedVersion,
            "VERSION",
            format!("version {} is not one of {:?}", v, ACCEPTED_VERSIONS),
        )),
        Some(_) => {}
    }
}

fn check_names(record: &Record, findings: &mut Vec<ValidationFinding>) {
    if record.display_name().is_none() {
        findings.push(ValidationFinding::error(
            FindingCode::MissingFormattedName,
            "FN",
            "formatted display name is missing or blank",
        ));
    }
    if let Some(fname) = &record.names.formatted {
        check_single_line("FN", fname, findings);
    }

    let structured_missing = record
        .names
        .structured
        .as_ref()
        .map_or(true, |n| n.is_empty());
    // N is mandatory in 3.0 and optional in 4.0
    let is_v4 = record
        .format_version
        .as_deref()
        .is_some_and(|v| v.trim().starts_with('4'));
    if structured_missing && !is_v4 {
        findings.push(ValidationFinding::error(
            FindingCode::MissingStructuredName,
            "N",
            "structured name is missing",
        ));
    }
    if let Some(n) = &record.names.structured {
        for part in n.parts() {
            check_single_line("N", part, findings);
        }
    }
    if let Some(org) = &record.organization {
        check_single_line("ORG", &org.name, findings);
        for unit in &org.units {
            check_single_line("ORG", unit, findings);
        }
    }
    if let Some(title) = &record.job_title {
        check_single_line("TITLE", title, findings);
    }
    if let Some(notes) = &record.notes {
        if notes.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
            findings.push(ValidationFinding::error(
                FindingCode::ControlCharacter,
                "NOTE",
                "notes contain control characters",
            ));
        }
    }
}

fn check_single_line(field: &str, value: &str, findings: &mut Vec<ValidationFinding>) {
    if value.chars().any(char::is_control) {
        findings.push(ValidationFinding::error(
            FindingCode::ControlCharacter,
            field,
            format!("control character in {:?}", value),
        ));
    }
}

fn check_contact_values(record: &Record, findings: &mut Vec<ValidationFinding>) {
    for email in &record.emails {
        if email.trim().is_empty() {
            findings.push(ValidationFinding::error(
                FindingCode::EmptyValue,
                "EMAIL",
                "empty email value",
            ));
            continue;
        }
        check_single_line("EMAIL", email, findings);
        if !email.contains('@') {
            findings.push(ValidationFinding::warning(
                FindingCode::EmailWithoutAt,
                "EMAIL",
                format!("{:?} has no @", email),
            ));
        }
    }
    for phone in &record.phones {
        if phone.trim().is_empty() {
            findings.push(ValidationFinding::error(
                FindingCode::EmptyValue,
                "TEL",
                "empty phone value",
            ));
            continue;
        }
        check_single_line("TEL", phone, findings);
        if !phone.chars().any(|c| c.is_ascii_digit()) {
            findings.push(ValidationFinding::warning(
                FindingCode::PhoneWithoutDigits,
                "TEL",
                format!("{:?} contains no digits", phone),
            ));
        }
    }
}

fn check_photo(record: &Record, findings: &mut Vec<ValidationFinding>) {
    let Some(photo) = &record.photo else {
        return;
    };
    if photo.data.is_empty() {
        findings.push(ValidationFinding::error(
            FindingCode::InvalidPhoto,
            "PHOTO",
            "photo has no data",
        ));
    } else if photo.byte_size != photo.data.len() {
        findings.push(ValidationFinding::error(
            FindingCode::InvalidPhoto,
            "PHOTO",
            format!(
                "declared size {} does not match {} data bytes",
                photo.byte_size,
                photo.data.len()
            ),
        ));
    }
    if !photo.mime.as_deref().is_some_and(|m| m.starts_with("image/")) {
        findings.push(ValidationFinding::warning(
            FindingCode::UnknownPhotoType,
            "PHOTO",
            format!("unrecognised photo type {:?}", photo.mime),
        ));
    }
}

fn check_extras(record: &Record, findings: &mut Vec<ValidationFinding>) {
    for prop in &record.extra {
        let name_ok = vcard::is_valid_name(&prop.name)
            && prop.group.as_deref().map_or(true, vcard::is_valid_name);
        if !name_ok {
            findings.push(ValidationFinding::error(
                FindingCode::InvalidPropertyName,
                prop.name.clone(),
                format!("invalid property name {:?}", prop.name),
            ));
        }
        if prop.value.chars().any(|c| c.is_control() && c != '\t') {
            findings.push(ValidationFinding::error(
                FindingCode::ControlCharacter,
                prop.name.clone(),
                "raw control character in property value",
            ));
        }

        match prop.name.as_str() {
            "PHOTO" | "LOGO" | "SOUND" | "KEY" => match vcard::inline_binary(prop) {
                Some(Err(reason)) => findings.push(ValidationFinding::error(
                    FindingCode::InvalidBinary,
                    prop.name.clone(),
                    reason,
                )),
                Some(Ok(_)) => {}
                None => check_uri(prop.name.as_str(), prop.value.trim(), findings),
            },
            "URL" => check_uri("URL", prop.value.trim(), findings),
            "AGENT" => check_agent(prop, findings),
            _ => {}
        }
    }
}

fn check_uri(field: &str, value: &str, findings: &mut Vec<ValidationFinding>) {
    if url::Url::parse(value).is_err() {
        findings.push(ValidationFinding::warning(
            FindingCode::InvalidUri,
            field,
            format!("{:?} is not an absolute URI", value),
        ));
    }
}

/// An embedded card must itself be readable; a URI reference is accepted as is.
fn check_agent(prop: &crate::models::Property, findings: &mut Vec<ValidationFinding>) {
    let value = vcard::unescape_text(prop.value.trim());
    if value.trim().is_empty() {
        findings.push(ValidationFinding::error(
            FindingCode::InvalidEmbeddedCard,
            "AGENT",
            "empty embedded card",
        ));
        return;
    }
    if !value.to_ascii_uppercase().contains("BEGIN:VCARD") {
        return;
    }
    let cards = vcard::split_cards(&value);
    if cards.is_empty() || cards.iter().any(Result::is_err) {
        findings.push(ValidationFinding::error(
            FindingCode::InvalidEmbeddedCard,
            "AGENT",
            "embedded card is not well-formed",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Photo, Property, StructuredName};

    fn valid_record() -> Record {
        let mut r = Record::new(
            "r1",
            Provenance {
                source: "test".to_string(),
                imported_at: Utc::now(),
            },
        );
        r.format_version = Some("3.0".to_string());
        r.names.formatted = Some("Jane Doe".to_string());
        r.names.structured = Some(StructuredName {
            family: "Doe".to_string(),
            given: "Jane".to_string(),
            ..Default::default()
        });
        r
    }

    fn codes(findings: &[ValidationFinding]) -> Vec<FindingCode> {
        findings.iter().map(|f| f.code).collect()
    }

    #[test]
    fn test_valid_record_has_no_findings() {
        assert!(validate(&valid_record()).is_empty());
    }

    #[test]
    fn test_missing_mandatory_fields() {
        let mut r = valid_record();
        r.format_version = None;
        r.names.formatted = Some("   ".to_string());
        r.names.structured = None;
        let findings = validate(&r);
        assert_eq!(error_count(&findings), 3);
        assert_eq!(
            codes(&findings),
            vec![
                FindingCode::MissingVersion,
                FindingCode::MissingFormattedName,
                FindingCode::MissingStructuredName
            ]
        );
    }

    #[test]
    fn test_structured_name_optional_in_v4() {
        let mut r = valid_record();
        r.format_version = Some("4.0".to_string());
        r.names.structured = None;
        assert!(validate(&r).is_empty());

        r.format_version = Some("2.1".to_string());
        assert!(codes(&validate(&r)).contains(&FindingCode::UnsupportedVersion));
    }

    #[test]
    fn test_contact_values() {
        let mut r = valid_record();
        r.emails = vec!["".to_string(), "nobody".to_string()];
        r.phones = vec!["ext".to_string(), "555\u{7}0100".to_string()];
        let findings = validate(&r);
        assert_eq!(error_count(&findings), 2);
        let c = codes(&findings);
        assert!(c.contains(&FindingCode::EmailWithoutAt));
        assert!(c.contains(&FindingCode::PhoneWithoutDigits));
        assert!(c.contains(&FindingCode::ControlCharacter));
    }

    #[test]
    fn test_photo_checks() {
        let mut r = valid_record();
        let mut photo = Photo::from_bytes(None, crate::photo::fixtures::png(2, 2));
        photo.byte_size += 1;
        r.photo = Some(photo);
        assert_eq!(codes(&validate(&r)), vec![FindingCode::InvalidPhoto]);

        r.photo = Some(Photo::from_bytes(None, vec![1, 2, 3]));
        assert_eq!(codes(&validate(&r)), vec![FindingCode::UnknownPhotoType]);
    }

    #[test]
    fn test_extra_properties() {
        let mut r = valid_record();
        let mut logo = Property::new("LOGO", "%%%");
        logo.params.push("ENCODING=b".to_string());
        r.extra.push(logo);
        r.extra.push(Property::new("URL", "not a url"));
        r.extra.push(Property::new("AGENT", "BEGIN:VCARD\\nFN:x\\n"));
        r.extra.push(Property::new("BAD NAME", "x"));
        let c = codes(&validate(&r));
        assert!(c.contains(&FindingCode::InvalidBinary));
        assert!(c.contains(&FindingCode::InvalidUri));
        assert!(c.contains(&FindingCode::InvalidEmbeddedCard));
        assert!(c.contains(&FindingCode::InvalidPropertyName));
    }

    #[test]
    fn test_well_formed_agent_accepted() {
        let mut r = valid_record();
        r.extra.push(Property::new(
            "AGENT",
            "BEGIN:VCARD\\nVERSION:3.0\\nFN:Assistant\\nEND:VCARD",
        ));
        assert!(validate(&r).is_empty());
    }

    #[test]
    fn test_validate_serialized() {
        let text = "BEGIN:VCARD\nVERSION:3.0\nFN:A\nN:A;;;;\nEND:VCARD\nBEGIN:VCARD\nEMAIL:x@y.z\nEND:VCARD\nBEGIN:VCARD\nFN:broken\n";
        let results = validate_serialized(text);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_empty());
        assert_eq!(error_count(&results[1]), 3);
        assert_eq!(results[2][0].code, FindingCode::ParseFailure);
    }

    #[test]
    fn test_validator_is_pure() {
        let r = valid_record();
        let before = r.clone();
        let _ = validate(&r);
        assert_eq!(r, before);
    }

    #[test]
    fn test_finding_code_display() {
        assert_eq!(FindingCode::MissingFormattedName.to_string(), "missing-formatted-name");
    }
}
