use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::normalize::{email_key, phone_key, phones_match};
use crate::photo;

/// Opaque, stable record identifier (the vCard `UID` when the source supplied one).
pub type RecordId = String;

// ============ Record Model ============

/// One contact as held by the pipeline.
///
/// Records are created by import, mutated in place by the compliance stage
/// (every mutation bumps `version`) and finally either absorb data or are
/// flipped to `merged`/`deleted` by the merge executor. They are never
/// physically removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier.
    pub id: RecordId,
    /// Declared format version marker (`VERSION:` line), if any.
    pub format_version: Option<String>,
    /// Display and structured names.
    pub names: Names,
    /// Email addresses in source order, no case-insensitive duplicates once rewritten.
    pub emails: Vec<String>,
    /// Phone numbers, E.164 when parseable, original text otherwise.
    pub phones: Vec<String>,
    /// Organization name and units.
    pub organization: Option<Organization>,
    /// Job title.
    pub job_title: Option<String>,
    /// Embedded photo.
    pub photo: Option<Photo>,
    /// Free-text notes.
    pub notes: Option<String>,
    /// Properties the model does not interpret, kept verbatim for export.
    pub extra: Vec<Property>,
    /// `TYPE` style parameters of individual emails and phones.
    #[serde(default)]
    pub value_params: Vec<ValueParams>,
    /// Source and import time.
    pub provenance: Provenance,
    /// Monotonic mutation counter.
    pub version: u64,
    /// Lifecycle status.
    pub status: RecordStatus,
    /// Surviving record when `status == Merged`.
    pub merged_into: Option<RecordId>,
}

/// Formatted display name plus the structured `N` components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Names {
    /// Formatted display name (`FN`).
    pub formatted: Option<String>,
    /// Structured name (`N`).
    pub structured: Option<StructuredName>,
}

/// The five `N` components. Empty strings mean "component absent".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredName {
    pub family: String,
    pub given: String,
    pub additional: String,
    pub prefixes: String,
    pub suffixes: String,
}

impl StructuredName {
    pub fn is_empty(&self) -> bool {
        self.parts().iter().all(|p| p.trim().is_empty())
    }

    /// Components in `N` order: family, given, additional, prefixes, suffixes.
    pub fn parts(&self) -> [&str; 5] {
        [
            &self.family,
            &self.given,
            &self.additional,
            &self.prefixes,
            &self.suffixes,
        ]
    }

    /// Composes a display name in reading order (prefix given additional family suffix).
    pub fn display(&self) -> String {
        [
            &self.prefixes,
            &self.given,
            &self.additional,
            &self.family,
            &self.suffixes,
        ]
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Organization name plus optional organizational units (`ORG:Acme;Sales`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub units: Vec<String>,
}

impl Organization {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: Vec::new(),
        }
    }
}

/// Embedded photo with size metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    /// MIME type such as `image/jpeg`.
    pub mime: Option<String>,
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// Pixel width, when the header could be read.
    pub width: Option<u32>,
    /// Pixel height, when the header could be read.
    pub height: Option<u32>,
    /// Declared blob size in bytes.
    pub byte_size: usize,
}

impl Photo {
    /// Builds a photo from decoded bytes, sniffing type and dimensions from the header.
    pub fn from_bytes(mime: Option<String>, data: Vec<u8>) -> Self {
        let dims = photo::sniff_dimensions(&data);
        let mime = mime.or_else(|| photo::sniff_mime(&data).map(str::to_string));
        Self {
            mime,
            byte_size: data.len(),
            width: dims.map(|d| d.0),
            height: dims.map(|d| d.1),
            data,
        }
    }

    pub fn pixel_area(&self) -> u64 {
        match (self.width, self.height) {
            (Some(w), Some(h)) => u64::from(w) * u64::from(h),
            _ => 0,
        }
    }
}

/// Which source produced a record, and when it was imported. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub imported_at: DateTime<Utc>,
}

/// Soft-delete lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Merged,
    Deleted,
}

/// A vCard content line the model keeps verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Property {
    /// Property group (`item1` in `item1.URL`).
    pub group: Option<String>,
    /// Upper-cased property name.
    pub name: String,
    /// Raw parameters (`TYPE=WORK`, `CELL`, ...).
    pub params: Vec<String>,
    /// Raw (still escaped) value.
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            group: None,
            name: name.into().to_ascii_uppercase(),
            params: Vec::new(),
            value: value.into(),
        }
    }

    /// Looks up a `NAME=VALUE` parameter case-insensitively.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find_map(|p| {
            let (key, value) = p.split_once('=')?;
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }

    /// True if a bare (2.1 style) or `TYPE=` parameter carries `flag`.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.params.iter().any(|p| match p.split_once('=') {
            Some((key, values)) => {
                key.eq_ignore_ascii_case("TYPE")
                    && values.split(',').any(|v| v.eq_ignore_ascii_case(flag))
            }
            None => p.eq_ignore_ascii_case(flag),
        })
    }
}

/// Parameters (`TYPE=WORK`, `CELL`, `PREF=1`) of one email or phone value.
///
/// Keyed by the comparison key of the value so they survive canonicalization
/// and reordering of the value list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueParams {
    /// `EMAIL` or `TEL`.
    pub property: String,
    pub key: String,
    pub params: Vec<String>,
}

impl ValueParams {
    fn matches(&self, property: &str, key: &str) -> bool {
        self.property == property
            && match property {
                "TEL" => phones_match(&self.key, key),
                _ => self.key == key,
            }
    }
}

fn value_key(property: &str, value: &str) -> String {
    match property {
        "TEL" => phone_key(value),
        _ => email_key(value),
    }
}

// ============ Field addressing ============

/// A rewritable or mergeable field of a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Field {
    FormattedName,
    StructuredName,
    Emails,
    Phones,
    Organization,
    JobTitle,
    Photo,
    Notes,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::FormattedName => "FN",
            Field::StructuredName => "N",
            Field::Emails => "EMAIL",
            Field::Phones => "TEL",
            Field::Organization => "ORG",
            Field::JobTitle => "TITLE",
            Field::Photo => "PHOTO",
            Field::Notes => "NOTE",
        };
        f.write_str(name)
    }
}

/// The value of one [`Field`], used for edits and merge resolutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Text(Option<String>),
    List(Vec<String>),
    Name(Option<StructuredName>),
    Org(Option<Organization>),
    Photo(Option<Photo>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        match self {
            FieldValue::Text(v) => v.as_deref().map_or(true, |s| s.trim().is_empty()),
            FieldValue::List(v) => v.is_empty(),
            FieldValue::Name(v) => v.as_ref().map_or(true, StructuredName::is_empty),
            FieldValue::Org(v) => v.as_ref().map_or(true, |o| o.name.trim().is_empty()),
            FieldValue::Photo(v) => v.is_none(),
        }
    }

    /// Short human-readable rendering for reports and conflict evidence.
    pub fn summary(&self) -> String {
        match self {
            FieldValue::Text(v) => v.clone().unwrap_or_default(),
            FieldValue::List(v) => v.join(", "),
            FieldValue::Name(v) => v.as_ref().map(StructuredName::display).unwrap_or_default(),
            FieldValue::Org(v) => v.as_ref().map(|o| o.name.clone()).unwrap_or_default(),
            FieldValue::Photo(v) => v
                .as_ref()
                .map(|p| format!("{} bytes", p.byte_size))
                .unwrap_or_default(),
        }
    }
}

impl Record {
    /// Creates an empty active record at version 0.
    pub fn new(id: impl Into<RecordId>, provenance: Provenance) -> Self {
        Self {
            id: id.into(),
            format_version: None,
            names: Names::default(),
            emails: Vec::new(),
            phones: Vec::new(),
            organization: None,
            job_title: None,
            photo: None,
            notes: None,
            extra: Vec::new(),
            value_params: Vec::new(),
            provenance,
            version: 0,
            status: RecordStatus::Active,
            merged_into: None,
        }
    }

    /// Bumps the mutation counter.
    pub fn touch(&mut self) {
        self.version += 1;
    }

    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }

    pub fn display_name(&self) -> Option<&str> {
        self.names
            .formatted
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Family name from `N`, falling back to the last token of `FN`.
    pub fn family_name(&self) -> Option<String> {
        if let Some(n) = &self.names.structured {
            if !n.family.trim().is_empty() {
                return Some(n.family.trim().to_string());
            }
        }
        self.display_name()
            .and_then(|fname| fname.split_whitespace().last())
            .map(str::to_string)
    }

    pub fn get(&self, field: Field) -> FieldValue {
        match field {
            Field::FormattedName => FieldValue::Text(self.names.formatted.clone()),
            Field::StructuredName => FieldValue::Name(self.names.structured.clone()),
            Field::Emails => FieldValue::List(self.emails.clone()),
            Field::Phones => FieldValue::List(self.phones.clone()),
            Field::Organization => FieldValue::Org(self.organization.clone()),
            Field::JobTitle => FieldValue::Text(self.job_title.clone()),
            Field::Photo => FieldValue::Photo(self.photo.clone()),
            Field::Notes => FieldValue::Text(self.notes.clone()),
        }
    }

    /// Writes `value` into `field`. A value of the wrong kind is ignored and logged.
    pub fn set(&mut self, field: Field, value: FieldValue) {
        match (field, value) {
            (Field::FormattedName, FieldValue::Text(v)) => self.names.formatted = v,
            (Field::StructuredName, FieldValue::Name(v)) => self.names.structured = v,
            (Field::Emails, FieldValue::List(v)) => self.emails = v,
            (Field::Phones, FieldValue::List(v)) => self.phones = v,
            (Field::Organization, FieldValue::Org(v)) => self.organization = v,
            (Field::JobTitle, FieldValue::Text(v)) => self.job_title = v,
            (Field::Photo, FieldValue::Photo(v)) => self.photo = v,
            (Field::Notes, FieldValue::Text(v)) => self.notes = v,
            (field, value) => {
                tracing::warn!(
                    "Ignoring mismatched value for field {} on record {}: {:?}",
                    field,
                    self.id,
                    value
                );
            }
        }
    }

    /// Parameters recorded for an email (`EMAIL`) or phone (`TEL`) value.
    pub fn params_for(&self, property: &str, value: &str) -> &[String] {
        let key = value_key(property, value);
        self.value_params
            .iter()
            .find(|p| p.matches(property, &key))
            .map(|p| p.params.as_slice())
            .unwrap_or_default()
    }

    /// Records parameters for a value, merging with any already known for it.
    pub fn add_params(&mut self, property: &str, value: &str, params: &[String]) {
        if params.is_empty() {
            return;
        }
        let key = value_key(property, value);
        if key.is_empty() {
            return;
        }
        match self.value_params.iter_mut().find(|p| p.matches(property, &key)) {
            Some(existing) => {
                for param in params {
                    if !existing.params.iter().any(|p| p.eq_ignore_ascii_case(param)) {
                        existing.params.push(param.clone());
                    }
                }
            }
            None => self.value_params.push(ValueParams {
                property: property.to_string(),
                key,
                params: params.to_vec(),
            }),
        }
    }

    /// Number of populated fields, used to pick merge survivors.
    pub fn non_null_field_count(&self) -> usize {
        ALL_FIELDS
            .iter()
            .filter(|f| !self.get(**f).is_null())
            .count()
    }
}

/// Every addressable field, in export order.
pub const ALL_FIELDS: [Field; 8] = [
    Field::FormattedName,
    Field::StructuredName,
    Field::Organization,
    Field::JobTitle,
    Field::Emails,
    Field::Phones,
    Field::Photo,
    Field::Notes,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance() -> Provenance {
        Provenance {
            source: "phone".to_string(),
            imported_at: Utc::now(),
        }
    }

    #[test]
    fn test_structured_display_order() {
        let n = StructuredName {
            family: "Doe".to_string(),
            given: "Jane".to_string(),
            additional: "Q".to_string(),
            prefixes: "Dr.".to_string(),
            suffixes: "PhD".to_string(),
        };
        assert_eq!(n.display(), "Dr. Jane Q Doe PhD");
        assert!(!n.is_empty());
        assert!(StructuredName::default().is_empty());
    }

    #[test]
    fn test_field_roundtrip_and_count() {
        let mut r = Record::new("r1", provenance());
        assert_eq!(r.non_null_field_count(), 0);

        r.set(Field::Emails, FieldValue::List(vec!["a@b.com".to_string()]));
        r.set(Field::FormattedName, FieldValue::Text(Some("Jane".to_string())));
        assert_eq!(r.emails, vec!["a@b.com"]);
        assert_eq!(r.non_null_field_count(), 2);

        // Mismatched kinds leave the record untouched
        r.set(Field::Emails, FieldValue::Text(Some("x".to_string())));
        assert_eq!(r.emails, vec!["a@b.com"]);
    }

    #[test]
    fn test_property_params() {
        let mut p = Property::new("tel", "555");
        p.params = vec!["TYPE=WORK,VOICE".to_string(), "PREF".to_string()];
        assert_eq!(p.name, "TEL");
        assert_eq!(p.param("type"), Some("WORK,VOICE"));
        assert!(p.has_flag("voice"));
        assert!(p.has_flag("pref"));
        assert!(!p.has_flag("cell"));
    }

    #[test]
    fn test_family_name_fallback() {
        let mut r = Record::new("r1", provenance());
        r.names.formatted = Some("Ada King Lovelace".to_string());
        assert_eq!(r.family_name().as_deref(), Some("Lovelace"));
        r.names.structured = Some(StructuredName {
            family: "King".to_string(),
            ..Default::default()
        });
        assert_eq!(r.family_name().as_deref(), Some("King"));
    }
}
