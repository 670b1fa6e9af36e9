//! Quality rewriting: non-structural normalization of clean records.
//!
//! Each rule implements [`RewriteRule`] and only *proposes* edits; the
//! [`QualityRewriter`] applies proposals in rule order, so rules can be
//! enabled or disabled per deployment without touching the orchestration.
//! Every built-in rule is idempotent.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

use crate::casing::{recase_name, NamePart};
use crate::errors::PipelineError;
use crate::models::{Field, FieldValue, Record, RecordId, StructuredName};
use crate::normalize::{
    derive_email, email_display, email_key, is_valid_email, phone_key, PhoneCanonicalizer,
    PhoneOutcome,
};

// ============ Proposals ============

/// One field change proposed by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEdit {
    pub field: Field,
    pub before: FieldValue,
    pub after: FieldValue,
    pub reason: String,
}

/// Something a human should look at; never changes the record by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QualityFlag {
    /// Phone left as written because it could not be parsed.
    UnparseablePhone { value: String, reason: String },
    /// Malformed email replaced by a derived address.
    EmailReplaced { original: String, replacement: String },
    /// Malformed email dropped; nothing valid could be derived from it.
    EmailRemoved { value: String },
    /// The rewrite raised the structural error count and was thrown away.
    RewriteDiscarded {
        errors_before: usize,
        errors_after: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    pub edits: Vec<FieldEdit>,
    pub flags: Vec<QualityFlag>,
}

impl Proposal {
    fn edit(&mut self, field: Field, before: FieldValue, after: FieldValue, reason: &str) {
        if before != after {
            self.edits.push(FieldEdit {
                field,
                before,
                after,
                reason: reason.to_string(),
            });
        }
    }
}

/// A quality rule. Implementations must be pure and idempotent.
pub trait RewriteRule: Send + Sync {
    /// Name used in configuration and reports.
    fn name(&self) -> &'static str;

    /// Proposes edits for `record` without mutating it.
    fn propose(&self, record: &Record) -> Proposal;
}

// ============ Report ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedEdit {
    pub rule: String,
    #[serde(flatten)]
    pub edit: FieldEdit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFlag {
    pub rule: String,
    #[serde(flatten)]
    pub flag: QualityFlag,
}

/// Changes applied to one record by the rewriter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub record_id: RecordId,
    pub version_before: u64,
    pub version_after: u64,
    pub edits: Vec<AppliedEdit>,
    pub flags: Vec<RuleFlag>,
}

impl QualityReport {
    pub fn changed(&self) -> bool {
        !self.edits.is_empty()
    }
}

// ============ Rewriter ============

/// Names of the built-in rules, in application order.
pub const BUILTIN_RULES: [&str; 5] = ["extraction", "name-casing", "phone", "email", "dedup"];

/// Ordered collection of rewrite rules.
pub struct QualityRewriter {
    rules: Vec<Box<dyn RewriteRule>>,
}

impl std::fmt::Debug for QualityRewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityRewriter")
            .field("rules", &self.rule_names())
            .finish()
    }
}

impl QualityRewriter {
    pub fn new(rules: Vec<Box<dyn RewriteRule>>) -> Self {
        Self { rules }
    }

    /// All built-in rules.
    pub fn with_defaults(phones: PhoneCanonicalizer) -> Self {
        Self::new(
            BUILTIN_RULES
                .iter()
                .filter_map(|name| builtin_rule(name, &phones))
                .collect(),
        )
    }

    /// The built-in rules named in `enabled` (empty means all), in canonical order.
    pub fn from_names(enabled: &[String], phones: PhoneCanonicalizer) -> Result<Self, PipelineError> {
        if enabled.is_empty() {
            return Ok(Self::with_defaults(phones));
        }
        if let Some(unknown) = enabled
            .iter()
            .find(|name| !BUILTIN_RULES.contains(&name.as_str()))
        {
            return Err(PipelineError::Config(format!(
                "unknown quality rule '{}' (known: {})",
                unknown,
                BUILTIN_RULES.join(", ")
            )));
        }
        Ok(Self::new(
            BUILTIN_RULES
                .iter()
                .filter(|name| enabled.iter().any(|e| e == *name))
                .filter_map(|name| builtin_rule(name, &phones))
                .collect(),
        ))
    }

    /// Appends a rule after the existing ones.
    pub fn push(&mut self, rule: Box<dyn RewriteRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Applies every rule in order. The version is bumped once if anything changed.
    pub fn rewrite(&self, record: &Record) -> (Record, QualityReport) {
        let mut current = record.clone();
        let mut edits = Vec::new();
        let mut flags = Vec::new();

        for rule in &self.rules {
            let proposal = rule.propose(&current);
            for edit in proposal.edits {
                current.set(edit.field, edit.after.clone());
                edits.push(AppliedEdit {
                    rule: rule.name().to_string(),
                    edit,
                });
            }
            flags.extend(proposal.flags.into_iter().map(|flag| RuleFlag {
                rule: rule.name().to_string(),
                flag,
            }));
        }

        if !edits.is_empty() {
            current.touch();
            debug!(
                "Rewrote record {} (v{} -> v{}): {} edit(s)",
                current.id,
                record.version,
                current.version,
                edits.len()
            );
        }
        let report = QualityReport {
            record_id: record.id.clone(),
            version_before: record.version,
            version_after: current.version,
            edits,
            flags,
        };
        (current, report)
    }
}

fn builtin_rule(name: &str, phones: &PhoneCanonicalizer) -> Option<Box<dyn RewriteRule>> {
    match name {
        "extraction" => Some(Box::new(ExtractionRule {
            phones: phones.clone(),
        })),
        "name-casing" => Some(Box::new(NameCasingRule)),
        "phone" => Some(Box::new(PhoneRule {
            phones: phones.clone(),
        })),
        "email" => Some(Box::new(EmailRule)),
        "dedup" => Some(Box::new(DedupRule)),
        _ => None,
    }
}

// ============ Field-leakage extraction ============

fn email_in_text() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}")
            .expect("note email pattern is valid")
    })
}

fn phone_in_text() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\+?\(?\d[\d\s().-]{6,}\d").expect("note phone pattern is valid")
    })
}

/// Moves emails and phone numbers written into the notes into their own fields.
pub struct ExtractionRule {
    pub phones: PhoneCanonicalizer,
}

impl ExtractionRule {
    fn phone_candidate(&self, text: &str) -> Option<String> {
        let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
        // dates and short codes are not numbers worth moving
        let plausible = digits >= 10 || (text.starts_with('+') && digits >= 8);
        if !plausible || digits > 15 {
            return None;
        }
        match self.phones.canonicalize(text) {
            PhoneOutcome::Canonical { e164, .. } => Some(e164),
            PhoneOutcome::Unparseable(_) => None,
        }
    }
}

impl RewriteRule for ExtractionRule {
    fn name(&self) -> &'static str {
        "extraction"
    }

    fn propose(&self, record: &Record) -> Proposal {
        let mut proposal = Proposal::default();
        let Some(notes) = &record.notes else {
            return proposal;
        };

        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut emails = record.emails.clone();
        let mut phones = record.phones.clone();

        for m in email_in_text().find_iter(notes) {
            let found = email_display(m.as_str());
            if !emails.iter().any(|e| email_key(e) == email_key(&found)) {
                emails.push(found);
            }
            spans.push((m.start(), m.end()));
        }
        for m in phone_in_text().find_iter(notes) {
            if spans.iter().any(|(s, e)| m.start() < *e && *s < m.end()) {
                continue;
            }
            let text = m.as_str().trim();
            if let Some(e164) = self.phone_candidate(text) {
                if !phones.iter().any(|p| phone_key(p) == phone_key(&e164)) {
                    phones.push(e164);
                }
                spans.push((m.start(), m.end()));
            }
        }
        if spans.is_empty() {
            return proposal;
        }

        spans.sort_unstable();
        let mut stripped = String::with_capacity(notes.len());
        let mut cursor = 0;
        for (start, end) in spans {
            stripped.push_str(&notes[cursor..start]);
            cursor = end;
        }
        stripped.push_str(&notes[cursor..]);
        let cleaned = tidy_lines(&stripped);

        proposal.edit(
            Field::Emails,
            FieldValue::List(record.emails.clone()),
            FieldValue::List(emails),
            "email found in notes",
        );
        proposal.edit(
            Field::Phones,
            FieldValue::List(record.phones.clone()),
            FieldValue::List(phones),
            "phone found in notes",
        );
        proposal.edit(
            Field::Notes,
            FieldValue::Text(record.notes.clone()),
            FieldValue::Text((!cleaned.is_empty()).then_some(cleaned)),
            "extracted values stripped from notes",
        );
        proposal
    }
}

/// Collapses runs of spaces, trims every line and drops lines left empty.
fn tidy_lines(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ============ Name casing ============

/// Title-cases names written in all caps or all lower case.
pub struct NameCasingRule;

impl RewriteRule for NameCasingRule {
    fn name(&self) -> &'static str {
        "name-casing"
    }

    fn propose(&self, record: &Record) -> Proposal {
        let mut proposal = Proposal::default();
        if let Some(formatted) = &record.names.formatted {
            proposal.edit(
                Field::FormattedName,
                FieldValue::Text(Some(formatted.clone())),
                FieldValue::Text(Some(recase_name(formatted, NamePart::Formatted))),
                "name casing",
            );
        }
        if let Some(n) = &record.names.structured {
            let recased = StructuredName {
                family: recase_name(&n.family, NamePart::Family),
                given: recase_name(&n.given, NamePart::Given),
                additional: recase_name(&n.additional, NamePart::Additional),
                prefixes: recase_name(&n.prefixes, NamePart::Prefix),
                suffixes: recase_name(&n.suffixes, NamePart::Suffix),
            };
            proposal.edit(
                Field::StructuredName,
                FieldValue::Name(Some(n.clone())),
                FieldValue::Name(Some(recased)),
                "name casing",
            );
        }
        proposal
    }
}

// ============ Phones ============

/// Rewrites parseable phones to E.164; unparseable ones are kept and flagged.
pub struct PhoneRule {
    pub phones: PhoneCanonicalizer,
}

impl RewriteRule for PhoneRule {
    fn name(&self) -> &'static str {
        "phone"
    }

    fn propose(&self, record: &Record) -> Proposal {
        let mut proposal = Proposal::default();
        let mut rewritten = Vec::with_capacity(record.phones.len());
        for phone in &record.phones {
            match self.phones.canonicalize(phone) {
                PhoneOutcome::Canonical { e164, .. } => rewritten.push(e164),
                PhoneOutcome::Unparseable(reason) => {
                    proposal.flags.push(QualityFlag::UnparseablePhone {
                        value: phone.clone(),
                        reason,
                    });
                    rewritten.push(phone.clone());
                }
            }
        }
        proposal.edit(
            Field::Phones,
            FieldValue::List(record.phones.clone()),
            FieldValue::List(rewritten),
            "canonical international form",
        );
        proposal
    }
}

// ============ Emails ============

/// Normalizes email display forms; repairs or drops malformed addresses.
pub struct EmailRule;

impl RewriteRule for EmailRule {
    fn name(&self) -> &'static str {
        "email"
    }

    fn propose(&self, record: &Record) -> Proposal {
        let mut proposal = Proposal::default();
        let mut rewritten = Vec::with_capacity(record.emails.len());
        for email in &record.emails {
            let display = email_display(email);
            if is_valid_email(&display) {
                rewritten.push(display);
                continue;
            }
            match derive_email(email) {
                Some(replacement) => {
                    proposal.flags.push(QualityFlag::EmailReplaced {
                        original: email.clone(),
                        replacement: replacement.clone(),
                    });
                    rewritten.push(replacement);
                }
                None => proposal.flags.push(QualityFlag::EmailRemoved {
                    value: email.clone(),
                }),
            }
        }
        proposal.edit(
            Field::Emails,
            FieldValue::List(record.emails.clone()),
            FieldValue::List(rewritten),
            "email normalization",
        );
        proposal
    }
}

// ============ Intra-record de-duplication ============

/// Drops values that duplicate an earlier one under email/phone normalization.
pub struct DedupRule;

fn dedup_by<F: Fn(&str) -> String>(values: &[String], key: F) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter(|v| seen.insert(key(v)))
        .cloned()
        .collect()
}

impl RewriteRule for DedupRule {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn propose(&self, record: &Record) -> Proposal {
        let mut proposal = Proposal::default();
        proposal.edit(
            Field::Emails,
            FieldValue::List(record.emails.clone()),
            FieldValue::List(dedup_by(&record.emails, email_key)),
            "duplicate email",
        );
        proposal.edit(
            Field::Phones,
            FieldValue::List(record.phones.clone()),
            FieldValue::List(dedup_by(&record.phones, |p| {
                let key = phone_key(p);
                // values without digits only collapse when written the same
                if key.is_empty() {
                    p.trim().to_string()
                } else {
                    key
                }
            })),
            "duplicate phone",
        );
        proposal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provenance;
    use chrono::Utc;

    fn phones() -> PhoneCanonicalizer {
        PhoneCanonicalizer::new("US", 1_000).unwrap()
    }

    fn record() -> Record {
        let mut r = Record::new(
            "r1",
            Provenance {
                source: "test".to_string(),
                imported_at: Utc::now(),
            },
        );
        r.format_version = Some("3.0".to_string());
        r.names.formatted = Some("Jane Doe".to_string());
        r
    }

    #[test]
    fn test_extracts_phone_from_notes() {
        let mut r = record();
        r.notes = Some("reach me at 555-123-4567".to_string());
        let (out, report) = QualityRewriter::with_defaults(phones()).rewrite(&r);
        assert_eq!(out.phones, vec!["+15551234567"]);
        assert_eq!(out.notes.as_deref(), Some("reach me at"));
        assert_eq!(out.version, r.version + 1);
        assert!(report.changed());
    }

    #[test]
    fn test_extracts_email_and_keeps_other_text() {
        let mut r = record();
        r.emails.push("jane@example.com".to_string());
        r.notes = Some("work: JANE@Example.com\nbirthday 2020-01-02\npersonal j.doe@mail.org".to_string());
        let proposal = ExtractionRule { phones: phones() }.propose(&r);
        let mut out = r.clone();
        for e in proposal.edits {
            out.set(e.field, e.after);
        }
        assert_eq!(out.emails, vec!["jane@example.com", "j.doe@mail.org"]);
        assert!(out.phones.is_empty());
        assert_eq!(out.notes.as_deref(), Some("work:\nbirthday 2020-01-02\npersonal"));
    }

    #[test]
    fn test_notes_emptied_become_none() {
        let mut r = record();
        r.notes = Some("  +1 650 253 0000 ".to_string());
        let (out, _) = QualityRewriter::with_defaults(phones()).rewrite(&r);
        assert_eq!(out.phones, vec!["+16502530000"]);
        assert_eq!(out.notes, None);
    }

    #[test]
    fn test_unparseable_phone_kept_and_flagged() {
        let mut r = record();
        r.phones = vec!["ext. 12".to_string(), "(650) 253-0000".to_string()];
        let (out, report) = QualityRewriter::with_defaults(phones()).rewrite(&r);
        assert_eq!(out.phones, vec!["ext. 12", "+16502530000"]);
        assert!(report.flags.iter().any(|f| matches!(
            &f.flag,
            QualityFlag::UnparseablePhone { value, .. } if value == "ext. 12"
        )));
    }

    #[test]
    fn test_email_rules() {
        let mut r = record();
        r.emails = vec![
            "John.Doe@EXAMPLE.com".to_string(),
            "john.doe@example.com".to_string(),
            "jane at example dot org".to_string(),
            "not an email".to_string(),
        ];
        let (out, report) = QualityRewriter::with_defaults(phones()).rewrite(&r);
        assert_eq!(out.emails, vec!["John.Doe@example.com", "jane@example.org"]);
        let kinds: Vec<&QualityFlag> = report.flags.iter().map(|f| &f.flag).collect();
        assert!(kinds.contains(&&QualityFlag::EmailRemoved {
            value: "not an email".to_string()
        }));
        assert!(kinds.iter().any(|f| matches!(f, QualityFlag::EmailReplaced { .. })));
    }

    #[test]
    fn test_name_casing_rule() {
        let mut r = record();
        r.names.formatted = Some("JOHN O'BRIEN JR".to_string());
        r.names.structured = Some(StructuredName {
            family: "o'brien".to_string(),
            given: "JOHN".to_string(),
            suffixes: "JR".to_string(),
            ..Default::default()
        });
        let (out, _) = QualityRewriter::with_defaults(phones()).rewrite(&r);
        assert_eq!(out.display_name(), Some("John O'Brien Jr"));
        let n = out.names.structured.unwrap();
        assert_eq!((n.family.as_str(), n.given.as_str(), n.suffixes.as_str()), ("O'Brien", "John", "Jr"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let mut r = record();
        r.names.formatted = Some("MARIA DE LA CRUZ".to_string());
        r.emails = vec!["A@B.COM".to_string(), "a@b.com".to_string()];
        r.phones = vec!["650.253.0000".to_string(), "+1 (650) 253-0000".to_string()];
        r.notes = Some("fax 212 555 0199 after 5".to_string());
        let rewriter = QualityRewriter::with_defaults(phones());
        let (once, _) = rewriter.rewrite(&r);
        let (twice, report) = rewriter.rewrite(&once);
        assert_eq!(once, twice);
        assert!(!report.changed());
        assert_eq!(once.phones, vec!["+16502530000", "+12125550199"]);
    }

    #[test]
    fn test_rule_selection() {
        let only = QualityRewriter::from_names(&["dedup".to_string(), "phone".to_string()], phones())
            .unwrap();
        assert_eq!(only.rule_names(), vec!["phone", "dedup"]);
        assert!(QualityRewriter::from_names(&["bogus".to_string()], phones()).is_err());
        assert_eq!(
            QualityRewriter::from_names(&[], phones()).unwrap().rule_names(),
            BUILTIN_RULES.to_vec()
        );
    }
}
