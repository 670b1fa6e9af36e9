//! Shared normalization helpers for the rewriter, blocking and scoring stages.
//!
//! This module provides:
//! 1. Email syntax checks, comparison keys and derivable repairs
//! 2. Phone canonicalization against a default region (cached)
//! 3. Organization names with legal suffixes stripped
//! 4. Phonetic (Soundex) codes for family names
use moka::sync::Cache;
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use std::sync::OnceLock;

use crate::errors::PipelineError;

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    // RFC 5322 simplified: local@domain.tld
    EMAIL.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email pattern is valid")
    })
}

/// Basic syntactic email check: `local@domain.tld`, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    email.len() >= 5 && email_regex().is_match(email)
}

/// Case-insensitive comparison key for an email address.
pub fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Display form: trimmed, `mailto:` removed, domain lower-cased, local part preserved.
pub fn email_display(email: &str) -> String {
    let trimmed = email.trim();
    let trimmed = strip_prefix_ignore_case(trimmed, "mailto:").unwrap_or(trimmed);
    match trimmed.rsplit_once('@') {
        Some((local, domain)) => format!("{}@{}", local, domain.to_lowercase()),
        None => trimmed.to_string(),
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn obfuscation_regex() -> &'static Regex {
    static AT: OnceLock<Regex> = OnceLock::new();
    AT.get_or_init(|| {
        Regex::new(r"(?i)\s*[\[\(\{]\s*at\s*[\]\)\}]\s*|\s+at\s+").expect("at pattern is valid")
    })
}

fn dot_regex() -> &'static Regex {
    static DOT: OnceLock<Regex> = OnceLock::new();
    DOT.get_or_init(|| {
        Regex::new(r"(?i)\s*[\[\(\{]\s*dot\s*[\]\)\}]\s*|\s+dot\s+").expect("dot pattern is valid")
    })
}

/// Attempts to derive a syntactically valid address from a malformed one.
///
/// Handles `Name <addr>`, `mailto:`, `user at example dot com` style
/// obfuscation, stray whitespace and trailing punctuation. Returns `None`
/// when nothing valid can be derived.
pub fn derive_email(raw: &str) -> Option<String> {
    let mut candidate = raw.trim().to_string();
    if let (Some(open), Some(close)) = (candidate.find('<'), candidate.rfind('>')) {
        if open < close {
            candidate = candidate[open + 1..close].to_string();
        }
    }
    if let Some(rest) = strip_prefix_ignore_case(&candidate, "mailto:") {
        candidate = rest.to_string();
    }
    if !candidate.contains('@') {
        candidate = obfuscation_regex().replace(&candidate, "@").into_owned();
        candidate = dot_regex().replace_all(&candidate, ".").into_owned();
    }
    let candidate: String = candidate.chars().filter(|c| !c.is_whitespace()).collect();
    let candidate = candidate
        .trim_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '"' | '\''))
        .to_string();
    let display = email_display(&candidate);
    is_valid_email(&display).then_some(display)
}

// ============ Phones ============

/// Result of parsing one phone string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneOutcome {
    /// Parsed; `e164` is the canonical form. `validated` is false when the
    /// number parses but is not an assigned range for its region.
    Canonical { e164: String, validated: bool },
    /// Left untouched; the reason goes into the quality report.
    Unparseable(String),
}

/// Parses phone strings against a default region, memoising results.
///
/// The cache is shared by every worker of a batch.
#[derive(Clone)]
pub struct PhoneCanonicalizer {
    region: CountryId,
    cache: Cache<String, PhoneOutcome>,
}

impl std::fmt::Debug for PhoneCanonicalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoneCanonicalizer")
            .field("region", &self.region)
            .field("cached", &self.cache.entry_count())
            .finish()
    }
}

impl PhoneCanonicalizer {
    /// `region` is an ISO 3166 alpha-2 code such as `US` or `BR`.
    pub fn new(region: &str, capacity: u64) -> Result<Self, PipelineError> {
        let region = region
            .trim()
            .to_ascii_uppercase()
            .parse::<CountryId>()
            .map_err(|_| PipelineError::Config(format!("unknown phone region '{}'", region)))?;
        Ok(Self {
            region,
            cache: Cache::new(capacity),
        })
    }

    pub fn region(&self) -> CountryId {
        self.region
    }

    pub fn canonicalize(&self, raw: &str) -> PhoneOutcome {
        let key = raw.trim().to_string();
        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }
        let outcome = self.parse_uncached(&key);
        self.cache.insert(key, outcome.clone());
        outcome
    }

    fn parse_uncached(&self, raw: &str) -> PhoneOutcome {
        let digits = raw.chars().filter(|c| c.is_ascii_digit()).count();
        if digits < 7 {
            return PhoneOutcome::Unparseable("too few digits".to_string());
        }
        // letters mean extensions or vanity text E.164 cannot carry
        if raw.chars().any(|c| c.is_alphabetic()) {
            return PhoneOutcome::Unparseable("contains letters or an extension".to_string());
        }
        match phonenumber::parse(Some(self.region), raw) {
            Ok(number) => {
                let e164 = number.format().mode(Mode::E164).to_string();
                let validated = phonenumber::is_valid(&number);
                if !validated {
                    tracing::debug!("Phone {} parsed as {} but is not an assigned range", raw, e164);
                }
                PhoneOutcome::Canonical { e164, validated }
            }
            Err(e) => {
                tracing::debug!("Failed to parse phone '{}': {:?}", raw, e);
                PhoneOutcome::Unparseable(format!("parse error: {:?}", e))
            }
        }
    }
}

/// Digits-only comparison key for a phone (country prefix kept when present).
pub fn phone_key(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Whether two phone keys denote the same line: equal, or one is the other
/// with a country prefix (at least 10 trailing digits in common).
pub fn phones_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= 10 && long.ends_with(short)
}

// ============ Organizations ============

const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "llc", "llp", "lp", "ltd", "limited", "corp", "corporation", "co",
    "company", "plc", "gmbh", "ag", "sa", "sas", "sarl", "bv", "nv", "pty", "srl", "spa", "oy",
    "ab", "as", "kk", "ltda", "eireli", "me",
];

/// Lower-cased organization name with punctuation removed and trailing legal
/// suffixes (`Inc.`, `GmbH`, `Ltd`, ...) stripped. Never strips to empty.
pub fn organization_key(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .replace('&', " and ")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    // "s.a." and "l.l.c." split into single letters; glue runs of them back
    let mut tokens: Vec<String> = Vec::new();
    for token in cleaned.split_whitespace() {
        match tokens.last_mut() {
            Some(prev)
                if token.chars().count() == 1
                    && prev.chars().all(|c| c.is_alphabetic())
                    && prev.chars().count() < 4
                    && is_initialism_run(prev) =>
            {
                prev.push_str(token)
            }
            _ => tokens.push(token.to_string()),
        }
    }
    while tokens.len() > 1 {
        match tokens.last() {
            Some(last) if LEGAL_SUFFIXES.contains(&last.as_str()) => {
                tokens.pop();
            }
            _ => break,
        }
    }
    tokens.join(" ")
}

fn is_initialism_run(token: &str) -> bool {
    // only glue tokens that were themselves built from single letters
    token.chars().count() == 1 || LEGAL_SUFFIXES.iter().any(|s| s.starts_with(token))
}

// ============ Names ============

/// Lower-cased name with punctuation dropped and whitespace collapsed.
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// American Soundex code (letter + three digits) of the ASCII letters in `name`.
pub fn soundex(name: &str) -> Option<String> {
    fn code(c: char) -> Option<char> {
        match c {
            'b' | 'f' | 'p' | 'v' => Some('1'),
            'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => Some('2'),
            'd' | 't' => Some('3'),
            'l' => Some('4'),
            'm' | 'n' => Some('5'),
            'r' => Some('6'),
            _ => None,
        }
    }

    let letters: Vec<char> = name
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let first = *letters.first()?;
    let mut out = String::with_capacity(4);
    out.push(first.to_ascii_uppercase());
    let mut last = code(first);
    for &c in &letters[1..] {
        match code(c) {
            Some(digit) => {
                if last != Some(digit) {
                    out.push(digit);
                    if out.len() == 4 {
                        break;
                    }
                }
                last = Some(digit);
            }
            // h and w do not separate equal codes; vowels do
            None if c == 'h' || c == 'w' => {}
            None => last = None,
        }
    }
    while out.len() < 4 {
        out.push('0');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_emails() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("test.user@example.com"));
        assert!(is_valid_email("user+tag@example.co.uk"));
        assert!(!is_valid_email("userexample.com"));
        assert!(!is_valid_email("user@examplecom"));
        assert!(!is_valid_email("user @example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn test_email_display_and_key() {
        assert_eq!(email_display(" John.Doe@Example.COM "), "John.Doe@example.com");
        assert_eq!(email_display("mailto:a@B.org"), "a@b.org");
        assert_eq!(email_key("John.Doe@Example.COM"), "john.doe@example.com");
    }

    #[test]
    fn test_derive_email() {
        assert_eq!(
            derive_email("Jane Doe <jane@Example.com>").as_deref(),
            Some("jane@example.com")
        );
        assert_eq!(
            derive_email("jane at example dot com").as_deref(),
            Some("jane@example.com")
        );
        assert_eq!(derive_email("jane@example.com.").as_deref(), Some("jane@example.com"));
        assert_eq!(derive_email("not an email"), None);
    }

    #[test]
    fn test_phone_canonicalization() {
        let canon = PhoneCanonicalizer::new("US", 100).unwrap();
        match canon.canonicalize("555-123-4567") {
            PhoneOutcome::Canonical { e164, .. } => assert_eq!(e164, "+15551234567"),
            other => panic!("unexpected {:?}", other),
        }
        match canon.canonicalize("(650) 253-0000") {
            PhoneOutcome::Canonical { e164, validated } => {
                assert_eq!(e164, "+16502530000");
                assert!(validated);
            }
            other => panic!("unexpected {:?}", other),
        }
        // canonical output parses to itself
        assert_eq!(
            canon.canonicalize("+16502530000"),
            PhoneOutcome::Canonical {
                e164: "+16502530000".to_string(),
                validated: true
            }
        );
        assert!(matches!(canon.canonicalize("12"), PhoneOutcome::Unparseable(_)));
        assert!(matches!(
            canon.canonicalize("555-123-4567 ext 12"),
            PhoneOutcome::Unparseable(_)
        ));
    }

    #[test]
    fn test_brazilian_region() {
        let canon = PhoneCanonicalizer::new("br", 10).unwrap();
        assert_eq!(
            canon.canonicalize("(11) 98765-4321"),
            PhoneOutcome::Canonical {
                e164: "+5511987654321".to_string(),
                validated: true
            }
        );
        assert!(PhoneCanonicalizer::new("XX-unknown", 10).is_err());
    }

    #[test]
    fn test_phones_match() {
        assert!(phones_match("15551234567", "15551234567"));
        assert!(phones_match("5551234567", "15551234567"));
        assert!(!phones_match("1234567", "5551234567"));
        assert!(!phones_match("", ""));
    }

    #[test]
    fn test_organization_key() {
        assert_eq!(organization_key("Acme"), "acme");
        assert_eq!(organization_key("Acme Inc."), "acme");
        assert_eq!(organization_key("ACME, Inc"), "acme");
        assert_eq!(organization_key("Acme Co. Ltd"), "acme");
        assert_eq!(organization_key("Widgets S.A."), "widgets");
        assert_eq!(organization_key("Smith & Sons"), "smith and sons");
        assert_eq!(organization_key("Inc"), "inc");
    }

    #[test]
    fn test_soundex() {
        assert_eq!(soundex("Robert").as_deref(), Some("R163"));
        assert_eq!(soundex("Rupert").as_deref(), Some("R163"));
        assert_eq!(soundex("Ashcraft").as_deref(), Some("A261"));
        assert_eq!(soundex("Tymczak").as_deref(), Some("T522"));
        assert_eq!(soundex("Lee").as_deref(), Some("L000"));
        assert_eq!(soundex("Smith"), soundex("Smyth"));
        assert_eq!(soundex("123"), None);
    }

    #[test]
    fn test_name_key() {
        assert_eq!(name_key("  O'Brien,  JOHN "), "o brien john");
    }
}
