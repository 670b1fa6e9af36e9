//! Title-casing for personal names.
//!
//! Only tokens written entirely in upper or entirely in lower case are
//! rewritten; mixed-case tokens ("McDonald", "DeVito") are taken as
//! deliberate. That rule is what makes the rewrite idempotent.

/// Lower-case particles kept lower-case when they are not the leading token.
const PARTICLES: &[&str] = &[
    "van", "von", "de", "der", "den", "del", "della", "di", "da", "dos", "das", "du", "la", "le",
    "ter", "ten", "bin", "ibn",
];

/// Generational and degree suffixes with their canonical spelling.
const SUFFIXES: &[(&str, &str)] = &[
    ("jr", "Jr"),
    ("sr", "Sr"),
    ("ii", "II"),
    ("iii", "III"),
    ("iv", "IV"),
    ("phd", "PhD"),
    ("md", "MD"),
    ("dds", "DDS"),
    ("esq", "Esq"),
    ("cpa", "CPA"),
    ("mba", "MBA"),
];

/// Which name component a text belongs to; governs leading-token handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamePart {
    Formatted,
    Given,
    Family,
    Additional,
    Prefix,
    Suffix,
}

/// Recases every whitespace-separated token of `text`, keeping the whitespace as is.
pub fn recase_name(text: &str, part: NamePart) -> String {
    let token_count = text.split_whitespace().count();
    let mut out = String::with_capacity(text.len());
    let mut token = String::new();
    let mut index = 0;

    let mut flush = |token: &mut String, out: &mut String, index: &mut usize| {
        if token.is_empty() {
            return;
        }
        let leading = match part {
            // "van der Berg" inside N.family stays lower unless it is the whole field
            NamePart::Family => token_count == 1,
            _ => *index == 0,
        };
        out.push_str(&recase_token(token, leading, part == NamePart::Suffix));
        token.clear();
        *index += 1;
    };

    for c in text.chars() {
        if c.is_whitespace() {
            flush(&mut token, &mut out, &mut index);
            out.push(c);
        } else {
            token.push(c);
        }
    }
    flush(&mut token, &mut out, &mut index);
    out
}

fn recase_token(token: &str, leading: bool, suffix_field: bool) -> String {
    let letters: Vec<char> = token.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() || !looks_like_name(token) {
        return token.to_string();
    }
    let all_upper = letters.iter().all(|c| !c.is_lowercase());
    let all_lower = letters.iter().all(|c| !c.is_uppercase());
    if !all_upper && !all_lower {
        return token.to_string();
    }

    let core = token.trim_end_matches(|c: char| c == '.' || c == ',');
    let tail = &token[core.len()..];
    let key = core.to_lowercase();

    if !leading || suffix_field {
        if let Some((_, canonical)) = SUFFIXES.iter().find(|(k, _)| *k == key) {
            return format!("{}{}", canonical, tail);
        }
    }
    if !leading && !suffix_field && PARTICLES.contains(&key.as_str()) {
        return token.to_lowercase();
    }

    token
        .split('-')
        .map(capitalize_part)
        .collect::<Vec<_>>()
        .join("-")
}

/// Email local parts, handles and dotted initials ("J.R.") are not recased.
fn looks_like_name(token: &str) -> bool {
    let core = token.trim_end_matches(['.', ',']);
    !token.chars().any(|c| c.is_ascii_digit() || c == '@' || c == '_') && !core.contains('.')
}

fn capitalize_part(part: &str) -> String {
    let lower = part.to_lowercase();
    if let Some(rest) = lower.strip_prefix("mc") {
        if rest.chars().count() >= 2 {
            return format!("Mc{}", capitalize_first(rest));
        }
    }
    // o'brien, d'angelo, l'estrange: capitalize after a one-letter prefix
    for apostrophe in ['\'', '\u{2019}'] {
        if let Some((head, rest)) = lower.split_once(apostrophe) {
            if head.chars().count() == 1 && !rest.is_empty() {
                return format!(
                    "{}{}{}",
                    capitalize_first(head),
                    apostrophe,
                    capitalize_first(rest)
                );
            }
        }
    }
    capitalize_first(&lower)
}

fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
