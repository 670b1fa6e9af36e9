//! vCard (RFC 2426 / RFC 6350) codec.
//!
//! Parsing is lenient: continuation lines are unfolded, quoted-printable soft
//! breaks are joined, a content line without a colon is treated as a broken
//! fold of the previous property, and properties the record model does not
//! interpret are kept verbatim. Only text that cannot be read as a card at all
//! (no `END:VCARD`, stray content outside a card) is a parse failure.
//!
//! Serialization is deterministic so that an imported record exports to the
//! same text every time.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::models::{Organization, Photo, Property, Provenance, Record, StructuredName};

/// Line length limit in octets, excluding the CRLF.
const FOLD_WIDTH: usize = 75;

/// Version written when a record carries no marker.
pub const DEFAULT_VERSION: &str = "3.0";

/// One card as read from the text, before interpretation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCard {
    /// Content lines between `BEGIN:VCARD` and `END:VCARD`.
    pub properties: Vec<Property>,
    /// Lenient-parse notes (broken folds, oversized `N`, ...).
    pub warnings: Vec<String>,
}

impl RawCard {
    pub fn first(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// A chunk of input that could not be read as a card.
#[derive(Debug, Clone, PartialEq)]
pub struct CardParseFailure {
    /// Position of the chunk among the cards of the input.
    pub index: usize,
    pub reason: String,
    /// The offending text, for the review queue.
    pub raw: String,
}

/// Splits a text holding any number of cards.
///
/// Returns one entry per card (or per unreadable chunk) in input order.
pub fn split_cards(text: &str) -> Vec<Result<RawCard, CardParseFailure>> {
    let lines = unfold(text);
    let mut out = Vec::new();
    let mut current: Option<(RawCard, Vec<String>)> = None;
    let mut nested: Option<(usize, Vec<String>)> = None;
    let mut stray: Vec<String> = Vec::new();

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let upper = line.trim().to_ascii_uppercase();

        if let Some((depth, buffer)) = nested.as_mut() {
            buffer.push(line.clone());
            if upper == "BEGIN:VCARD" {
                *depth += 1;
            } else if upper == "END:VCARD" {
                *depth -= 1;
                if *depth == 0 {
                    let embedded = escape_text(&buffer.join("\n"));
                    if let Some((card, raw)) = current.as_mut() {
                        attach_embedded(card, embedded);
                        raw.extend(buffer.drain(..));
                    }
                    nested = None;
                }
            }
            continue;
        }

        match current.as_mut() {
            None => {
                if upper == "BEGIN:VCARD" {
                    if !stray.is_empty() {
                        out.push(Err(CardParseFailure {
                            index: out.len(),
                            reason: "content outside of BEGIN:VCARD/END:VCARD".to_string(),
                            raw: stray.join("\n"),
                        }));
                        stray.clear();
                    }
                    current = Some((RawCard::default(), vec![line]));
                } else {
                    stray.push(line);
                }
            }
            Some((card, raw)) => {
                if upper == "END:VCARD" {
                    out.push(Ok(std::mem::take(card)));
                    current = None;
                } else if upper == "BEGIN:VCARD" {
                    nested = Some((1, vec![line]));
                } else {
                    raw.push(line.clone());
                    push_content_line(card, &line);
                }
            }
        }
    }

    if let Some((depth, buffer)) = nested {
        let mut raw = current.map(|(_, raw)| raw).unwrap_or_default();
        raw.extend(buffer);
        out.push(Err(CardParseFailure {
            index: out.len(),
            reason: format!("embedded card not terminated ({} open BEGIN)", depth),
            raw: raw.join("\n"),
        }));
    } else if let Some((_, raw)) = current {
        out.push(Err(CardParseFailure {
            index: out.len(),
            reason: "missing END:VCARD".to_string(),
            raw: raw.join("\n"),
        }));
    }
    if !stray.is_empty() {
        out.push(Err(CardParseFailure {
            index: out.len(),
            reason: "content outside of BEGIN:VCARD/END:VCARD".to_string(),
            raw: stray.join("\n"),
        }));
    }
    out
}

/// An inline 2.1 `AGENT` card belongs to the `AGENT` property just before it.
fn attach_embedded(card: &mut RawCard, embedded: String) {
    match card.properties.last_mut() {
        Some(prop) if prop.name == "AGENT" && prop.value.trim().is_empty() => {
            prop.value = embedded;
        }
        _ => card.properties.push(Property::new("AGENT", embedded)),
    }
}

/// Joins folded lines (leading whitespace) and quoted-printable soft breaks.
fn unfold(text: &str) -> Vec<String> {
    let mut logical: Vec<String> = Vec::new();
    for physical in text.split('\n') {
        let physical = physical.strip_suffix('\r').unwrap_or(physical);
        if let Some(last) = logical.last_mut() {
            // a fold wins over a soft break: a folded QP value may split right after `=`
            if physical.starts_with(' ') || physical.starts_with('\t') {
                last.push_str(&physical[1..]);
                continue;
            }
            if is_quoted_printable(last) && last.ends_with('=') {
                last.pop();
                last.push_str(physical);
                continue;
            }
        }
        logical.push(physical.to_string());
    }
    logical
}

fn is_quoted_printable(line: &str) -> bool {
    match find_unquoted(line, ':') {
        Some(colon) => line[..colon]
            .to_ascii_uppercase()
            .contains("QUOTED-PRINTABLE"),
        None => false,
    }
}

/// Position of `needle` outside double quotes.
fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == needle && !in_quotes {
            return Some(i);
        }
    }
    None
}

fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == sep && !in_quotes {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Property and group names: alphanumerics, `-` and `_`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parses `group.NAME;param;param:value`.
pub fn parse_content_line(line: &str) -> Option<Property> {
    let colon = find_unquoted(line, ':')?;
    let (head, value) = (&line[..colon], &line[colon + 1..]);
    let mut segments = split_unquoted(head, ';').into_iter();
    let qualified = segments.next()?.trim();
    let (group, name) = match qualified.rsplit_once('.') {
        Some((group, name)) => (Some(group.to_string()), name),
        None => (None, qualified),
    };
    if !is_valid_name(name) || group.as_deref().is_some_and(|g| !is_valid_name(g)) {
        return None;
    }
    Some(Property {
        group,
        name: name.to_ascii_uppercase(),
        params: segments
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        value: value.to_string(),
    })
}

fn push_content_line(card: &mut RawCard, line: &str) {
    match parse_content_line(line) {
        Some(prop) => card.properties.push(prop),
        None => match card.properties.last_mut() {
            Some(prev) => {
                card.warnings.push(format!(
                    "line without property name joined to {}: {:?}",
                    prev.name, line
                ));
                prev.value.push_str(line);
            }
            None => card
                .warnings
                .push(format!("ignored line without property name: {:?}", line)),
        },
    }
}

// ============ Escaping ============

/// Escapes a TEXT value (RFC 6350 §3.4).
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            ',' => out.push_str("\\,"),
            ';' => out.push_str("\\;"),
            other => out.push(other),
        }
    }
    out
}

/// Reverses [`escape_text`]; unknown escapes are kept as written.
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(',') => out.push(','),
            Some(';') => out.push(';'),
            Some(':') => out.push(':'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Splits a structured value on unescaped `;` and unescapes each component.
pub fn split_components(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ';' {
            parts.push(unescape_text(&current));
            current.clear();
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    parts.push(unescape_text(&current));
    parts
}

fn decode_quoted_printable(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decoded text value of a property (quoted-printable aware).
pub fn text_value(prop: &Property) -> String {
    let raw = match prop.param("ENCODING") {
        Some(enc) if enc.eq_ignore_ascii_case("QUOTED-PRINTABLE") => {
            decode_quoted_printable(&prop.value)
        }
        _ if prop.has_flag("QUOTED-PRINTABLE") => decode_quoted_printable(&prop.value),
        _ => prop.value.clone(),
    };
    unescape_text(&raw)
}

// ============ Binary payloads ============

/// Decodes an inline binary property (`ENCODING=b`, `BASE64`, or a `data:` URI).
///
/// Returns `None` when the property is not inline binary (e.g. an http URI),
/// `Some(Err)` when it claims to be but does not decode.
pub fn inline_binary(prop: &Property) -> Option<Result<(Option<String>, Vec<u8>), String>> {
    let value = prop.value.trim();
    if let Some(rest) = value.strip_prefix("data:") {
        let (meta, payload) = match rest.split_once(',') {
            Some(parts) => parts,
            None => return Some(Err("data URI without payload".to_string())),
        };
        if !meta.ends_with(";base64") {
            return Some(Err("data URI is not base64 encoded".to_string()));
        }
        let mime = meta.trim_end_matches(";base64");
        let mime = (!mime.is_empty()).then(|| mime.to_ascii_lowercase());
        return Some(decode_base64(payload).map(|data| (mime, data)));
    }
    let is_b64 = prop
        .param("ENCODING")
        .map(|e| e.eq_ignore_ascii_case("b") || e.eq_ignore_ascii_case("BASE64"))
        .unwrap_or(false)
        || prop.has_flag("BASE64");
    if !is_b64 {
        return None;
    }
    let mime = prop.param("TYPE").map(type_param_to_mime);
    Some(decode_base64(value).map(|data| (mime, data)))
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, String> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err("empty binary payload".to_string());
    }
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| format!("invalid base64: {}", e))
}

fn type_param_to_mime(value: &str) -> String {
    let value = value.split(',').next().unwrap_or(value).trim();
    if value.contains('/') {
        value.to_ascii_lowercase()
    } else {
        format!("image/{}", value.to_ascii_lowercase())
    }
}

fn mime_to_type_param(mime: &str) -> String {
    mime.strip_prefix("image/").unwrap_or(mime).to_ascii_uppercase()
}

// ============ Card <-> Record ============

/// Interprets a raw card as a [`Record`] at version 0.
///
/// `fallback_id` is used when the card has no `UID`.
pub fn record_from_card(card: &RawCard, fallback_id: String, provenance: Provenance) -> Record {
    let mut record = Record::new(fallback_id, provenance);
    let mut notes: Vec<String> = Vec::new();
    let mut seen_uid = false;

    for prop in &card.properties {
        match prop.name.as_str() {
            "VERSION" if record.format_version.is_none() => {
                record.format_version = Some(prop.value.trim().to_string());
            }
            "UID" if !seen_uid && !prop.value.trim().is_empty() => {
                record.id = unescape_text(prop.value.trim());
                seen_uid = true;
            }
            "FN" if record.names.formatted.is_none() => {
                record.names.formatted = Some(text_value(prop));
            }
            "N" if record.names.structured.is_none() => {
                record.names.structured = Some(structured_name(&text_components(prop)));
            }
            "ORG" if record.organization.is_none() => {
                let mut parts = text_components(prop).into_iter();
                let name = parts.next().unwrap_or_default();
                if !name.is_empty() {
                    record.organization = Some(Organization {
                        name,
                        units: parts.filter(|u| !u.is_empty()).collect(),
                    });
                }
            }
            "TITLE" if record.job_title.is_none() => {
                let title = text_value(prop);
                if !title.is_empty() {
                    record.job_title = Some(title);
                }
            }
            "EMAIL" => {
                let email = text_value(prop);
                if !email.is_empty() {
                    record.add_params("EMAIL", &email, &kept_params(prop));
                    record.emails.push(email);
                }
            }
            "TEL" => {
                let tel = text_value(prop);
                let tel = tel.strip_prefix("tel:").map(str::to_string).unwrap_or(tel);
                if !tel.is_empty() {
                    record.add_params("TEL", &tel, &kept_params(prop));
                    record.phones.push(tel);
                }
            }
            "PHOTO" if record.photo.is_none() => match inline_binary(prop) {
                Some(Ok((mime, data))) => record.photo = Some(Photo::from_bytes(mime, data)),
                _ => record.extra.push(prop.clone()),
            },
            "NOTE" => {
                let note = text_value(prop);
                if !note.is_empty() {
                    notes.push(note);
                }
            }
            _ => record.extra.push(prop.clone()),
        }
    }

    if !notes.is_empty() {
        record.notes = Some(notes.join("\n"));
    }
    record
}

/// Parameters worth carrying to export; transfer encodings are re-decided on output.
fn kept_params(prop: &Property) -> Vec<String> {
    prop.params
        .iter()
        .filter(|p| {
            let key = p.split_once('=').map_or(p.as_str(), |(k, _)| k);
            !["ENCODING", "CHARSET", "VALUE", "QUOTED-PRINTABLE", "BASE64", "8BIT"]
                .iter()
                .any(|skip| key.eq_ignore_ascii_case(skip))
        })
        .cloned()
        .collect()
}

fn text_components(prop: &Property) -> Vec<String> {
    match prop.param("ENCODING") {
        Some(enc) if enc.eq_ignore_ascii_case("QUOTED-PRINTABLE") => {
            split_components(&decode_quoted_printable(&prop.value))
        }
        _ if prop.has_flag("QUOTED-PRINTABLE") => {
            split_components(&decode_quoted_printable(&prop.value))
        }
        _ => split_components(&prop.value),
    }
}

fn structured_name(parts: &[String]) -> StructuredName {
    let part = |i: usize| parts.get(i).cloned().unwrap_or_default();
    let mut suffixes = part(4);
    // tolerate exporters emitting more than five components
    if parts.len() > 5 {
        let overflow: Vec<&str> = parts[5..]
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        if !overflow.is_empty() {
            if !suffixes.is_empty() {
                suffixes.push(',');
            }
            suffixes.push_str(&overflow.join(","));
        }
    }
    StructuredName {
        family: part(0),
        given: part(1),
        additional: part(2),
        prefixes: part(3),
        suffixes,
    }
}

/// Serializes a record as one vCard with CRLF line endings.
pub fn serialize(record: &Record) -> String {
    let version = record
        .format_version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_VERSION);
    let mut lines: Vec<String> = vec!["BEGIN:VCARD".to_string(), format!("VERSION:{}", version)];

    lines.push(format!("UID:{}", escape_text(&record.id)));
    if let Some(fname) = &record.names.formatted {
        lines.push(format!("FN:{}", escape_text(fname)));
    }
    if let Some(n) = &record.names.structured {
        let parts: Vec<String> = n.parts().iter().map(|p| escape_text(p)).collect();
        lines.push(format!("N:{}", parts.join(";")));
    }
    if let Some(org) = &record.organization {
        let mut parts = vec![escape_text(&org.name)];
        parts.extend(org.units.iter().map(|u| escape_text(u)));
        lines.push(format!("ORG:{}", parts.join(";")));
    }
    if let Some(title) = &record.job_title {
        lines.push(format!("TITLE:{}", escape_text(title)));
    }
    for email in &record.emails {
        lines.push(value_line("EMAIL", record.params_for("EMAIL", email), email));
    }
    for tel in &record.phones {
        lines.push(value_line("TEL", record.params_for("TEL", tel), tel));
    }
    if let Some(photo) = &record.photo {
        let payload = STANDARD.encode(&photo.data);
        if version.starts_with('4') {
            let mime = photo.mime.as_deref().unwrap_or("application/octet-stream");
            lines.push(format!("PHOTO:data:{};base64,{}", mime, payload));
        } else {
            match &photo.mime {
                Some(mime) => lines.push(format!(
                    "PHOTO;ENCODING=b;TYPE={}:{}",
                    mime_to_type_param(mime),
                    payload
                )),
                None => lines.push(format!("PHOTO;ENCODING=b:{}", payload)),
            }
        }
    }
    if let Some(notes) = &record.notes {
        lines.push(format!("NOTE:{}", escape_text(notes)));
    }
    for prop in &record.extra {
        lines.push(render_property(prop));
    }
    lines.push("END:VCARD".to_string());

    let mut out = String::new();
    for line in lines {
        fold_into(&mut out, &line);
    }
    out
}

/// Serializes many records back to back.
pub fn serialize_all<'a>(records: impl IntoIterator<Item = &'a Record>) -> String {
    records.into_iter().map(serialize).collect()
}

fn value_line(name: &str, params: &[String], value: &str) -> String {
    let mut line = name.to_string();
    for param in params {
        line.push(';');
        line.push_str(param);
    }
    line.push(':');
    line.push_str(&escape_text(value));
    line
}

fn render_property(prop: &Property) -> String {
    let mut line = String::new();
    if let Some(group) = &prop.group {
        line.push_str(group);
        line.push('.');
    }
    line.push_str(&prop.name);
    for param in &prop.params {
        line.push(';');
        line.push_str(param);
    }
    line.push(':');
    line.push_str(&prop.value);
    line
}

/// Appends `line` folded at [`FOLD_WIDTH`] octets on UTF-8 boundaries.
fn fold_into(out: &mut String, line: &str) {
    let mut width = FOLD_WIDTH;
    let mut used = 0;
    for c in line.chars() {
        if used + c.len_utf8() > width {
            out.push_str("\r\n ");
            // the leading space counts against the continuation line
            width = FOLD_WIDTH - 1;
            used = 0;
        }
        out.push(c);
        used += c.len_utf8();
    }
    out.push_str("\r\n");
}
