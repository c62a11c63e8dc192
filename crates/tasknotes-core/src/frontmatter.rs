use std::fmt;

use thiserror::Error;

pub const DELIMITER: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrontmatterError {
    #[error("Missing front matter delimiter")]
    MissingFrontMatter,
    #[error("Missing closing --- for front matter")]
    MissingFrontMatterEnd,
    #[error("Invalid front matter key: {0:?}")]
    InvalidKey(String),
}

/// A header value: either a plain string or a flat list of strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_formatted(&self) -> String {
        match self {
            FieldValue::Scalar(value) => format_scalar(value),
            FieldValue::List(values) => {
                let items: Vec<String> = values.iter().map(|item| format_list_item(item)).collect();
                format!("[{}]", items.join(", "))
            }
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            FieldValue::Scalar(value) => Some(value.as_str()),
            FieldValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::Scalar(_) => None,
            FieldValue::List(values) => Some(values.as_slice()),
        }
    }

    /// Lists as-is; a non-empty scalar becomes a single item.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            FieldValue::List(values) => values.clone(),
            FieldValue::Scalar(value) if value.trim().is_empty() => Vec::new(),
            FieldValue::Scalar(value) => vec![value.clone()],
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_formatted())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Scalar(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

/// Ordered header map. Keys keep the position they were first inserted at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, FieldValue)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Trimmed scalar value, `None` when missing, empty, or a list.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(FieldValue::as_scalar)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replaces the value in place when the key exists, otherwise appends.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        let idx = self.fields.iter().position(|(name, _)| name == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (key, value) in iter {
            header.insert(key, value);
        }
        header
    }
}

#[derive(Debug, Clone, Copy)]
struct LineSpan {
    start: usize,
    content_end: usize,
    end: usize,
}

impl LineSpan {
    fn content<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.content_end]
    }

    fn terminator<'a>(&self, text: &'a str) -> &'a str {
        &text[self.content_end..self.end]
    }
}

fn line_spans(text: &str) -> Vec<LineSpan> {
    let mut spans = Vec::new();
    let mut start = 0;
    for piece in text.split_inclusive('\n') {
        let end = start + piece.len();
        let content = piece.strip_suffix('\n').unwrap_or(piece);
        let content = content.strip_suffix('\r').unwrap_or(content);
        spans.push(LineSpan {
            start,
            content_end: start + content.len(),
            end,
        });
        start = end;
    }
    spans
}

/// Index of the closing delimiter line.
fn closing_index(text: &str, spans: &[LineSpan]) -> Result<usize, FrontmatterError> {
    match spans.first() {
        Some(first) if first.content(text).trim() == DELIMITER => {}
        _ => return Err(FrontmatterError::MissingFrontMatter),
    }
    spans
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, span)| span.content(text).trim() == DELIMITER)
        .map(|(idx, _)| idx)
        .ok_or(FrontmatterError::MissingFrontMatterEnd)
}

/// Splits a record into raw header text and body. The body starts right
/// after the closing delimiter line.
pub fn split(text: &str) -> Option<(&str, &str)> {
    let spans = line_spans(text);
    let close = closing_index(text, &spans).ok()?;
    let header_text = &text[spans[0].end..spans[close].start];
    let header_text = header_text.strip_suffix('\n').unwrap_or(header_text);
    let header_text = header_text.strip_suffix('\r').unwrap_or(header_text);
    Some((header_text, &text[spans[close].end..]))
}

/// Body text, or the whole input when there is no header.
pub fn body(text: &str) -> &str {
    split(text).map(|(_, body)| body).unwrap_or(text)
}

/// Parses the header of `text`. Missing or unterminated headers yield an empty map.
pub fn parse(text: &str) -> Header {
    match split(text) {
        Some((header_text, _)) => parse_fields(header_text),
        None => Header::new(),
    }
}

pub fn parse_fields(front: &str) -> Header {
    let mut header = Header::new();
    let lines: Vec<&str> = front.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || is_indented(line) {
            i += 1;
            continue;
        }
        let Some((key, rest)) = line.split_once(':') else {
            i += 1;
            continue;
        };
        let key = key.trim();
        if !is_valid_key(key) {
            i += 1;
            continue;
        }
        let value = rest.trim();

        if is_block_marker(value) {
            let mut block: Vec<&str> = Vec::new();
            i += 1;
            while i < lines.len() && (is_indented(lines[i]) || lines[i].trim().is_empty()) {
                block.push(lines[i].trim());
                i += 1;
            }
            while block.last().map(|last| last.is_empty()).unwrap_or(false) {
                block.pop();
            }
            let joined = if value.starts_with('>') {
                block
                    .iter()
                    .filter(|part| !part.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join(" ")
            } else {
                block.join("\n")
            };
            keep_first(&mut header, key, FieldValue::Scalar(joined));
            continue;
        }

        if value.is_empty() {
            let mut items = Vec::new();
            let mut j = i + 1;
            while j < lines.len() {
                let next = lines[j].trim_start();
                if let Some(item) = next.strip_prefix("- ") {
                    items.push(unquote(item.trim()));
                    j += 1;
                    continue;
                }
                if next == "-" {
                    j += 1;
                    continue;
                }
                break;
            }
            if j > i + 1 {
                keep_first(&mut header, key, FieldValue::List(items));
                i = j;
                continue;
            }
            keep_first(&mut header, key, FieldValue::Scalar(String::new()));
            i += 1;
            continue;
        }

        if value.starts_with('[') && value.ends_with(']') {
            keep_first(&mut header, key, FieldValue::List(parse_list_string(value)));
            i += 1;
            continue;
        }

        keep_first(&mut header, key, FieldValue::Scalar(unquote(value)));
        i += 1;
    }
    header
}

/// A repeated key keeps its first value, the same line `update` rewrites.
fn keep_first(header: &mut Header, key: &str, value: FieldValue) {
    if !header.contains_key(key) {
        header.insert(key, value);
    }
}

/// Renders a complete header block, delimiters included.
pub fn serialize(header: &Header) -> String {
    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');
    for (key, value) in header.iter() {
        out.push_str(&render_field(key, value));
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out
}

pub fn render_field(key: &str, value: &FieldValue) -> String {
    format!("{}: {}", key, value.as_formatted())
}

/// Replaces or inserts `key`, touching only that field's line(s). Returns the
/// input unchanged when the header is missing or the key is unusable; callers
/// that need to know should use [`try_update`].
pub fn update(text: &str, key: &str, value: &FieldValue) -> String {
    try_update(text, key, value).unwrap_or_else(|_| text.to_string())
}

pub fn try_update(text: &str, key: &str, value: &FieldValue) -> Result<String, FrontmatterError> {
    if !is_valid_key(key) {
        return Err(FrontmatterError::InvalidKey(key.to_string()));
    }
    let spans = line_spans(text);
    let close = closing_index(text, &spans)?;
    let fields = &spans[1..close];
    let rendered = render_field(key, value);

    let key_idx = fields
        .iter()
        .position(|span| is_key_line(span.content(text), key));

    let mut out = String::with_capacity(text.len() + rendered.len() + 2);
    match key_idx {
        Some(idx) => {
            let key_line = fields[idx];
            let value_part = key_line
                .content(text)
                .split_once(':')
                .map(|(_, rest)| rest.trim())
                .unwrap_or("");
            let owns_block_items = value_part.is_empty() || is_block_marker(value_part);
            let mut last = idx;
            while last + 1 < fields.len() {
                let next = fields[last + 1].content(text);
                let is_item = next.trim_start().starts_with('-');
                if is_indented(next) || (owns_block_items && is_item) {
                    last += 1;
                    continue;
                }
                break;
            }
            out.push_str(&text[..key_line.start]);
            out.push_str(&rendered);
            out.push_str(key_line.terminator(text));
            out.push_str(&text[fields[last].end..]);
        }
        None => {
            let closing = spans[close];
            let newline = if spans[0].terminator(text) == "\r\n" {
                "\r\n"
            } else {
                "\n"
            };
            out.push_str(&text[..closing.start]);
            out.push_str(&rendered);
            out.push_str(newline);
            out.push_str(&text[closing.start..]);
        }
    }
    Ok(out)
}

pub fn update_many(text: &str, updates: &[(&str, FieldValue)]) -> Result<String, FrontmatterError> {
    let mut current = text.to_string();
    for (key, value) in updates {
        current = try_update(&current, key, value)?;
    }
    Ok(current)
}

pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('#')
        && !key.starts_with('-')
        && key != DELIMITER
        && key
            .chars()
            .all(|c| !c.is_whitespace() && c != ':' && c != '"' && c != '\'')
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

fn is_block_marker(value: &str) -> bool {
    matches!(value, ">" | ">-" | "|" | "|-")
}

fn is_key_line(line: &str, key: &str) -> bool {
    if is_indented(line) {
        return false;
    }
    let Some(rest) = line.strip_prefix(key) else {
        return false;
    };
    rest.trim_start_matches([' ', '\t']).starts_with(':')
}

fn parse_list_string(value: &str) -> Vec<String> {
    let raw = value.trim();
    let inner = raw
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(raw)
        .trim();
    if inner.is_empty() {
        return Vec::new();
    }
    split_outside_quotes(inner)
        .into_iter()
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(unquote)
        .collect()
}

fn split_outside_quotes(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;
    for (idx, ch) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_double => escaped = true,
            '"' if !in_single => in_double = !in_double,
            '\'' if !in_double => in_single = !in_single,
            ',' if !in_double && !in_single => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        return out;
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return raw[1..raw.len() - 1].replace("''", "'");
    }
    raw.to_string()
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn scalar_needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value.trim() != value
        || value.starts_with('[')
        || value.starts_with('-')
        || is_block_marker(value)
        || value
            .chars()
            .any(|c| matches!(c, ':' | '"' | '\'' | '#' | '\\' | '\n' | '\r' | '\t'))
}

fn format_scalar(value: &str) -> String {
    if scalar_needs_quotes(value) {
        quote(value)
    } else {
        value.to_string()
    }
}

fn format_list_item(value: &str) -> String {
    if scalar_needs_quotes(value) || value.contains([',', '[', ']']) {
        quote(value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "---\n\
id: 001\n\
# owner edits by hand\n\
title: Fix login bug\n\
status: backlog\n\
tags: [auth, web]\n\
---\n\
\n\
# Fix login bug\n\
\n\
status: this line is body text\n";

    #[test]
    fn parse_reads_scalars_and_lists_in_order() {
        let header = parse(SAMPLE);
        let keys: Vec<&str> = header.keys().collect();
        assert_eq!(keys, vec!["id", "title", "status", "tags"]);
        assert_eq!(header.get_str("title"), Some("Fix login bug"));
        assert_eq!(
            header.get("tags"),
            Some(&FieldValue::List(vec!["auth".to_string(), "web".to_string()]))
        );
    }

    #[test]
    fn parse_is_empty_without_delimiters() {
        assert!(parse("no front matter here").is_empty());
        assert!(parse("---\ntitle: never closed\n").is_empty());
    }

    #[test]
    fn parse_accepts_block_lists_and_block_scalars() {
        let text = "---\ntags:\n  - one\n  - \"two, three\"\nsummary: >-\n  folded\n  text\nlog: |\n  a\n  b\n---\n";
        let header = parse(text);
        assert_eq!(
            header.get("tags"),
            Some(&FieldValue::List(vec![
                "one".to_string(),
                "two, three".to_string()
            ]))
        );
        assert_eq!(header.get_str("summary"), Some("folded text"));
        assert_eq!(header.get_str("log"), Some("a\nb"));
    }

    #[test]
    fn update_replaces_only_the_matching_line() {
        let updated = update(SAMPLE, "status", &FieldValue::from("active"));
        let expected = SAMPLE.replacen("status: backlog\n", "status: active\n", 1);
        assert_eq!(updated, expected);
        assert_eq!(parse(&updated).get_str("status"), Some("active"));
        assert_eq!(body(&updated), body(SAMPLE));
    }

    #[test]
    fn update_inserts_missing_field_before_closing_delimiter() {
        let updated = update(SAMPLE, "updated", &FieldValue::from("2026-01-02"));
        assert!(updated.contains("tags: [auth, web]\nupdated: 2026-01-02\n---\n"));
        let keys: Vec<String> = parse(&updated).keys().map(str::to_string).collect();
        assert_eq!(keys.last().map(String::as_str), Some("updated"));
        assert_eq!(body(&updated), body(SAMPLE));
    }

    #[test]
    fn update_is_noop_without_closing_delimiter() {
        let text = "---\ntitle: open\nbody without end\n";
        assert_eq!(update(text, "status", &FieldValue::from("active")), text);
        assert_eq!(
            try_update(text, "status", &FieldValue::from("active")),
            Err(FrontmatterError::MissingFrontMatterEnd)
        );
        assert_eq!(
            try_update("plain", "status", &FieldValue::from("x")),
            Err(FrontmatterError::MissingFrontMatter)
        );
    }

    #[test]
    fn update_replaces_block_list_with_inline_list() {
        let text = "---\ntags:\n  - a\n  - b\ntitle: T\n---\nbody\n";
        let updated = update(text, "tags", &FieldValue::List(vec!["c".to_string()]));
        assert_eq!(updated, "---\ntags: [c]\ntitle: T\n---\nbody\n");
    }

    #[test]
    fn repeated_key_reads_back_the_updated_value() {
        let text = "---\nstatus: backlog\nstatus: done\n---\nbody\n";
        assert_eq!(parse(text).get_str("status"), Some("backlog"));

        let updated = update(text, "status", &FieldValue::from("active"));
        assert_eq!(parse(&updated).get_str("status"), Some("active"));
        assert_eq!(body(&updated), "body\n");
    }

    #[test]
    fn update_preserves_crlf_endings() {
        let text = "---\r\ntitle: T\r\nstatus: backlog\r\n---\r\nbody\r\n";
        let updated = update(text, "status", &FieldValue::from("active"));
        assert_eq!(updated, "---\r\ntitle: T\r\nstatus: active\r\n---\r\nbody\r\n");
        let inserted = update(text, "updated", &FieldValue::from("2026-01-02"));
        assert!(inserted.ends_with("updated: 2026-01-02\r\n---\r\nbody\r\n"));
    }

    #[test]
    fn update_does_not_match_key_prefixes() {
        let text = "---\nstatus_note: keep\n---\n";
        let updated = update(text, "status", &FieldValue::from("active"));
        assert_eq!(updated, "---\nstatus_note: keep\nstatus: active\n---\n");
    }

    #[test]
    fn update_rejects_invalid_keys() {
        assert_eq!(
            try_update(SAMPLE, "bad key", &FieldValue::from("x")),
            Err(FrontmatterError::InvalidKey("bad key".to_string()))
        );
    }

    #[test]
    fn ambiguous_scalars_are_quoted_and_escaped() {
        assert_eq!(
            FieldValue::from("Re: \"quoted\" #1").as_formatted(),
            "\"Re: \\\"quoted\\\" #1\""
        );
        assert_eq!(FieldValue::from("plain words").as_formatted(), "plain words");
        assert_eq!(
            FieldValue::List(vec!["a".to_string(), "b, c".to_string()]).as_formatted(),
            "[a, \"b, c\"]"
        );
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let header: Header = vec![
            ("title", FieldValue::from("Meeting: Q3 planning")),
            ("quote", FieldValue::from("she said \"no\"")),
            ("hash", FieldValue::from("#tag")),
            ("path", FieldValue::from("C:\\notes\\today")),
            ("padded", FieldValue::from("  spaced  ")),
            ("empty", FieldValue::from("")),
            ("brackets", FieldValue::from("[not a list]")),
            ("dash", FieldValue::from("- not an item")),
            ("folded", FieldValue::from(">-")),
            ("multi", FieldValue::from("line one\nline two")),
            ("none", FieldValue::List(Vec::new())),
            (
                "tags",
                FieldValue::List(vec![
                    "a".to_string(),
                    "with, comma".to_string(),
                    "".to_string(),
                    "[x]".to_string(),
                    "it's".to_string(),
                ]),
            ),
        ]
        .into_iter()
        .collect();

        let text = serialize(&header);
        assert_eq!(parse(&text), header);
    }

    #[test]
    fn single_quoted_values_unescape_doubled_quotes() {
        let header = parse("---\ntitle: 'it''s here'\n---\n");
        assert_eq!(header.get_str("title"), Some("it's here"));
    }

    #[test]
    fn header_insert_keeps_position() {
        let mut header: Header = vec![("a", "1"), ("b", "2")].into_iter().collect();
        header.insert("a", "3");
        header.insert("c", "4");
        let keys: Vec<&str> = header.keys().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(header.get_str("a"), Some("3"));
    }
}
