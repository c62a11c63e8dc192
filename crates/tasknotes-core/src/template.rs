use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::frontmatter::{self, FieldValue, Header};
use crate::record::{NoteKind, TaskStatus};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
const MAX_SLUG_LEN: usize = 60;

fn separator_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("regex"))
}

pub fn slug(title: &str) -> String {
    let lowered = title.trim().to_lowercase();
    let cleaned = separator_regex().replace_all(&lowered, "-");
    let mut slug = cleaned.trim_matches('-').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn task_file_name(id: &str, title: &str) -> String {
    format!("{}-{}.md", id, slug(title))
}

/// Base name (without extension or collision suffix) for a note.
pub fn note_base_name(kind: NoteKind, title: &str, date: NaiveDate) -> String {
    match kind {
        NoteKind::Daily => format_date(date),
        _ => format!("{}-{}", format_date(date), slug(title)),
    }
}

pub fn task_header(id: &str, title: &str, status: TaskStatus, today: NaiveDate) -> Header {
    let today = format_date(today);
    let mut header = Header::new();
    header.insert("id", id);
    header.insert("title", title);
    header.insert("status", status.as_str());
    header.insert("created", today.clone());
    header.insert("updated", today);
    header.insert("tags", FieldValue::List(Vec::new()));
    header
}

pub fn note_header(title: &str, kind: NoteKind, today: NaiveDate) -> Header {
    let mut header = Header::new();
    header.insert("title", title);
    header.insert("kind", kind.as_str());
    header.insert("date", format_date(today));
    header.insert("tags", FieldValue::List(Vec::new()));
    header
}

pub fn task_file(header: &Header, title: &str) -> String {
    let mut lines = Vec::new();
    lines.push(format!("# {}", title));
    lines.push(String::new());
    lines.push("## Description".to_string());
    lines.push(String::new());
    lines.push("- ".to_string());
    lines.push(String::new());
    lines.push("## Notes".to_string());
    lines.push(String::new());
    format!("{}\n{}", frontmatter::serialize(header), lines.join("\n"))
}

pub fn note_file(header: &Header, kind: NoteKind, title: &str) -> String {
    let sections: &[&str] = match kind {
        NoteKind::Daily => &["Log", "Tomorrow"],
        NoteKind::Meetings => &["Attendees", "Agenda", "Action Items"],
        NoteKind::Ideas => &["Summary", "Next Steps"],
        NoteKind::Reference => &["Source", "Notes"],
    };
    let mut lines = vec![format!("# {}", title), String::new()];
    for section in sections {
        lines.push(format!("## {}", section));
        lines.push(String::new());
    }
    format!("{}\n{}", frontmatter::serialize(header), lines.join("\n"))
}
