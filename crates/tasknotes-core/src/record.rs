use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::frontmatter::{self, FieldValue, Header};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Tasks,
    Notes,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Tasks => "tasks",
            Family::Notes => "notes",
        }
    }

    pub fn containers(self) -> &'static [Container] {
        match self {
            Family::Tasks => &TASK_CONTAINERS,
            Family::Notes => &NOTE_CONTAINERS,
        }
    }

    /// Header field that mirrors the containing directory.
    pub fn container_field(self) -> &'static str {
        match self {
            Family::Tasks => "status",
            Family::Notes => "kind",
        }
    }

    pub fn parse_container(self, value: &str) -> Option<Container> {
        let value = value.trim();
        self.containers()
            .iter()
            .copied()
            .find(|container| container.dir_name().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Active,
    Completed,
    Archived,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Backlog,
        TaskStatus::Active,
        TaskStatus::Completed,
        TaskStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Archived => "archived",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown status '{}' (expected one of: backlog, active, completed, archived)",
                    value.trim()
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Daily,
    Meetings,
    Ideas,
    Reference,
}

impl NoteKind {
    pub const ALL: [NoteKind; 4] = [
        NoteKind::Daily,
        NoteKind::Meetings,
        NoteKind::Ideas,
        NoteKind::Reference,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NoteKind::Daily => "daily",
            NoteKind::Meetings => "meetings",
            NoteKind::Ideas => "ideas",
            NoteKind::Reference => "reference",
        }
    }
}

impl FromStr for NoteKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        NoteKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown note kind '{}' (expected one of: daily, meetings, ideas, reference)",
                    value.trim()
                )
            })
    }
}

/// The directory a record lives in: a task status or a note kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    Task(TaskStatus),
    Note(NoteKind),
}

const TASK_CONTAINERS: [Container; 4] = [
    Container::Task(TaskStatus::Backlog),
    Container::Task(TaskStatus::Active),
    Container::Task(TaskStatus::Completed),
    Container::Task(TaskStatus::Archived),
];

const NOTE_CONTAINERS: [Container; 4] = [
    Container::Note(NoteKind::Daily),
    Container::Note(NoteKind::Meetings),
    Container::Note(NoteKind::Ideas),
    Container::Note(NoteKind::Reference),
];

impl Container {
    pub fn family(self) -> Family {
        match self {
            Container::Task(_) => Family::Tasks,
            Container::Note(_) => Family::Notes,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Container::Task(status) => status.as_str(),
            Container::Note(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl From<TaskStatus> for Container {
    fn from(value: TaskStatus) -> Self {
        Container::Task(value)
    }
}

impl From<NoteKind> for Container {
    fn from(value: NoteKind) -> Self {
        Container::Note(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub family: Family,
    pub id: String,
    pub container: Container,
    pub path: PathBuf,
    pub header: Header,
    pub body: String,
}

impl Record {
    pub fn title(&self) -> &str {
        self.header.get_str("title").unwrap_or(self.id.as_str())
    }

    /// Numeric task id parsed from the file name.
    pub fn number(&self) -> Option<u64> {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(task_number)
    }

    pub fn header_container(&self) -> Option<&str> {
        self.header.get_str(self.family.container_field())
    }

    pub fn render_line(&self) -> String {
        let title = if self.title().trim().is_empty() {
            "(no title)"
        } else {
            self.title().trim()
        };
        format!("{} | {} | {}", self.id, self.container, title)
    }

    pub fn to_json_value(&self, include_body: bool) -> serde_json::Value {
        let mut header = serde_json::Map::new();
        for (key, value) in self.header.iter() {
            let value = match value {
                FieldValue::Scalar(value) => serde_json::Value::String(value.clone()),
                FieldValue::List(values) => serde_json::Value::Array(
                    values
                        .iter()
                        .map(|item| serde_json::Value::String(item.clone()))
                        .collect(),
                ),
            };
            header.insert(key.to_string(), value);
        }

        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), serde_json::Value::String(self.id.clone()));
        map.insert(
            "family".to_string(),
            serde_json::Value::String(self.family.as_str().to_string()),
        );
        map.insert(
            "container".to_string(),
            serde_json::Value::String(self.container.dir_name().to_string()),
        );
        map.insert(
            "title".to_string(),
            serde_json::Value::String(self.title().to_string()),
        );
        map.insert(
            "path".to_string(),
            serde_json::Value::String(self.path.display().to_string()),
        );
        map.insert("header".to_string(), serde_json::Value::Object(header));
        if include_body {
            map.insert("body".to_string(), serde_json::Value::String(self.body.clone()));
        }
        serde_json::Value::Object(map)
    }
}

pub fn load_record(path: &Path, container: Container) -> Result<Record, std::io::Error> {
    let text = fs::read_to_string(path)?;
    Ok(record_from_text(path, container, &text))
}

pub fn record_from_text(path: &Path, container: Container, text: &str) -> Record {
    let family = container.family();
    Record {
        family,
        id: id_from_path(family, path),
        container,
        path: path.to_path_buf(),
        header: frontmatter::parse(text),
        body: frontmatter::body(text).to_string(),
    }
}

pub fn id_from_path(family: Family, path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    match family {
        Family::Tasks => task_id_prefix(stem)
            .map(str::to_string)
            .unwrap_or_else(|| stem.to_string()),
        Family::Notes => stem.to_string(),
    }
}

fn task_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(?:-|\.|$)").expect("regex"))
}

/// Leading digits of a task file name or stem, e.g. `007` for `007-fix-it.md`.
pub fn task_id_prefix(name: &str) -> Option<&str> {
    task_prefix_regex()
        .captures(name)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str())
}

pub fn task_number(name: &str) -> Option<u64> {
    task_id_prefix(name).and_then(|digits| digits.parse::<u64>().ok())
}

/// The human part of a task stem: `fix-login-bug` for `001-fix-login-bug`.
pub fn title_part(stem: &str) -> &str {
    match task_id_prefix(stem) {
        Some(prefix) => stem[prefix.len()..].trim_start_matches('-'),
        None => stem,
    }
}

/// Record files are visible markdown files; dotfiles are allocator or temp state.
pub fn is_record_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
        return false;
    };
    !name.starts_with('.') && path.extension().map(|ext| ext == "md").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn task_number_reads_leading_digits() {
        assert_eq!(task_number("007-fix-it.md"), Some(7));
        assert_eq!(task_number("012.md"), Some(12));
        assert_eq!(task_number("fix-007.md"), None);
        assert_eq!(task_number("2026notes.md"), None);
    }

    #[test]
    fn title_part_strips_id_prefix() {
        assert_eq!(title_part("001-fix-login-bug"), "fix-login-bug");
        assert_eq!(title_part("2026-10-18-standup"), "10-18-standup");
        assert_eq!(title_part("untitled"), "untitled");
    }

    #[test]
    fn parse_container_is_case_insensitive_and_family_scoped() {
        assert_eq!(
            Family::Tasks.parse_container("Active"),
            Some(Container::Task(TaskStatus::Active))
        );
        assert_eq!(Family::Tasks.parse_container("daily"), None);
        assert_eq!(
            Family::Notes.parse_container("ideas"),
            Some(Container::Note(NoteKind::Ideas))
        );
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn load_record_splits_header_and_body() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("003-write-docs.md");
        fs::write(&path, "---\nid: 003\ntitle: Write docs\nstatus: active\n---\nBody\n")
            .expect("write");

        let record = load_record(&path, Container::Task(TaskStatus::Active)).expect("load");
        assert_eq!(record.id, "003");
        assert_eq!(record.number(), Some(3));
        assert_eq!(record.title(), "Write docs");
        assert_eq!(record.header_container(), Some("active"));
        assert_eq!(record.body, "Body\n");
        assert!(record.render_line().contains("003 | active | Write docs"));
    }

    #[test]
    fn is_record_file_skips_dotfiles() {
        assert!(is_record_file(Path::new("a/001-x.md")));
        assert!(!is_record_file(Path::new("a/.01J.tmp")));
        assert!(!is_record_file(Path::new("a/.hidden.md")));
        assert!(!is_record_file(Path::new("a/readme.txt")));
    }
}
