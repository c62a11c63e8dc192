use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{Local, NaiveDate};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::frontmatter::{self, FieldValue, Header};
use crate::id_alloc::{AllocError, AllocatorOptions, IdAllocator};
use crate::record::{
    id_from_path, is_record_file, load_record, record_from_text, task_number, title_part,
    Container, Family, Record, TaskStatus,
};
use crate::template;
use crate::workspace::Workspace;

/// Temp files younger than this may belong to a transition still in flight.
const TEMP_FILE_GRACE: Duration = Duration::from_secs(60);
const MAX_NOTE_SUFFIX: usize = 999;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No {family} record matches '{query}'")]
    RecordNotFound { family: Family, query: String },
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Cannot reach {}: {source}", path.display())]
    TargetUnreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Record already exists at {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("Written content does not match for {}", .0.display())]
    VerifyFailed(PathBuf),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("Store IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn remedy(&self) -> Option<&'static str> {
        match self {
            StoreError::RecordNotFound { .. } => {
                Some("run `tasknotes list` to see available records")
            }
            StoreError::InvalidField { .. } => Some("check the field name and value, then retry"),
            StoreError::TargetUnreachable { .. } => {
                Some("check that the workspace directories exist and are writable")
            }
            StoreError::AlreadyExists(_) => Some(
                "rename one of the files, or run `tasknotes repair` if a move was interrupted",
            ),
            StoreError::VerifyFailed(_) => {
                Some("check free disk space, then run `tasknotes repair`")
            }
            StoreError::Alloc(AllocError::Exhausted { .. }) => {
                Some("renumber or archive old tasks outside tasknotes; no ids are left")
            }
            StoreError::Alloc(_) | StoreError::Io { .. } => {
                Some("check file permissions, then run `tasknotes repair`")
            }
        }
    }

    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn unreachable_dir(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::TargetUnreachable {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RepairReport {
    pub removed_temp_files: Vec<PathBuf>,
    pub removed_duplicates: Vec<PathBuf>,
    pub fixed_headers: Vec<PathBuf>,
    /// Task ids carried by more than one distinct file; reported, never deleted.
    pub duplicate_ids: Vec<String>,
    /// Different records sharing a file name across containers; reported, never deleted.
    pub name_conflicts: Vec<PathBuf>,
    pub unreadable: Vec<PathBuf>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.removed_temp_files.is_empty()
            && self.removed_duplicates.is_empty()
            && self.fixed_headers.is_empty()
            && self.duplicate_ids.is_empty()
            && self.name_conflicts.is_empty()
            && self.unreadable.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    workspace: Workspace,
    allocator: AllocatorOptions,
}

impl RecordStore {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            allocator: AllocatorOptions::default(),
        }
    }

    pub fn with_allocator_options(mut self, options: AllocatorOptions) -> Self {
        self.allocator = options;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn allocator(&self) -> IdAllocator {
        IdAllocator::with_options(&self.workspace.tasks_root, self.allocator.clone())
    }

    pub fn create(
        &self,
        container: Container,
        title: &str,
        extra: &Header,
    ) -> Result<Record, StoreError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::invalid("title", "must not be empty"));
        }
        let family = container.family();
        for key in extra.keys() {
            if !frontmatter::is_valid_key(key) {
                return Err(StoreError::invalid(key, "not a usable header key"));
            }
            let owned = key == "title"
                || key == family.container_field()
                || (family == Family::Tasks && key == "id");
            if owned {
                return Err(StoreError::invalid(
                    key,
                    "set by the store; pass it as an argument instead",
                ));
            }
        }

        let dir = self.workspace.container_dir(container);
        fs::create_dir_all(&dir).map_err(unreachable_dir(&dir))?;
        let today = today();

        let path = match container {
            Container::Task(status) => {
                let allocation = self.allocator().next_id()?;
                let mut header = template::task_header(&allocation.id, title, status, today);
                merge_extra(&mut header, extra);
                let content = template::task_file(&header, title);
                let path = dir.join(template::task_file_name(&allocation.id, title));
                match write_new(&path, &content)? {
                    true => path,
                    false => return Err(StoreError::AlreadyExists(path)),
                }
            }
            Container::Note(kind) => {
                let mut header = template::note_header(title, kind, today);
                merge_extra(&mut header, extra);
                let content = template::note_file(&header, kind, title);
                let base = template::note_base_name(kind, title, today);
                self.write_note(&dir, &base, &content)?
            }
        };
        debug!(path = %path.display(), container = %container, "created record");
        load_record(&path, container).map_err(io_err(&path))
    }

    /// Exact id, then case-insensitive name, then substring; each pass walks
    /// the containers in family order and the first hit wins.
    pub fn find(&self, family: Family, query: &str) -> Result<Record, StoreError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StoreError::invalid("query", "must not be empty"));
        }
        let candidates = self.scan(family)?;
        let matchers: [fn(Family, &str, &str) -> bool; 3] = [
            matches_exact_id,
            matches_name_ignore_case,
            matches_substring,
        ];
        for matcher in matchers {
            for (container, path) in &candidates {
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                if matcher(family, stem, query) {
                    return load_record(path, *container).map_err(io_err(path));
                }
            }
        }
        Err(StoreError::RecordNotFound {
            family,
            query: query.to_string(),
        })
    }

    pub fn list(
        &self,
        family: Family,
        container: Option<Container>,
    ) -> Result<Vec<Record>, StoreError> {
        let mut records = Vec::new();
        for (found_in, path) in self.scan(family)? {
            if container.map(|wanted| wanted != found_in).unwrap_or(false) {
                continue;
            }
            match load_record(&path, found_in) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable record")
                }
            }
        }
        Ok(records)
    }

    /// Moves `record` into `target`, rewriting its status and `updated`
    /// fields. The new copy is written, synced and verified before the source
    /// is removed. An unrelated file already at the destination is never replaced.
    pub fn transition(&self, record: &Record, target: Container) -> Result<Record, StoreError> {
        if record.container == target {
            return Ok(record.clone());
        }
        let family = record.family;
        if target.family() != family {
            return Err(StoreError::invalid(
                family.container_field(),
                format!("'{}' is not a {} container", target, family),
            ));
        }
        let target_dir = self.workspace.container_dir(target);
        fs::create_dir_all(&target_dir).map_err(unreachable_dir(&target_dir))?;

        let file_name = record.path.file_name().ok_or_else(|| {
            StoreError::invalid("path", format!("{} has no file name", record.path.display()))
        })?;
        let dest = target_dir.join(file_name);
        if dest.exists() {
            return Err(StoreError::AlreadyExists(dest));
        }

        let text = fs::read_to_string(&record.path).map_err(io_err(&record.path))?;
        let updated = frontmatter::update_many(
            &text,
            &[
                (family.container_field(), FieldValue::from(target.dir_name())),
                ("updated", FieldValue::from(template::format_date(today()))),
            ],
        )
        .map_err(|err| header_error(&record.path, err))?;

        write_atomic(&dest, &updated)?;
        fs::remove_file(&record.path).map_err(io_err(&record.path))?;
        debug!(
            from = %record.path.display(),
            to = %dest.display(),
            "moved record"
        );
        Ok(record_from_text(&dest, target, &updated))
    }

    /// Surgical single-field update. `id` is fixed and the status field only
    /// changes through [`RecordStore::transition`].
    pub fn set_field(
        &self,
        record: &Record,
        field: &str,
        value: FieldValue,
    ) -> Result<Record, StoreError> {
        let field = field.trim();
        if !frontmatter::is_valid_key(field) {
            return Err(StoreError::invalid(field, "not a usable header key"));
        }
        if record.family == Family::Tasks && field == "id" {
            return Err(StoreError::invalid(field, "task ids are immutable"));
        }
        if field == record.family.container_field() {
            return Err(StoreError::invalid(field, "use a transition to change it"));
        }
        let blank = value.as_scalar().map(|v| v.trim().is_empty()).unwrap_or(true);
        if field == "title" && blank {
            return Err(StoreError::invalid(field, "must be a non-empty string"));
        }
        let text = fs::read_to_string(&record.path).map_err(io_err(&record.path))?;
        let updated = frontmatter::try_update(&text, field, &value)
            .map_err(|err| header_error(&record.path, err))?;
        write_atomic(&record.path, &updated)?;
        Ok(record_from_text(&record.path, record.container, &updated))
    }

    /// Moves completed tasks whose file modification time is older than
    /// `days` into `archived`. Headers are left as they are.
    pub fn archive_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let completed = self.workspace.container_dir(Container::Task(TaskStatus::Completed));
        let archived = self.workspace.container_dir(Container::Task(TaskStatus::Archived));
        let age = Duration::from_secs(u64::from(days) * 86_400);
        let Some(threshold) = SystemTime::now().checked_sub(age) else {
            return Ok(0);
        };
        let mut candidates: Vec<PathBuf> = read_dir_paths(&completed)?
            .into_iter()
            .filter(|path| is_record_file(path))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }
        candidates.sort();

        fs::create_dir_all(&archived).map_err(unreachable_dir(&archived))?;
        let mut count = 0;
        for path in candidates {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .map_err(io_err(&path))?;
            if modified >= threshold {
                continue;
            }
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let dest = archived.join(file_name);
            if dest.exists() {
                warn!(
                    path = %dest.display(),
                    "archive target exists; leaving completed copy in place"
                );
                continue;
            }
            fs::rename(&path, &dest).map_err(io_err(&path))?;
            debug!(path = %dest.display(), "archived record");
            count += 1;
        }
        Ok(count)
    }

    /// Restores the one-directory-per-record and header/directory agreement
    /// after interrupted operations or manual edits.
    pub fn repair(&self) -> Result<RepairReport, StoreError> {
        let mut report = RepairReport::default();
        for family in [Family::Tasks, Family::Notes] {
            self.remove_stale_temp_files(family, &mut report)?;
            self.remove_duplicate_copies(family, &mut report)?;
            self.fix_container_fields(family, &mut report)?;
        }
        self.report_duplicate_ids(&mut report)?;
        Ok(report)
    }

    fn remove_stale_temp_files(
        &self,
        family: Family,
        report: &mut RepairReport,
    ) -> Result<(), StoreError> {
        for container in family.containers() {
            let dir = self.workspace.container_dir(*container);
            for path in read_dir_paths(&dir)? {
                let is_temp = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with('.') && name.ends_with(".tmp"))
                    .unwrap_or(false);
                if !is_temp || file_age(&path) < TEMP_FILE_GRACE {
                    continue;
                }
                fs::remove_file(&path).map_err(io_err(&path))?;
                warn!(path = %path.display(), "removed leftover temp file");
                report.removed_temp_files.push(path);
            }
        }
        Ok(())
    }

    /// Same-named files are copies of one record only when everything but
    /// the container field and `updated` matches. Copies collapse to the
    /// newest; distinct records sharing a name are only reported.
    fn remove_duplicate_copies(
        &self,
        family: Family,
        report: &mut RepairReport,
    ) -> Result<(), StoreError> {
        let mut by_name: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for (_, path) in self.scan(family)? {
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                by_name.entry(name.to_string()).or_default().push(path);
            }
        }
        for (name, paths) in by_name.into_iter().filter(|(_, paths)| paths.len() > 1) {
            let mut groups: Vec<(Option<String>, Vec<PathBuf>)> = Vec::new();
            for path in paths {
                let fingerprint = copy_fingerprint(family, &path);
                let slot = fingerprint.as_ref().and_then(|wanted| {
                    groups
                        .iter()
                        .position(|(seen, _)| seen.as_ref() == Some(wanted))
                });
                match slot {
                    Some(idx) => groups[idx].1.push(path),
                    None => groups.push((fingerprint, vec![path])),
                }
            }

            let distinct = groups.len();
            for (_, copies) in groups {
                let newest = copies.iter().max_by_key(|path| modified_time(path)).cloned();
                for path in copies {
                    if Some(&path) == newest.as_ref() {
                        continue;
                    }
                    fs::remove_file(&path).map_err(io_err(&path))?;
                    warn!(path = %path.display(), "removed older duplicate copy");
                    report.removed_duplicates.push(path);
                }
                if let Some(kept) = newest.filter(|_| distinct > 1) {
                    report.name_conflicts.push(kept);
                }
            }
            if distinct > 1 {
                warn!(name = %name, records = distinct, "different records share a file name");
            }
        }
        Ok(())
    }

    fn fix_container_fields(
        &self,
        family: Family,
        report: &mut RepairReport,
    ) -> Result<(), StoreError> {
        let field = family.container_field();
        for (container, path) in self.scan(family)? {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable record");
                    report.unreadable.push(path);
                    continue;
                }
            };
            if frontmatter::split(&text).is_none() {
                report.unreadable.push(path);
                continue;
            }
            let header = frontmatter::parse(&text);
            let current = header.get_str(field);
            if current == Some(container.dir_name()) || is_archived_completion(container, current)
            {
                continue;
            }
            let value = FieldValue::from(container.dir_name());
            let updated = frontmatter::update(&text, field, &value);
            write_atomic(&path, &updated)?;
            warn!(
                path = %path.display(),
                from = current.unwrap_or(""),
                to = container.dir_name(),
                "rewrote header to match directory"
            );
            report.fixed_headers.push(path);
        }
        Ok(())
    }

    fn report_duplicate_ids(&self, report: &mut RepairReport) -> Result<(), StoreError> {
        let mut by_number: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
        for (_, path) in self.scan(Family::Tasks)? {
            let number = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(task_number);
            if let Some(number) = number {
                by_number.entry(number).or_default().push(path);
            }
        }
        for (_, paths) in by_number.into_iter().filter(|(_, paths)| paths.len() > 1) {
            let id = id_from_path(Family::Tasks, &paths[0]);
            warn!(id = %id, copies = paths.len(), "task id used by several files");
            report.duplicate_ids.push(id);
        }
        Ok(())
    }

    /// Writes a new note under `dir`, suffixing `-2`, `-3`… until the name is
    /// free in every note kind directory, so later moves between kinds cannot collide.
    fn write_note(&self, dir: &Path, base: &str, content: &str) -> Result<PathBuf, StoreError> {
        let kind_dirs: Vec<PathBuf> = Family::Notes
            .containers()
            .iter()
            .map(|container| self.workspace.container_dir(*container))
            .collect();
        for suffix in 1..=MAX_NOTE_SUFFIX {
            let name = if suffix == 1 {
                format!("{}.md", base)
            } else {
                format!("{}-{}.md", base, suffix)
            };
            if kind_dirs.iter().any(|kind_dir| kind_dir.join(&name).exists()) {
                continue;
            }
            let path = dir.join(name);
            if write_new(&path, content)? {
                return Ok(path);
            }
        }
        Err(StoreError::AlreadyExists(dir.join(format!("{}.md", base))))
    }

    /// Record files per container, in family order then file name order.
    fn scan(&self, family: Family) -> Result<Vec<(Container, PathBuf)>, StoreError> {
        let mut found = Vec::new();
        for container in family.containers() {
            let dir = self.workspace.container_dir(*container);
            let mut paths: Vec<PathBuf> = read_dir_paths(&dir)?
                .into_iter()
                .filter(|path| is_record_file(path))
                .collect();
            if family == Family::Tasks {
                paths.sort_by_key(|path| {
                    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    (task_number(name).unwrap_or(u64::MAX), name.to_string())
                });
            }
            found.extend(paths.into_iter().map(|path| (*container, path)));
        }
        Ok(found)
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn header_error(path: &Path, err: frontmatter::FrontmatterError) -> StoreError {
    StoreError::invalid("frontmatter", format!("{}: {}", path.display(), err))
}

fn merge_extra(header: &mut Header, extra: &Header) {
    for (key, value) in extra.iter() {
        header.insert(key, value.clone());
    }
}

/// Header and body with the fields a transition rewrites left out.
fn copy_fingerprint(family: Family, path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let mut header = frontmatter::parse(&text);
    header.remove(family.container_field());
    header.remove("updated");
    Some(format!(
        "{}{}",
        frontmatter::serialize(&header),
        frontmatter::body(&text)
    ))
}

fn is_archived_completion(container: Container, current: Option<&str>) -> bool {
    container == Container::Task(TaskStatus::Archived)
        && current == Some(TaskStatus::Completed.as_str())
}

fn matches_exact_id(family: Family, stem: &str, query: &str) -> bool {
    match family {
        Family::Tasks => {
            let wanted = query.trim_start_matches('#');
            match (task_number(stem), wanted.parse::<u64>()) {
                (Some(have), Ok(want)) => have == want,
                _ => false,
            }
        }
        Family::Notes => stem == query,
    }
}

fn matches_name_ignore_case(family: Family, stem: &str, query: &str) -> bool {
    if stem.eq_ignore_ascii_case(query) {
        return true;
    }
    let name = match family {
        Family::Tasks => title_part(stem),
        Family::Notes => stem,
    };
    name.eq_ignore_ascii_case(query) || name == template::slug(query)
}

fn matches_substring(_family: Family, stem: &str, query: &str) -> bool {
    let stem = stem.to_lowercase();
    stem.contains(&query.to_lowercase()) || stem.contains(&template::slug(query))
}

fn read_dir_paths(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file())
                .collect();
            paths.sort();
            Ok(paths)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(io_err(dir)(err)),
    }
}

fn modified_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn file_age(path: &Path) -> Duration {
    modified_time(path).elapsed().unwrap_or_default()
}

/// Creates `path` only if it does not exist. `Ok(false)` means it was taken.
fn write_new(path: &Path, content: &str) -> Result<bool, StoreError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(io_err(path)(err)),
    };
    file.write_all(content.as_bytes()).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))?;
    Ok(true)
}

/// Temp file in the destination directory, fsync, checksum, then rename.
fn write_atomic(dest: &Path, content: &str) -> Result<(), StoreError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(".{}.tmp", Ulid::new()));
    let result =
        write_verified(&tmp, content).and_then(|_| fs::rename(&tmp, dest).map_err(io_err(dest)));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_verified(tmp: &Path, content: &str) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp)
        .map_err(io_err(tmp))?;
    file.write_all(content.as_bytes()).map_err(io_err(tmp))?;
    file.sync_all().map_err(io_err(tmp))?;
    drop(file);

    let written = fs::read(tmp).map_err(io_err(tmp))?;
    if Sha256::digest(&written) != Sha256::digest(content.as_bytes()) {
        return Err(StoreError::VerifyFailed(tmp.to_path_buf()));
    }
    Ok(())
}

/// Parses a `key=value` assignment. `a,b` stays scalar unless wrapped in brackets.
pub fn parse_field_assignment(raw: &str) -> Result<(String, FieldValue), StoreError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(StoreError::invalid(raw, "expected key=value"));
    };
    let key = key.trim();
    if !frontmatter::is_valid_key(key) {
        return Err(StoreError::invalid(key, "not a usable header key"));
    }
    let value = value.trim();
    let parsed = frontmatter::parse_fields(&format!("{}: {}", key, value));
    let value = parsed
        .get(key)
        .cloned()
        .unwrap_or_else(|| FieldValue::from(value));
    Ok((key.to_string(), value))
}
