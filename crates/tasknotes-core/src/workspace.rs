use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::{Container, Family};

/// Directory that designates a local workspace; the marker lives inside it.
pub const MARKER_DIR: &str = ".tasknotes";
pub const MARKER_FILE: &str = "workspace.json";
pub const MARKER_VERSION: u32 = 1;

pub const HOME_ENV: &str = "TASKNOTES_HOME";
pub const TASKS_DIR_ENV: &str = "TASKNOTES_TASKS_DIR";
pub const NOTES_DIR_ENV: &str = "TASKNOTES_NOTES_DIR";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("No workspace found in {} or any parent directory", .0.display())]
    NotFound(PathBuf),
    #[error("Unable to resolve the global workspace; set TASKNOTES_HOME to an absolute path")]
    NoGlobalHome,
    #[error("Invalid workspace marker {}: {reason}", path.display())]
    InvalidMarker { path: PathBuf, reason: String },
    #[error("Workspace IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    pub fn remedy(&self) -> Option<&'static str> {
        match self {
            WorkspaceError::NotFound(_) => {
                Some("run `tasknotes init` here, or pass --global to use your personal workspace")
            }
            WorkspaceError::NoGlobalHome => Some("export TASKNOTES_HOME=/path/to/workspace"),
            WorkspaceError::InvalidMarker { .. } => {
                Some("fix or delete the marker file, then run `tasknotes init` again")
            }
            WorkspaceError::Io(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMarker {
    pub version: u32,
    pub tasks_dir: PathBuf,
    pub notes_dir: PathBuf,
}

impl Default for WorkspaceMarker {
    fn default() -> Self {
        Self {
            version: MARKER_VERSION,
            tasks_dir: PathBuf::from("tasks"),
            notes_dir: PathBuf::from("notes"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    Local,
    Global,
    Override,
}

impl DiscoveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryMode::Local => "local",
            DiscoveryMode::Global => "global",
            DiscoveryMode::Override => "override",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootOverrides {
    pub tasks: Option<PathBuf>,
    pub notes: Option<PathBuf>,
}

impl RootOverrides {
    pub fn is_complete(&self) -> bool {
        self.tasks.is_some() && self.notes.is_some()
    }
}

/// Everything resolution depends on, passed in explicitly.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub start_dir: PathBuf,
    pub force_global: bool,
    pub global_home: Option<PathBuf>,
    pub overrides: RootOverrides,
}

impl ResolveRequest {
    pub fn new(start_dir: impl Into<PathBuf>) -> Self {
        Self {
            start_dir: start_dir.into(),
            force_global: false,
            global_home: None,
            overrides: RootOverrides::default(),
        }
    }

    pub fn force_global(mut self, force: bool) -> Self {
        self.force_global = force;
        self
    }

    pub fn with_global_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.global_home = Some(home.into());
        self
    }

    pub fn with_overrides(mut self, overrides: RootOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Builds a request from `TASKNOTES_HOME`, `HOME`/`USERPROFILE` and the
    /// per-family override variables.
    pub fn from_env(start_dir: impl Into<PathBuf>, force_global: bool) -> Self {
        Self {
            start_dir: start_dir.into(),
            force_global,
            global_home: resolve_global_home(),
            overrides: RootOverrides {
                tasks: env_path(TASKS_DIR_ENV),
                notes: env_path(NOTES_DIR_ENV),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub mode: DiscoveryMode,
    pub tasks_root: PathBuf,
    pub notes_root: PathBuf,
    /// Directory holding the marker and workspace-level settings.
    pub config_dir: Option<PathBuf>,
    pub global_home: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl Workspace {
    pub fn root(&self, family: Family) -> &Path {
        match family {
            Family::Tasks => &self.tasks_root,
            Family::Notes => &self.notes_root,
        }
    }

    pub fn container_dir(&self, container: Container) -> PathBuf {
        self.root(container.family()).join(container.dir_name())
    }

    pub fn ensure_layout(&self) -> Result<(), std::io::Error> {
        for family in [Family::Tasks, Family::Notes] {
            for container in family.containers() {
                fs::create_dir_all(self.container_dir(*container))?;
            }
        }
        Ok(())
    }

    /// Settings directories in precedence order: workspace first, then global.
    pub fn config_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(dir) = self.config_dir.as_ref() {
            dirs.push(dir.clone());
        }
        if let Some(home) = self.global_home.as_ref() {
            if !dirs.contains(home) {
                dirs.push(home.clone());
            }
        }
        dirs
    }
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    env_path("HOME").or_else(|| env_path("USERPROFILE"))
}

pub fn resolve_global_home() -> Option<PathBuf> {
    env_path(HOME_ENV).or_else(|| resolve_user_home_dir().map(|home| home.join(MARKER_DIR)))
}

fn env_path(name: &str) -> Option<PathBuf> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

pub fn marker_path(marker_dir: &Path) -> PathBuf {
    marker_dir.join(MARKER_FILE)
}

pub fn load_marker(path: &Path) -> Result<WorkspaceMarker, WorkspaceError> {
    let text = fs::read_to_string(path)?;
    let marker: WorkspaceMarker =
        serde_json::from_str(&text).map_err(|err| WorkspaceError::InvalidMarker {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if marker.version != MARKER_VERSION {
        return Err(WorkspaceError::InvalidMarker {
            path: path.to_path_buf(),
            reason: format!("unsupported format version {}", marker.version),
        });
    }
    Ok(marker)
}

pub fn write_marker(
    marker_dir: &Path,
    marker: &WorkspaceMarker,
) -> Result<PathBuf, WorkspaceError> {
    fs::create_dir_all(marker_dir)?;
    let path = marker_path(marker_dir);
    let body = serde_json::to_string_pretty(marker).map_err(|err| WorkspaceError::InvalidMarker {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    fs::write(&path, format!("{}\n", body))?;
    Ok(path)
}

/// Walks up from `start` looking for `.tasknotes/workspace.json`. Unreadable
/// markers are skipped with a warning so an outer workspace can still win.
pub fn find_marker_dir(
    start: &Path,
    warnings: &mut Vec<String>,
) -> Option<(PathBuf, WorkspaceMarker)> {
    for candidate in start.ancestors() {
        let marker_dir = candidate.join(MARKER_DIR);
        let path = marker_path(&marker_dir);
        if !path.is_file() {
            continue;
        }
        match load_marker(&path) {
            Ok(marker) => return Some((marker_dir, marker)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring workspace marker");
                warnings.push(format!("Ignoring workspace marker {}: {}", path.display(), err));
            }
        }
    }
    None
}

pub fn resolve(request: &ResolveRequest) -> Result<Workspace, WorkspaceError> {
    let start = request
        .start_dir
        .canonicalize()
        .unwrap_or_else(|_| request.start_dir.clone());
    let mut warnings = Vec::new();
    // A relative home is taken from the start directory so roots are always absolute.
    let global_home = request.global_home.as_ref().map(|home| start.join(home));

    let (mode, tasks_root, notes_root, config_dir) = if request.force_global {
        match global_home.as_ref() {
            Some(home) => {
                let (tasks, notes) = global_roots(home, &mut warnings);
                (DiscoveryMode::Global, tasks, notes, Some(home.clone()))
            }
            None if request.overrides.is_complete() => override_roots(request, &start),
            None => return Err(WorkspaceError::NoGlobalHome),
        }
    } else if let Some((marker_dir, marker)) = find_marker_dir(&start, &mut warnings) {
        (
            DiscoveryMode::Local,
            marker_dir.join(&marker.tasks_dir),
            marker_dir.join(&marker.notes_dir),
            Some(marker_dir),
        )
    } else if request.overrides.is_complete() {
        override_roots(request, &start)
    } else {
        return Err(WorkspaceError::NotFound(start));
    };

    let tasks_root = request
        .overrides
        .tasks
        .as_ref()
        .map(|path| start.join(path))
        .unwrap_or(tasks_root);
    let notes_root = request
        .overrides
        .notes
        .as_ref()
        .map(|path| start.join(path))
        .unwrap_or(notes_root);

    debug!(
        mode = mode.as_str(),
        tasks = %tasks_root.display(),
        notes = %notes_root.display(),
        "resolved workspace"
    );
    Ok(Workspace {
        mode,
        tasks_root,
        notes_root,
        config_dir,
        global_home,
        warnings,
    })
}

fn override_roots(
    request: &ResolveRequest,
    start: &Path,
) -> (DiscoveryMode, PathBuf, PathBuf, Option<PathBuf>) {
    let tasks = request.overrides.tasks.clone().unwrap_or_default();
    let notes = request.overrides.notes.clone().unwrap_or_default();
    (DiscoveryMode::Override, start.join(tasks), start.join(notes), None)
}

/// The global home doubles as a marker directory; without a marker the
/// default layout applies.
fn global_roots(home: &Path, warnings: &mut Vec<String>) -> (PathBuf, PathBuf) {
    let path = marker_path(home);
    let marker = if path.is_file() {
        match load_marker(&path) {
            Ok(marker) => marker,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring global workspace marker");
                warnings.push(format!("Ignoring workspace marker {}: {}", path.display(), err));
                WorkspaceMarker::default()
            }
        }
    } else {
        WorkspaceMarker::default()
    };
    (home.join(marker.tasks_dir), home.join(marker.notes_dir))
}

/// Creates `.tasknotes/` under `dir` (keeping an existing marker) and every
/// status and kind directory.
pub fn init_local(dir: &Path) -> Result<Workspace, WorkspaceError> {
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let marker_dir = dir.join(MARKER_DIR);
    let path = marker_path(&marker_dir);
    let marker = if path.is_file() {
        load_marker(&path)?
    } else {
        let marker = WorkspaceMarker::default();
        write_marker(&marker_dir, &marker)?;
        marker
    };
    let workspace = Workspace {
        mode: DiscoveryMode::Local,
        tasks_root: marker_dir.join(&marker.tasks_dir),
        notes_root: marker_dir.join(&marker.notes_dir),
        config_dir: Some(marker_dir),
        global_home: None,
        warnings: Vec::new(),
    };
    workspace.ensure_layout()?;
    Ok(workspace)
}

pub fn init_global(home: &Path) -> Result<Workspace, WorkspaceError> {
    fs::create_dir_all(home)?;
    let home = home.canonicalize()?;
    let home = home.as_path();
    let mut warnings = Vec::new();
    let (tasks_root, notes_root) = global_roots(home, &mut warnings);
    let workspace = Workspace {
        mode: DiscoveryMode::Global,
        tasks_root,
        notes_root,
        config_dir: Some(home.to_path_buf()),
        global_home: Some(home.to_path_buf()),
        warnings,
    };
    workspace.ensure_layout()?;
    Ok(workspace)
}
