use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::id_alloc::AllocatorOptions;
use crate::record::TaskStatus;
use crate::workspace::Workspace;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Zero-padding width for task ids.
    pub id_width: Option<usize>,
    pub lock_attempts: Option<u32>,
    pub lock_backoff_ms: Option<u64>,
    pub lock_stale_after_ms: Option<u64>,
    /// Status new tasks start in when none is given.
    pub default_task_status: Option<String>,
    /// Editor command line, e.g. "code --wait".
    pub editor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingSource {
    Workspace,
    Global,
    Default,
}

impl SettingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingSource::Workspace => "workspace",
            SettingSource::Global => "global",
            SettingSource::Default => "default",
        }
    }
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

pub fn read_settings(dir: &Path) -> Result<Option<Settings>, ConfigError> {
    let path = config_path(dir);
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path)?;
    Ok(Some(toml::from_str::<Settings>(&text)?))
}

/// Like [`read_settings`], but a broken file is logged and ignored.
pub fn load_settings(dir: &Path) -> Option<Settings> {
    match read_settings(dir) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(path = %config_path(dir).display(), error = %err, "ignoring settings file");
            None
        }
    }
}

pub fn write_settings(dir: &Path, settings: &Settings) -> Result<PathBuf, ConfigError> {
    fs::create_dir_all(dir)?;
    let path = config_path(dir);
    let body = toml::to_string_pretty(settings)?;
    fs::write(&path, body)?;
    Ok(path)
}

/// Workspace settings layered over global settings.
#[derive(Debug, Clone, Default)]
pub struct EffectiveSettings {
    pub workspace: Option<Settings>,
    pub global: Option<Settings>,
}

impl EffectiveSettings {
    pub fn load(workspace: &Workspace) -> Self {
        let workspace_settings = workspace.config_dir.as_deref().and_then(load_settings);
        let global = workspace
            .global_home
            .as_deref()
            .filter(|home| workspace.config_dir.as_deref() != Some(*home))
            .and_then(load_settings);
        Self {
            workspace: workspace_settings,
            global,
        }
    }

    fn pick<T>(&self, field: impl Fn(&Settings) -> Option<T>) -> Option<(T, SettingSource)> {
        if let Some(value) = self.workspace.as_ref().and_then(&field) {
            return Some((value, SettingSource::Workspace));
        }
        if let Some(value) = self.global.as_ref().and_then(&field) {
            return Some((value, SettingSource::Global));
        }
        None
    }

    pub fn id_width_with_source(&self) -> (usize, SettingSource) {
        self.pick(|settings| settings.id_width.filter(|width| (1..=12).contains(width)))
            .unwrap_or((AllocatorOptions::default().width, SettingSource::Default))
    }

    pub fn default_task_status_with_source(&self) -> (TaskStatus, SettingSource) {
        let picked = self.pick(|settings| {
            let raw = settings.default_task_status.as_deref()?;
            match raw.parse::<TaskStatus>() {
                Ok(status) => Some(status),
                Err(err) => {
                    warn!(error = %err, "ignoring default_task_status");
                    None
                }
            }
        });
        picked.unwrap_or((TaskStatus::Backlog, SettingSource::Default))
    }

    pub fn default_task_status(&self) -> TaskStatus {
        self.default_task_status_with_source().0
    }

    pub fn editor(&self) -> Option<String> {
        self.pick(|settings| {
            settings
                .editor
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
        .map(|(value, _)| value)
    }

    pub fn allocator_options(&self) -> AllocatorOptions {
        let mut options = AllocatorOptions::default();
        options.width = self.id_width_with_source().0;
        if let Some((attempts, _)) = self.pick(|settings| settings.lock_attempts) {
            options.max_attempts = attempts.max(1);
        }
        if let Some((ms, _)) = self.pick(|settings| settings.lock_backoff_ms) {
            options.base_delay = Duration::from_millis(ms);
            options.max_delay = options.max_delay.max(options.base_delay);
        }
        if let Some((ms, _)) = self.pick(|settings| settings.lock_stale_after_ms) {
            options.stale_after = Duration::from_millis(ms);
        }
        options
    }
}
