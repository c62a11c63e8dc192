use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::record::{is_record_file, task_number, TaskStatus};

/// Last issued number, plain text.
pub const LAST_ID_FILE: &str = ".last_id";
/// Held while allocating; contains the holder's pid.
pub const LOCK_FILE: &str = ".id.lock";
pub const DEFAULT_ID_WIDTH: usize = 3;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("Id allocator IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Task ids are exhausted: {last} was the last number that fits")]
    Exhausted { last: u64 },
}

fn next_number(last: u64) -> Result<u64, AllocError> {
    last.checked_add(1).ok_or(AllocError::Exhausted { last })
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AllocError + '_ {
    move |source| AllocError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorOptions {
    pub width: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A lock file at least this old whose advisory lock is free belongs to a
    /// crashed holder.
    pub stale_after: Duration,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            width: DEFAULT_ID_WIDTH,
            max_attempts: 12,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(250),
            stale_after: Duration::from_secs(10),
        }
    }
}

impl AllocatorOptions {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: String,
    pub number: u64,
    /// Issued without holding the lock; may collide under heavy contention.
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct IdAllocator {
    root: PathBuf,
    options: AllocatorOptions,
}

struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release id lock");
        }
    }
}

impl IdAllocator {
    pub fn new(tasks_root: impl Into<PathBuf>) -> Self {
        Self::with_options(tasks_root, AllocatorOptions::default())
    }

    pub fn with_options(tasks_root: impl Into<PathBuf>, options: AllocatorOptions) -> Self {
        Self {
            root: tasks_root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &AllocatorOptions {
        &self.options
    }

    pub fn format(&self, number: u64) -> String {
        format!("{:0width$}", number, width = self.options.width)
    }

    /// Issues the next id. Retries the lock with backoff, then falls back to
    /// an unsynchronized read so the caller is never blocked indefinitely.
    pub fn next_id(&self) -> Result<Allocation, AllocError> {
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
        let attempts = self.options.max_attempts.max(1);
        for attempt in 0..attempts {
            if let Some(guard) = self.try_lock()? {
                let allocation = self.allocate_locked();
                drop(guard);
                return allocation;
            }
            if attempt + 1 < attempts {
                let delay = self.options.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "id lock busy");
                thread::sleep(delay);
            }
        }

        let number = next_number(self.highest_issued()?)?;
        warn!(
            root = %self.root.display(),
            attempts,
            number,
            "id lock contention exhausted retries; issuing id without the lock"
        );
        Ok(Allocation {
            id: self.format(number),
            number,
            degraded: true,
        })
    }

    /// Highest number known from the marker or from existing file names.
    pub fn highest_issued(&self) -> Result<u64, AllocError> {
        let recorded = self.read_marker().unwrap_or(0);
        Ok(recorded.max(self.max_observed()?))
    }

    fn allocate_locked(&self) -> Result<Allocation, AllocError> {
        let recorded = self.read_marker();
        let observed = self.max_observed()?;
        if let Some(recorded) = recorded {
            if observed > recorded {
                warn!(recorded, observed, "id marker is behind existing records; reconciling");
            }
        }
        let number = next_number(recorded.unwrap_or(0).max(observed))?;
        self.write_marker(number)?;
        debug!(number, "issued id");
        Ok(Allocation {
            id: self.format(number),
            number,
            degraded: false,
        })
    }

    fn try_lock(&self) -> Result<Option<LockGuard>, AllocError> {
        let path = self.root.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(err) = file.try_lock_exclusive() {
                    debug!(error = %err, "advisory lock unavailable; relying on lock file only");
                }
                let _ = writeln!(file, "{}", std::process::id());
                let _ = file.flush();
                Ok(Some(LockGuard {
                    file: Some(file),
                    path,
                }))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                self.clear_stale_lock(&path);
                Ok(None)
            }
            Err(err) => Err(io_err(&path)(err)),
        }
    }

    /// Removes a lock left behind by a holder that died. Best effort: the
    /// next attempt will try to create the lock again either way.
    fn clear_stale_lock(&self, path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < self.options.stale_after {
            return false;
        }
        let Ok(file) = File::open(path) else {
            return false;
        };
        if file.try_lock_exclusive().is_err() {
            return false;
        }
        let holder = fs::read_to_string(path).unwrap_or_default();
        let _ = file.unlock();
        drop(file);
        warn!(
            path = %path.display(),
            holder = holder.trim(),
            age_ms = age.as_millis() as u64,
            "removing stale id lock"
        );
        fs::remove_file(path).is_ok()
    }

    fn read_marker(&self) -> Option<u64> {
        let path = self.root.join(LAST_ID_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable id marker");
                return None;
            }
        };
        match text.trim().parse::<u64>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(
                    path = %path.display(),
                    content = text.trim(),
                    "ignoring malformed id marker"
                );
                None
            }
        }
    }

    fn write_marker(&self, number: u64) -> Result<(), AllocError> {
        let path = self.root.join(LAST_ID_FILE);
        let tmp = self.root.join(format!("{}.{}.tmp", LAST_ID_FILE, Ulid::new()));
        fs::write(&tmp, format!("{}\n", number)).map_err(io_err(&tmp))?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path)(err));
        }
        Ok(())
    }

    fn max_observed(&self) -> Result<u64, AllocError> {
        let mut max = 0;
        for status in TaskStatus::ALL {
            let dir = self.root.join(status.as_str());
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&dir)(err)),
            };
            for entry in entries.filter_map(|entry| entry.ok()) {
                let path = entry.path();
                if !is_record_file(&path) {
                    continue;
                }
                let number = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(task_number);
                if let Some(number) = number {
                    max = max.max(number);
                }
            }
        }
        Ok(max)
    }
}
