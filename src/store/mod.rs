//! Durable target storage.
//!
//! File format: a pretty-printed JSON array of `Target` records. This file is
//! the only durable state, so every write goes to a temp file in the same
//! directory, is fsynced, then renamed over the destination.
//!
//! Loading repairs what a crash can leave behind:
//!   inFlight = true       → false
//!   status = active       → ready    (only when it was in flight)
//!   status = preparing    → pending  (the prepare run died with the process)
//! and writes the repaired set straight back.

use crate::target::{Target, TargetId, TargetStatus};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("targets file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("targets file {path} contains duplicate id {id}")]
    DuplicateId { path: PathBuf, id: TargetId },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize targets: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PersistenceError {
    /// Errors that must stop the daemon from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PersistenceError::Corrupt { .. } | PersistenceError::DuplicateId { .. }
        )
    }
}

/// What `load` found and fixed.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub targets: Vec<Target>,
    pub repaired: Vec<TargetId>,
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<Target>, PersistenceError> {
        self.load_with_report().map(|report| report.targets)
    }

    /// Read, validate and repair. A missing file is an empty list; a corrupt
    /// one is an error.
    pub fn load_with_report(&self) -> Result<LoadReport, PersistenceError> {
        let mut targets = match self.read_raw()? {
            Some(targets) => targets,
            None => {
                info!(path = %self.path.display(), "no targets file, starting empty");
                return Ok(LoadReport::default());
            }
        };

        let repaired = repair(&mut targets);
        if !repaired.is_empty() {
            info!(count = repaired.len(), "reset stale in-flight state on startup");
            if let Err(e) = self.save(&targets) {
                error!(error = %e, "failed to persist repaired targets, continuing with in-memory state");
            }
        }

        info!(count = targets.len(), path = %self.path.display(), "targets loaded");
        Ok(LoadReport { targets, repaired })
    }

    /// Read without repairing (maintenance tooling).
    pub fn read_raw(&self) -> Result<Option<Vec<Target>>, PersistenceError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let targets: Vec<Target> =
            serde_json::from_str(&contents).map_err(|source| PersistenceError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        let mut seen = HashSet::new();
        for t in &targets {
            if !seen.insert(t.id.clone()) {
                return Err(PersistenceError::DuplicateId {
                    path: self.path.clone(),
                    id: t.id.clone(),
                });
            }
        }
        Ok(Some(targets))
    }

    pub fn save(&self, targets: &[Target]) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(targets)?;
        atomic_write(&self.path, json.as_bytes()).map_err(|source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Copy the current file to `<name>.backup.<unix_ms>`. `None` if there is
    /// nothing to back up.
    pub fn backup(&self) -> Result<Option<PathBuf>, PersistenceError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(
            ".backup.{}",
            chrono::Utc::now().timestamp_millis()
        ));
        let backup = PathBuf::from(name);
        std::fs::copy(&self.path, &backup).map_err(|source| PersistenceError::Write {
            path: backup.clone(),
            source,
        })?;
        Ok(Some(backup))
    }
}

/// Clear transient run state. Returns the ids that changed.
pub fn repair(targets: &mut [Target]) -> Vec<TargetId> {
    let mut repaired = Vec::new();
    for t in targets.iter_mut() {
        let before = (t.status, t.runtime_flags.in_flight);

        if t.runtime_flags.in_flight {
            t.runtime_flags.in_flight = false;
            if t.status == TargetStatus::Active {
                t.status = TargetStatus::Ready;
            }
        }
        if t.status == TargetStatus::Preparing {
            t.status = TargetStatus::Pending;
        }

        if before != (t.status, t.runtime_flags.in_flight) {
            warn!(
                target_id = %t.id,
                url = %t.url,
                from = %before.0,
                to = %t.status,
                "repaired interrupted target"
            );
            repaired.push(t.id.clone());
        }
    }
    repaired
}

/// Operator reset: like `repair`, but every `active` target drops back to
/// `ready` whether or not it was in flight.
pub fn reset(targets: &mut [Target]) -> Vec<TargetId> {
    let mut changed = repair(targets);
    for t in targets.iter_mut() {
        if t.status == TargetStatus::Active {
            t.status = TargetStatus::Ready;
            if !changed.contains(&t.id) {
                changed.push(t.id.clone());
            }
        }
    }
    changed
}

fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("targets.json");
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}
