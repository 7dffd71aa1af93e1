//! # StateStore — persistence boundary for definitions and run records
//!
//! ## Responsibility
//! Record committed thought definitions keyed by `(name, version)` and
//! terminal run reports keyed by run id, and read them back.
//!
//! ## Guarantees
//! - Crash-consistent files: [`FileStore`] writes to a temporary file in the
//!   target directory and renames it into place, so a reader sees either the
//!   old record or the new one
//! - Thread-safe: both stores are `Send + Sync`
//!
//! ## NOT Responsible For
//! - Deciding what to persist (see: `self_modify`, `scheduler`)
//! - Replication, compaction, or retention

use crate::graph::RunId;
use crate::scheduler::RunReport;
use crate::thought::ThoughtDefinition;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors from a [`StateStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("store record {path} is not valid JSON: {source}")]
    Serde {
        /// Path (or key) involved.
        path: String,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// Durable record of definitions and runs.
///
/// Synchronous by contract: the self-modification pipeline persists a
/// definition while it holds the registry write lock.
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Record a committed definition.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the record cannot be written.
    fn put_definition(&self, definition: &ThoughtDefinition) -> Result<(), StoreError>;

    /// Fetch one definition version.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the record exists but cannot be read.
    fn get_definition(&self, name: &str, version: u32) -> Result<Option<ThoughtDefinition>, StoreError>;

    /// Every stored definition, ordered by name then version.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on the first unreadable record.
    fn list_definitions(&self) -> Result<Vec<ThoughtDefinition>, StoreError>;

    /// Record a run report, replacing any earlier report for the same run.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the record cannot be written.
    fn put_run(&self, report: &RunReport) -> Result<(), StoreError>;

    /// Fetch a run report.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the record exists but cannot be read.
    fn get_run(&self, run_id: RunId) -> Result<Option<RunReport>, StoreError>;
}

// ── MemoryStore ────────────────────────────────────────────────────────────

/// Process-local store; the default when no state directory is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    definitions: DashMap<(String, u32), ThoughtDefinition>,
    runs: DashMap<RunId, RunReport>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn put_definition(&self, definition: &ThoughtDefinition) -> Result<(), StoreError> {
        self.definitions.insert(
            (definition.id.name.clone(), definition.id.version),
            definition.clone(),
        );
        Ok(())
    }

    fn get_definition(&self, name: &str, version: u32) -> Result<Option<ThoughtDefinition>, StoreError> {
        Ok(self
            .definitions
            .get(&(name.to_string(), version))
            .map(|d| d.value().clone()))
    }

    fn list_definitions(&self) -> Result<Vec<ThoughtDefinition>, StoreError> {
        let mut all: Vec<ThoughtDefinition> =
            self.definitions.iter().map(|d| d.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn put_run(&self, report: &RunReport) -> Result<(), StoreError> {
        self.runs.insert(report.run_id, report.clone());
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunReport>, StoreError> {
        Ok(self.runs.get(&run_id).map(|r| r.value().clone()))
    }
}

// ── FileStore ──────────────────────────────────────────────────────────────

/// JSON files under a state directory:
/// `definitions/<name>/<version>.json` and `runs/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join("definitions"), root.join("runs")] {
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(Self { root })
    }

    /// The state directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn definition_path(&self, name: &str, version: u32) -> PathBuf {
        self.root
            .join("definitions")
            .join(name)
            .join(format!("{version}.json"))
    }

    fn run_path(&self, run_id: RunId) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.json"))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serde {
        path: path.display().to_string(),
        source: e,
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
    std::fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    debug!(path = %path.display(), "store: wrote record");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Serde {
            path: path.display().to_string(),
            source: e,
        })
}

impl StateStore for FileStore {
    fn put_definition(&self, definition: &ThoughtDefinition) -> Result<(), StoreError> {
        write_json(
            &self.definition_path(&definition.id.name, definition.id.version),
            definition,
        )
    }

    fn get_definition(&self, name: &str, version: u32) -> Result<Option<ThoughtDefinition>, StoreError> {
        read_json(&self.definition_path(name, version))
    }

    fn list_definitions(&self) -> Result<Vec<ThoughtDefinition>, StoreError> {
        let base = self.root.join("definitions");
        let mut all = Vec::new();
        let names = std::fs::read_dir(&base).map_err(|e| io_err(&base, e))?;
        for name_dir in names {
            let name_dir = name_dir.map_err(|e| io_err(&base, e))?.path();
            if !name_dir.is_dir() {
                continue;
            }
            let files = std::fs::read_dir(&name_dir).map_err(|e| io_err(&name_dir, e))?;
            for file in files {
                let path = file.map_err(|e| io_err(&name_dir, e))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(definition) = read_json::<ThoughtDefinition>(&path)? {
                    all.push(definition);
                }
            }
        }
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn put_run(&self, report: &RunReport) -> Result<(), StoreError> {
        write_json(&self.run_path(report.run_id), report)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunReport>, StoreError> {
        read_json(&self.run_path(run_id))
    }
}
