//! Durable catalog storage.
//!
//! Two disk formats back every catalog in the manager:
//!
//! - [`CatalogFile`] — a whole-catalog JSON array rewritten atomically on
//!   every mutation, shadowed by a `<file>.bak` copy taken before any write
//!   that would empty a non-empty catalog.
//! - [`JsonlLog`] — an append-only newline-delimited JSON log where each
//!   record names its own id; reloads are latest-wins per id and corrupt
//!   lines are skipped rather than fatal.
//!
//! # Disk format
//!
//! ```text
//! agents/agents.json        CatalogFile<AgentConfig>
//! agents/agents.json.bak    shadow copy (taken on empty-over-non-empty)
//! skills/skills.json        CatalogFile<SkillDefinition>
//! automation/rules.json     CatalogFile<AutomationRule>
//! messaging/messages.jsonl  JsonlLog<Message>
//! state/task-history.jsonl  JsonlLog<TaskHistoryEntry>
//! ```
//!
//! Startup reads walk a recovery ladder: primary file, then the `.bak`
//! shadow, then (caller-driven) the index-server side channel. A recovered
//! catalog is immediately re-persisted to the primary path.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Errors surfaced by the persistence layer.
#[derive(Debug)]
pub enum PersistError {
    /// Filesystem error reading or writing the catalog.
    Io(std::io::Error),
    /// Neither the primary file nor the `.bak` shadow could be parsed.
    Unreadable { path: PathBuf, detail: String },
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "persistence I/O error: {}", e),
            PersistError::Unreadable { path, detail } => {
                write!(f, "catalog {} unreadable: {}", path.display(), detail)
            }
        }
    }
}

impl Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::Io(e)
    }
}

/// Write `value` to `path` atomically (temp file + rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a single JSON value from `path`. `Ok(None)` when the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    if !path.exists() {
        return Ok(None);
    }
    let body = fs::read_to_string(path)?;
    match serde_json::from_str(&body) {
        Ok(v) => Ok(Some(v)),
        Err(e) => Err(PersistError::Unreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }),
    }
}

/// A whole-catalog JSON file with a `.bak` shadow.
pub struct CatalogFile {
    path: PathBuf,
}

/// Outcome of [`CatalogFile::load`], noting which copy was used.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup,
    Missing,
}

impl CatalogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bak_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".bak");
        PathBuf::from(os)
    }

    /// Persist the full catalog.
    ///
    /// When `items` is empty and the current on-disk catalog is non-empty,
    /// the current file is copied to `<path>.bak` before being overwritten,
    /// so a later cold start can recover the wiped data.
    pub fn save<T: Serialize>(&self, items: &[T]) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if items.is_empty() && self.primary_is_non_empty() {
            fs::copy(&self.path, self.bak_path())?;
            log::warn!(
                "CatalogFile: writing empty catalog over non-empty {}; shadow copied to .bak",
                self.path.display()
            );
        }
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_string_pretty(items)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load the catalog, healing from the `.bak` shadow when needed.
    ///
    /// Recovery ladder:
    /// 1. Primary missing but `.bak` present → restore `.bak` to primary.
    /// 2. Primary unparseable, or empty while `.bak` is non-empty → prefer
    ///    the `.bak` contents and re-persist the primary.
    /// 3. Both unusable → [`PersistError::Unreadable`]; the caller may try
    ///    the side channel.
    pub fn load<T: Serialize + DeserializeOwned>(
        &self,
    ) -> Result<(Vec<T>, LoadSource), PersistError> {
        let bak = self.bak_path();

        if !self.path.exists() {
            if bak.exists() {
                fs::copy(&bak, &self.path)?;
                log::warn!(
                    "CatalogFile: primary {} missing, restored from .bak",
                    self.path.display()
                );
            } else {
                return Ok((Vec::new(), LoadSource::Missing));
            }
        }

        let primary = Self::parse_file::<T>(&self.path);
        match primary {
            Ok(items) if !items.is_empty() => Ok((items, LoadSource::Primary)),
            Ok(items) => {
                // Empty primary: prefer a non-empty shadow.
                match Self::parse_file::<T>(&bak) {
                    Ok(shadow) if !shadow.is_empty() => {
                        log::warn!(
                            "CatalogFile: {} is empty but .bak has {} entries, recovering",
                            self.path.display(),
                            shadow.len()
                        );
                        self.save(&shadow)?;
                        Ok((shadow, LoadSource::Backup))
                    }
                    _ => Ok((items, LoadSource::Primary)),
                }
            }
            Err(primary_err) => match Self::parse_file::<T>(&bak) {
                Ok(shadow) if !shadow.is_empty() => {
                    log::warn!(
                        "CatalogFile: {} unparseable ({}), recovered {} entries from .bak",
                        self.path.display(),
                        primary_err,
                        shadow.len()
                    );
                    self.save(&shadow)?;
                    Ok((shadow, LoadSource::Backup))
                }
                _ => Err(PersistError::Unreadable {
                    path: self.path.clone(),
                    detail: primary_err,
                }),
            },
        }
    }

    fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, String> {
        if !path.exists() {
            return Err("missing".to_string());
        }
        let body = fs::read_to_string(path).map_err(|e| e.to_string())?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&body).map_err(|e| e.to_string())
    }

    fn primary_is_non_empty(&self) -> bool {
        matches!(Self::parse_file::<serde_json::Value>(&self.path), Ok(items) if !items.is_empty())
    }
}

/// An append-only newline-delimited JSON log.
pub struct JsonlLog {
    path: PathBuf,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single JSON line.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Load all records, keeping only the latest line per id.
    ///
    /// `id_of` extracts the record id used for the latest-wins merge. Lines
    /// that fail to parse are skipped with a warning; insertion order of
    /// first appearance is preserved.
    pub fn load<T, F>(&self, id_of: F) -> Result<Vec<T>, PersistError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> String,
    {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let mut order: Vec<String> = Vec::new();
        let mut latest: std::collections::HashMap<String, T> = std::collections::HashMap::new();
        let mut skipped = 0usize;

        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(trimmed) {
                Ok(record) => {
                    let id = id_of(&record);
                    if !latest.contains_key(&id) {
                        order.push(id.clone());
                    }
                    latest.insert(id, record);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!(
                "JsonlLog: skipped {} corrupt line(s) in {}",
                skipped,
                self.path.display()
            );
        }
        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }

    /// Rewrite the log from scratch (compaction after deletes/purges).
    pub fn rewrite<T: Serialize>(&self, records: &[T]) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            for record in records {
                let line = serde_json::to_string(record)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writeln!(file, "{}", line)?;
            }
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
