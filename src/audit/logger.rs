//! JSONL-backed audit log.
//!
//! One record per line, appended under an exclusive file lock so concurrent
//! writers never interleave partial lines. Reads tolerate a missing file
//! (fresh project) and skip lines that fail to parse rather than poisoning
//! the whole history.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::errors::EngineError;
use crate::store::fs;

use super::{AuditFilter, AuditRecord};

/// Handle on the append-only audit file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. The record is serialized to a single JSON line.
    pub fn append(&self, record: &AuditRecord) -> Result<(), EngineError> {
        let line = serde_json::to_string(record)
            .map_err(|err| EngineError::Other(anyhow::Error::new(err)))?;
        fs::append_line(&self.path, &line).map_err(|source| EngineError::WriteFailed {
            path: self.path.clone(),
            source,
        })
    }

    /// Read the full history, oldest first.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>, EngineError> {
        let contents =
            fs::read_to_string_or_empty(&self.path).map_err(|source| EngineError::ReadFailed {
                path: self.path.clone(),
                source,
            })?;

        let mut records = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(line = number + 1, %err, "skipping unparseable audit line");
                }
            }
        }
        Ok(records)
    }

    /// Read records matching `filter`, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, EngineError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }

    /// Number of records currently on disk.
    pub fn len(&self) -> Result<usize, EngineError> {
        Ok(self.read_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, EngineError> {
        Ok(self.len()? == 0)
    }
}
