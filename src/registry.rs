//! Checksum-failure registry: a single JSON-array file
//! under `logs/checksum_failures/registry.json`. Records accrete; they are
//! never pruned automatically.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::time::Interval;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed registry at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumFailureRecord {
    pub symbol: String,
    pub interval: String,
    pub date: NaiveDate,
    pub expected: String,
    pub actual: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
}

pub fn registry_path(logs_root: &Path) -> PathBuf {
    logs_root.join("checksum_failures").join("registry.json")
}

fn read_all(path: &Path) -> Result<Vec<ChecksumFailureRecord>, RegistryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path).map_err(|e| RegistryError::Io { path: path.to_path_buf(), source: e })?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes).map_err(|e| RegistryError::Malformed { path: path.to_path_buf(), source: e })
}

fn write_all(path: &Path, records: &[ChecksumFailureRecord]) -> Result<(), RegistryError> {
    let dir = path.parent().expect("registry path always has a parent");
    std::fs::create_dir_all(dir).map_err(|e| RegistryError::Io { path: dir.to_path_buf(), source: e })?;
    let body = serde_json::to_vec_pretty(records).expect("records always serialize");

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| RegistryError::Io { path: dir.to_path_buf(), source: e })?;
    use std::io::Write;
    tmp.write_all(&body).map_err(|e| RegistryError::Io { path: dir.to_path_buf(), source: e })?;
    tmp.as_file().sync_all().map_err(|e| RegistryError::Io { path: dir.to_path_buf(), source: e })?;
    tmp.persist(path).map_err(|e| RegistryError::Io { path: path.to_path_buf(), source: e.error })?;
    Ok(())
}

/// Append a new failure record; does not mutate existing records.
pub fn append(logs_root: &Path, record: ChecksumFailureRecord) -> Result<(), RegistryError> {
    let path = registry_path(logs_root);
    let mut records = read_all(&path)?;
    records.push(record);
    write_all(&path, &records)
}

/// Mark the record for `(symbol, interval, date)` resolved, e.g. after a
/// successful `kline-fcp retry-checksums` re-fetch.
pub fn mark_resolved(logs_root: &Path, symbol: &str, interval: Interval, date: NaiveDate) -> Result<bool, RegistryError> {
    let path = registry_path(logs_root);
    let mut records = read_all(&path)?;
    let mut found = false;
    for r in records.iter_mut() {
        if r.symbol == symbol && r.interval == interval.as_str() && r.date == date && !r.resolved {
            r.resolved = true;
            found = true;
        }
    }
    if found {
        write_all(&path, &records)?;
    }
    Ok(found)
}

pub fn unresolved(logs_root: &Path) -> Result<Vec<ChecksumFailureRecord>, RegistryError> {
    Ok(read_all(&registry_path(logs_root))?.into_iter().filter(|r| !r.resolved).collect())
}
