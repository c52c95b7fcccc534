//! Atomic file replacement.
//!
//! Writes go to a uniquely named temp file in the target directory, are
//! flushed and fsynced, then renamed over the target. Readers observe either
//! the old or the new file. Fsync failures are reported through
//! [`Durability::BestEffort`] instead of failing the write.
use crate::error::{Result, StoreError};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Prefix/suffix shape of temp files so orphans can be recognized later.
const TEMP_SUFFIX: &str = ".tmp";

/// How strongly a completed write is known to be on stable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum Durability {
    /// File and directory entry were both fsynced.
    Durable,
    /// The rename happened but one or more barriers were unavailable.
    BestEffort { skipped: Vec<String> },
}

impl Durability {
    pub fn is_durable(&self) -> bool {
        matches!(self, Durability::Durable)
    }
}

/// Atomically replace `path` with `bytes`.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<Durability> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| StoreError::io("create", parent, err))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("artifact");

    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
        .map_err(|err| StoreError::io("create temp file in", parent, err))?;
    temp.write_all(bytes)
        .map_err(|err| StoreError::io("write temp file for", path, err))?;
    temp.flush()
        .map_err(|err| StoreError::io("flush temp file for", path, err))?;

    let mut skipped = Vec::new();
    if let Err(err) = temp.as_file().sync_all() {
        tracing::warn!(path = %path.display(), error = %err, "file fsync unavailable");
        skipped.push(format!("file_fsync: {err}"));
    }

    temp.persist(path)
        .map_err(|err| StoreError::io("rename temp file over", path, err.error))?;

    if let Err(err) = sync_dir(parent) {
        tracing::warn!(dir = %parent.display(), error = %err, "directory fsync unavailable");
        skipped.push(format!("dir_fsync: {err}"));
    }

    if skipped.is_empty() {
        Ok(Durability::Durable)
    } else {
        Ok(Durability::BestEffort { skipped })
    }
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(
    path: &Path,
    value: &T,
    what: &'static str,
) -> Result<Durability> {
    let mut bytes =
        serde_json::to_vec_pretty(value).map_err(|err| StoreError::serialization(what, err))?;
    bytes.push(b'\n');
    atomic_write(path, &bytes)
}

/// Fsync a directory so a completed rename survives power loss.
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// Remove leftover temp files from interrupted writes older than `max_age`.
///
/// Returns the number of files removed; failures are logged and skipped.
pub fn sweep_orphaned_temps(dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with('.') || !name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age >= max_age) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(
                        path = %entry.path().display(),
                        error = %err,
                        "remove orphaned temp file"
                    )
                }
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job.json");
        fs::write(&path, b"old").expect("seed");
        let durability = atomic_write(&path, b"new").expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"new");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
        if let Durability::BestEffort { skipped } = durability {
            assert!(!skipped.is_empty());
        }
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs").join("r1.json");
        atomic_write_json(&path, &serde_json::json!({"a": 1}), "test").expect("write");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.ends_with('\n'));
        assert!(text.contains("\"a\": 1"));
    }

    #[test]
    fn sweep_removes_only_aged_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".job.json.abc.tmp"), b"partial").expect("orphan");
        fs::write(dir.path().join("job.json"), b"{}").expect("record");
        assert_eq!(sweep_orphaned_temps(dir.path(), Duration::from_secs(3600)), 0);
        assert_eq!(sweep_orphaned_temps(dir.path(), Duration::ZERO), 1);
        assert!(dir.path().join("job.json").exists());
        assert!(!dir.path().join(".job.json.abc.tmp").exists());
    }
}
