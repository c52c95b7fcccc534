//! Persisted session-to-job bindings (`<root>/sessions.json`).
//!
//! Every mutation happens under the store-root lock and is written with the
//! same atomic-replace discipline as job records, so several processes share
//! one consistent view of which job a session is working on.
use crate::config::LockConfig;
use crate::durable::atomic_write_json;
use crate::error::{RejectCode, RejectContext, Result, StoreError};
use crate::lock::{with_lock, LockHandle};
use crate::paths::StorePaths;
use crate::util::now_utc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Current schema version for `sessions.json`.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionBinding {
    pub job_id: String,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMap {
    pub schema_version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionBinding>,
}

impl Default for SessionMap {
    fn default() -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl SessionMap {
    /// Read the table; a missing file is an empty table.
    pub fn load(store_root: &Path) -> Result<Self> {
        let path = StorePaths::new(store_root.to_path_buf()).sessions_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(StoreError::io("read sessions", &path, err)),
        };
        let map: SessionMap = serde_json::from_slice(&bytes).map_err(|err| {
            StoreError::reject(
                RejectCode::CorruptRecord,
                RejectContext::new(format!("session table is not valid: {err}")).path(&path),
            )
        })?;
        if map.schema_version != SESSION_SCHEMA_VERSION {
            return Err(StoreError::reject(
                RejectCode::UnsupportedSchema,
                RejectContext::new(format!(
                    "session schema_version {} (expected {SESSION_SCHEMA_VERSION})",
                    map.schema_version
                ))
                .path(&path),
            ));
        }
        Ok(map)
    }

    fn save(&self, store_root: &Path, handle: &LockHandle) -> Result<()> {
        handle.ensure_guards(store_root)?;
        let path = StorePaths::new(store_root.to_path_buf()).sessions_path();
        atomic_write_json(&path, self, "session table")?;
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionBinding> {
        self.sessions.get(session_id)
    }
}

/// Bind `session_id` to `job_id`, replacing any previous binding.
pub fn bind(
    store_root: &Path,
    lock: &LockConfig,
    session_id: &str,
    job_id: &str,
) -> Result<SessionBinding> {
    if session_id.trim().is_empty() || job_id.trim().is_empty() {
        return Err(StoreError::reject(
            RejectCode::InvalidValue,
            RejectContext::new("session id and job id must be non-empty").subject(session_id),
        ));
    }
    with_lock(store_root, lock, |handle| {
        let mut map = SessionMap::load(store_root)?;
        let binding = SessionBinding {
            job_id: job_id.to_string(),
            bound_at: now_utc(),
        };
        if let Some(previous) = map.sessions.insert(session_id.to_string(), binding.clone()) {
            if previous.job_id != job_id {
                tracing::info!(session_id, from = %previous.job_id, to = job_id, "rebound session");
            }
        }
        map.save(store_root, handle)?;
        Ok(binding)
    })
}

/// Job bound to `session_id`; `UnknownSession` when none.
pub fn resolve(store_root: &Path, session_id: &str) -> Result<String> {
    SessionMap::load(store_root)?
        .get(session_id)
        .map(|binding| binding.job_id.clone())
        .ok_or_else(|| unknown_session(session_id))
}

/// Remove a binding and return the job it pointed at.
pub fn unbind(store_root: &Path, lock: &LockConfig, session_id: &str) -> Result<String> {
    with_lock(store_root, lock, |handle| {
        let mut map = SessionMap::load(store_root)?;
        let removed = map
            .sessions
            .remove(session_id)
            .ok_or_else(|| unknown_session(session_id))?;
        map.save(store_root, handle)?;
        Ok(removed.job_id)
    })
}

fn unknown_session(session_id: &str) -> StoreError {
    StoreError::reject(
        RejectCode::UnknownSession,
        RejectContext::new("no job is bound to this session").subject(session_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> LockConfig {
        LockConfig {
            timeout_ms: 2000,
            retry_interval_ms: 10,
            ..LockConfig::default()
        }
    }

    #[test]
    fn bindings_survive_reload() {
        let root = tempfile::tempdir().expect("tempdir");
        bind(root.path(), &lock(), "s-1", "JOB_A_L1_00000000").expect("bind");
        assert_eq!(
            resolve(root.path(), "s-1").expect("resolve"),
            "JOB_A_L1_00000000"
        );
        let map = SessionMap::load(root.path()).expect("load");
        assert_eq!(map.sessions.len(), 1);
        assert!(!root.path().join(".lock").exists());
    }

    #[test]
    fn rebinding_replaces_previous_job() {
        let root = tempfile::tempdir().expect("tempdir");
        bind(root.path(), &lock(), "s-1", "JOB_A").expect("first");
        bind(root.path(), &lock(), "s-1", "JOB_B").expect("second");
        assert_eq!(resolve(root.path(), "s-1").expect("resolve"), "JOB_B");
    }

    #[test]
    fn unknown_sessions_are_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let err = resolve(root.path(), "ghost").expect_err("unknown");
        assert_eq!(err.reject_code(), Some(RejectCode::UnknownSession));
        let err = unbind(root.path(), &lock(), "ghost").expect_err("unknown");
        assert_eq!(err.reject_code(), Some(RejectCode::UnknownSession));
    }

    #[test]
    fn unbind_removes_binding() {
        let root = tempfile::tempdir().expect("tempdir");
        bind(root.path(), &lock(), "s-1", "JOB_A").expect("bind");
        assert_eq!(unbind(root.path(), &lock(), "s-1").expect("unbind"), "JOB_A");
        assert!(resolve(root.path(), "s-1").is_err());
    }

    #[test]
    fn corrupt_table_is_reported_not_reset() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::write(root.path().join("sessions.json"), "{oops").expect("write");
        let err = bind(root.path(), &lock(), "s-1", "JOB_A").expect_err("corrupt");
        assert_eq!(err.reject_code(), Some(RejectCode::CorruptRecord));
        assert_eq!(
            fs::read_to_string(root.path().join("sessions.json")).expect("read"),
            "{oops"
        );
    }
}
