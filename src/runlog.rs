//! Append-only run ledger (`runs/<run_id>.json`).
//!
//! A run records warnings and overrides raised while processing a job. Events
//! are only ever appended; `save` refuses to persist a ledger that no longer
//! extends what is already on disk. Event text is capped so raw provider
//! payloads cannot land here.
use crate::durable::{atomic_write_json, Durability};
use crate::error::{RejectCode, RejectContext, Result, StoreError};
use crate::identity::generate_run_id;
use crate::paths::JobPaths;
use crate::record;
use crate::util::{now_utc, truncate_string};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Current schema version for `runs/<run_id>.json`.
pub const RUN_SCHEMA_VERSION: u32 = 1;
/// Maximum stored size of any free-text event value.
pub const MAX_EVENT_TEXT_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Info,
    Warning,
    Error,
}

/// Caller-supplied warning; every field is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningInput {
    pub level: WarningLevel,
    pub code: String,
    pub action_id: String,
    pub field_or_slot: String,
    pub original_value: String,
    pub resolved_value: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Warning {
        level: WarningLevel,
        code: String,
        action_id: String,
        field_or_slot: String,
        original_value: String,
        resolved_value: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Override {
        field_or_slot: String,
        reason: String,
        user: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<RunEvent>,
}

/// In-memory handle on one run's ledger.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    record: RunRecord,
}

/// Allocate a new run under `job_dir` and persist its empty ledger.
pub fn create_run(job_dir: &Path) -> Result<RunLog> {
    let job = record::load(job_dir)?;
    let paths = JobPaths::new(job_dir.to_path_buf());
    fs::create_dir_all(paths.runs_dir())
        .map_err(|err| StoreError::io("create", &paths.runs_dir(), err))?;
    let mut run_id = generate_run_id();
    while paths.run_path(&run_id).exists() {
        run_id = generate_run_id();
    }
    let log = RunLog {
        path: paths.run_path(&run_id),
        record: RunRecord {
            schema_version: RUN_SCHEMA_VERSION,
            run_id,
            job_id: job.job_id,
            started_at: now_utc(),
            events: Vec::new(),
        },
    };
    log.save()?;
    tracing::info!(job_id = %log.record.job_id, run_id = %log.record.run_id, "created run");
    Ok(log)
}

/// Load an existing run ledger.
pub fn load_run(job_dir: &Path, run_id: &str) -> Result<RunLog> {
    let path = JobPaths::new(job_dir.to_path_buf()).run_path(run_id);
    let record = read_run(&path)?.ok_or_else(|| {
        StoreError::io(
            "read run",
            &path,
            std::io::Error::from(ErrorKind::NotFound),
        )
    })?;
    Ok(RunLog { path, record })
}

impl RunLog {
    pub fn run_id(&self) -> &str {
        &self.record.run_id
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.record.events
    }

    pub fn emit_warning(&mut self, warning: WarningInput) -> Result<()> {
        require_text("code", &warning.code)?;
        require_text("action_id", &warning.action_id)?;
        require_text("field_or_slot", &warning.field_or_slot)?;
        self.record.events.push(RunEvent::Warning {
            level: warning.level,
            code: warning.code,
            action_id: warning.action_id,
            field_or_slot: warning.field_or_slot,
            original_value: cap(&warning.original_value),
            resolved_value: cap(&warning.resolved_value),
            message: cap(&warning.message),
            timestamp: now_utc(),
        });
        Ok(())
    }

    pub fn emit_override(&mut self, field_or_slot: &str, reason: &str, user: &str) -> Result<()> {
        require_text("field_or_slot", field_or_slot)?;
        require_text("reason", reason)?;
        require_text("user", user)?;
        self.record.events.push(RunEvent::Override {
            field_or_slot: field_or_slot.to_string(),
            reason: cap(reason),
            user: cap(user),
            timestamp: now_utc(),
        });
        Ok(())
    }

    /// Persist the ledger atomically; the on-disk events must be a prefix.
    pub fn save(&self) -> Result<Durability> {
        if let Some(existing) = read_run(&self.path)? {
            let extends = existing.run_id == self.record.run_id
                && existing.events.len() <= self.record.events.len()
                && existing
                    .events
                    .iter()
                    .zip(&self.record.events)
                    .all(|(stored, current)| stored == current);
            if !extends {
                return Err(StoreError::reject(
                    RejectCode::AppendOnlyViolation,
                    RejectContext::new(format!(
                        "run {} on disk has {} events not preserved in memory",
                        existing.run_id,
                        existing.events.len()
                    ))
                    .job(&self.record.job_id)
                    .path(&self.path),
                ));
            }
        }
        atomic_write_json(&self.path, &self.record, "run record")
    }
}

/// Run ids recorded for a job, oldest first.
pub fn list_runs(job_dir: &Path) -> Result<Vec<String>> {
    let dir = JobPaths::new(job_dir.to_path_buf()).runs_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io("read", &dir, err)),
    };
    let mut ids: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            if name.starts_with('.') {
                return None;
            }
            name.strip_suffix(".json").map(str::to_string)
        })
        .collect();
    ids.sort();
    Ok(ids)
}

fn read_run(path: &Path) -> Result<Option<RunRecord>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io("read run", path, err)),
    };
    let record = serde_json::from_slice(&bytes).map_err(|err| {
        StoreError::reject(
            RejectCode::CorruptRecord,
            RejectContext::new(format!("run ledger is not valid: {err}")).path(path),
        )
    })?;
    Ok(Some(record))
}

fn require_text(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StoreError::reject(
            RejectCode::InvalidValue,
            RejectContext::new("run event field must not be empty").subject(name),
        ));
    }
    Ok(())
}

fn cap(text: &str) -> String {
    truncate_string(text, MAX_EVENT_TEXT_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        record::ensure(dir.path(), "WO-100", "L1").expect("job record");
        dir
    }

    fn warning(code: &str) -> WarningInput {
        WarningInput {
            level: WarningLevel::Warning,
            code: code.to_string(),
            action_id: "ingest_photo".to_string(),
            field_or_slot: "overview".to_string(),
            original_value: "dup.png".to_string(),
            resolved_value: "dup.jpg".to_string(),
            message: "two candidates; prefer_order picked jpg".to_string(),
        }
    }

    #[test]
    fn create_run_persists_empty_ledger_scoped_to_job() {
        let dir = job_dir();
        let log = create_run(dir.path()).expect("create run");
        let loaded = load_run(dir.path(), log.run_id()).expect("load run");
        assert!(loaded.events().is_empty());
        assert_eq!(loaded.record().job_id, record::load(dir.path()).expect("job").job_id);
    }

    #[test]
    fn runs_accumulate_per_job() {
        let dir = job_dir();
        let a = create_run(dir.path()).expect("a");
        let b = create_run(dir.path()).expect("b");
        assert_ne!(a.run_id(), b.run_id());
        let ids = list_runs(dir.path()).expect("list");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.run_id().to_string()));
    }

    #[test]
    fn events_round_trip_in_order() {
        let dir = job_dir();
        let mut log = create_run(dir.path()).expect("create");
        log.emit_warning(warning("ambiguous_slot_match")).expect("warning");
        log.emit_override("label_serial", "label destroyed", "inspector-7")
            .expect("override");
        log.save().expect("save");

        let loaded = load_run(dir.path(), log.run_id()).expect("load");
        assert_eq!(loaded.events(), log.events());
        assert!(matches!(loaded.events()[0], RunEvent::Warning { .. }));
        assert!(matches!(loaded.events()[1], RunEvent::Override { .. }));
    }

    #[test]
    fn save_refuses_to_drop_persisted_events() {
        let dir = job_dir();
        let mut log = create_run(dir.path()).expect("create");
        let stale = log.clone();
        log.emit_warning(warning("first")).expect("warning");
        log.save().expect("save");

        let err = stale.save().expect_err("stale copy would rewrite history");
        assert_eq!(err.reject_code(), Some(RejectCode::AppendOnlyViolation));
    }

    #[test]
    fn empty_required_fields_are_rejected() {
        let dir = job_dir();
        let mut log = create_run(dir.path()).expect("create");
        let err = log.emit_override("overview", " ", "inspector").expect_err("reason");
        assert_eq!(err.reject_code(), Some(RejectCode::InvalidValue));
        assert!(log.emit_warning(warning("")).is_err());
        assert!(log.events().is_empty());
    }

    #[test]
    fn oversized_text_is_capped() {
        let dir = job_dir();
        let mut log = create_run(dir.path()).expect("create");
        let mut input = warning("extraction_disagreement");
        input.original_value = "x".repeat(MAX_EVENT_TEXT_BYTES * 4);
        log.emit_warning(input).expect("warning");
        let RunEvent::Warning { original_value, .. } = &log.events()[0] else {
            panic!("expected warning event");
        };
        assert_eq!(original_value.len(), MAX_EVENT_TEXT_BYTES);
    }

    #[test]
    fn create_run_requires_existing_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(create_run(dir.path()).is_err());
    }
}
