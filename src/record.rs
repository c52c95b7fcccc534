//! Job record persistence (`job.json`).
//!
//! The record is the single source of truth for one job. This module only
//! reads, validates, and atomically replaces it; callers hold the job lock
//! around every mutating sequence so several writes can share one lock.
use crate::durable::{atomic_write_json, sweep_orphaned_temps, Durability};
use crate::error::{RejectCode, RejectContext, Result, StoreError};
use crate::hash::{packet_hash, HashMode};
use crate::identity::generate_job_id;
use crate::paths::JobPaths;
use crate::util::now_utc;
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

/// Current schema version for `job.json`.
pub const RECORD_SCHEMA_VERSION: u32 = 1;
/// Top-level packet keys that field names may not shadow.
pub const RESERVED_PACKET_KEYS: [&str; 3] = ["wo_no", "line", "measurements"];
/// Age after which leftover temp files in a job directory are swept.
const ORPHAN_TEMP_MAX_AGE: Duration = Duration::from_secs(3600);

/// One measurement row: column name to value.
pub type MeasurementRow = BTreeMap<String, FieldValue>;

/// Active asset assigned to a semantic slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoSlotMapping {
    pub slot_key: String,
    pub source_filename: String,
    /// Path relative to the job directory.
    pub stored_path: String,
    pub sha256: String,
    pub mapped_at: DateTime<Utc>,
}

/// Operator decision to proceed without evidence for a slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotOverride {
    pub reason: String,
    pub user: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub schema_version: u32,
    pub job_id: String,
    pub wo_no: String,
    pub line: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub measurements: Vec<MeasurementRow>,
    #[serde(default)]
    pub photo_slots: BTreeMap<String, PhotoSlotMapping>,
    #[serde(default)]
    pub slot_overrides: BTreeMap<String, SlotOverride>,
    #[serde(default)]
    pub packet_hash: Option<String>,
    #[serde(default)]
    pub packet_full_hash: Option<String>,
}

impl JobRecord {
    /// Fresh record for a work order line; the job id is derived, never chosen.
    pub fn new(wo_no: &str, line: &str) -> Self {
        let now = now_utc();
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            job_id: generate_job_id(wo_no, line),
            wo_no: wo_no.to_string(),
            line: line.to_string(),
            created_at: now,
            updated_at: now,
            fields: BTreeMap::new(),
            measurements: Vec::new(),
            photo_slots: BTreeMap::new(),
            slot_overrides: BTreeMap::new(),
            packet_hash: None,
            packet_full_hash: None,
        }
    }

    /// The hashed packet: fields at top level plus identity and measurements.
    pub fn packet_value(&self) -> Result<Value> {
        let mut packet = serde_json::Map::new();
        for (name, value) in &self.fields {
            let json =
                serde_json::to_value(value).map_err(|err| StoreError::serialization("field", err))?;
            packet.insert(name.clone(), json);
        }
        packet.insert("wo_no".to_string(), Value::String(self.wo_no.clone()));
        packet.insert("line".to_string(), Value::String(self.line.clone()));
        let rows = serde_json::to_value(&self.measurements)
            .map_err(|err| StoreError::serialization("measurements", err))?;
        packet.insert("measurements".to_string(), rows);
        Ok(Value::Object(packet))
    }

    pub fn identity_hash(&self, free_text: &BTreeSet<String>) -> Result<String> {
        packet_hash(&self.packet_value()?, HashMode::Identity, free_text)
    }

    pub fn full_hash(&self) -> Result<String> {
        packet_hash(&self.packet_value()?, HashMode::Full, &BTreeSet::new())
    }

    /// Recompute the cached hashes after a mutation.
    pub fn refresh_hashes(&mut self, free_text: &BTreeSet<String>) -> Result<()> {
        self.packet_hash = Some(self.identity_hash(free_text)?);
        self.packet_full_hash = Some(self.full_hash()?);
        Ok(())
    }

    /// Merge field values and replace measurement rows.
    ///
    /// Field names colliding with reserved packet keys are rejected before any
    /// change is applied. `measurements: None` keeps the current rows.
    pub fn apply_fields(
        &mut self,
        fields: BTreeMap<String, FieldValue>,
        measurements: Option<Vec<MeasurementRow>>,
    ) -> Result<()> {
        for name in fields.keys() {
            if name.is_empty() || RESERVED_PACKET_KEYS.contains(&name.as_str()) {
                return Err(StoreError::reject(
                    RejectCode::ReservedField,
                    RejectContext::new("field name is empty or reserved for the packet")
                        .job(&self.job_id)
                        .subject(name),
                ));
            }
        }
        self.fields.extend(fields);
        if let Some(rows) = measurements {
            self.measurements = rows;
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = now_utc();
    }
}

/// Return the existing record or create a fresh one for `(wo_no, line)`.
pub fn ensure(job_dir: &Path, wo_no: &str, line: &str) -> Result<JobRecord> {
    let paths = JobPaths::new(job_dir.to_path_buf());
    fs::create_dir_all(job_dir).map_err(|err| StoreError::io("create", job_dir, err))?;
    let swept = sweep_orphaned_temps(job_dir, ORPHAN_TEMP_MAX_AGE);
    if swept > 0 {
        tracing::info!(job_dir = %job_dir.display(), swept, "removed orphaned temp files");
    }
    if paths.record_path().is_file() {
        let record = load(job_dir)?;
        verify_mismatch(&record, wo_no, line)?;
        return Ok(record);
    }
    let record = JobRecord::new(wo_no, line);
    write(job_dir, &record)?;
    tracing::info!(job_id = %record.job_id, "created job record");
    Ok(record)
}

/// Parse and validate `job.json`.
pub fn load(job_dir: &Path) -> Result<JobRecord> {
    let path = JobPaths::new(job_dir.to_path_buf()).record_path();
    let bytes = fs::read(&path).map_err(|err| StoreError::io("read job record", &path, err))?;
    let corrupt = |detail: String| {
        StoreError::reject(RejectCode::CorruptRecord, RejectContext::new(detail).path(&path))
    };

    let raw: Value = serde_json::from_slice(&bytes)
        .map_err(|err| corrupt(format!("record is not valid JSON: {err}")))?;
    let Some(object) = raw.as_object() else {
        return Err(corrupt("record is not a JSON object".to_string()));
    };
    let version = object
        .get("schema_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| corrupt("missing schema_version".to_string()))?;
    let declared_id = object
        .get("job_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| corrupt("missing job_id".to_string()))?
        .to_string();
    if version > u64::from(RECORD_SCHEMA_VERSION) {
        return Err(StoreError::reject(
            RejectCode::UnsupportedSchema,
            RejectContext::new(format!(
                "record schema_version {version} is newer than supported {RECORD_SCHEMA_VERSION}"
            ))
            .job(&declared_id)
            .path(&path),
        ));
    }

    let migrated = migrate(raw, version)?;
    let record: JobRecord = serde_json::from_value(migrated).map_err(|err| {
        StoreError::reject(
            RejectCode::CorruptRecord,
            RejectContext::new(format!("record does not match schema: {err}"))
                .job(&declared_id)
                .path(&path),
        )
    })?;

    let expected = generate_job_id(&record.wo_no, &record.line);
    if record.job_id != expected {
        return Err(StoreError::reject(
            RejectCode::IdentityMismatch,
            RejectContext::new(format!(
                "declared job_id does not match (wo_no, line); expected {expected}"
            ))
            .job(&record.job_id)
            .path(&path),
        ));
    }
    Ok(record)
}

/// Reject a record whose work order identity differs from the request.
pub fn verify_mismatch(record: &JobRecord, wo_no: &str, line: &str) -> Result<()> {
    let subject = if record.wo_no != wo_no {
        "wo_no"
    } else if record.line != line {
        "line"
    } else {
        return Ok(());
    };
    Err(StoreError::reject(
        RejectCode::IdentityMismatch,
        RejectContext::new(format!(
            "record belongs to ({}, {}), request was ({wo_no}, {line})",
            record.wo_no, record.line
        ))
        .job(&record.job_id)
        .subject(subject),
    ))
}

/// Atomically replace `job.json`. The caller must hold the job lock.
pub fn write(job_dir: &Path, record: &JobRecord) -> Result<Durability> {
    let path = JobPaths::new(job_dir.to_path_buf()).record_path();
    match load(job_dir) {
        Ok(existing) => {
            if existing.job_id != record.job_id {
                return Err(StoreError::reject(
                    RejectCode::IdentityMismatch,
                    RejectContext::new(format!(
                        "job_id is immutable; stored {} differs",
                        existing.job_id
                    ))
                    .job(&record.job_id)
                    .subject("job_id"),
                ));
            }
            verify_mismatch(&existing, &record.wo_no, &record.line)?;
        }
        Err(StoreError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let durability = atomic_write_json(&path, record, "job record")?;
    tracing::debug!(
        job_id = %record.job_id,
        durable = durability.is_durable(),
        "wrote job record"
    );
    Ok(durability)
}

/// Upgrade an older on-disk shape to the current schema.
fn migrate(raw: Value, version: u64) -> Result<Value> {
    match version {
        1 => Ok(raw),
        other => Err(StoreError::reject(
            RejectCode::UnsupportedSchema,
            RejectContext::new(format!("no migration from schema_version {other}")),
        )),
    }
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
