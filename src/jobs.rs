//! Job-level operations exposed to collaborators.
//!
//! `JobStore` ties the store root and its config to the lock coordinator,
//! record store, photo manager, and run log. Every mutation takes the
//! `LockHandle` for the job it touches; callers obtain one with
//! [`JobStore::with_lock`] and may batch several mutations inside it.
use crate::config::{load_config_or_default, SlotConfig, StoreConfig};
use crate::error::{RejectCode, RejectContext, Result, StoreError};
use crate::hash::{packet_hash, HashMode};
use crate::identity::generate_job_id;
use crate::lock::{self, read_meta, LockHandle, LockMeta};
use crate::paths::{JobPaths, StorePaths};
use crate::photos::{self, IngestOutcome};
use crate::record::{self, JobRecord, MeasurementRow, SlotOverride};
use crate::runlog::{self, RunLog, WarningInput, WarningLevel};
use crate::util::now_utc;
use crate::value::FieldValue;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Warning code recorded when several candidates competed for one slot.
pub const AMBIGUOUS_SLOT_MATCH: &str = "ambiguous_slot_match";
/// Warning code recorded when an extraction proposal disagrees with the record.
pub const EXTRACTION_DISAGREEMENT: &str = "extraction_disagreement";

/// A field value suggested by an extraction service. Untrusted input.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldProposal {
    pub field: String,
    pub value: serde_json::Value,
}

/// Source of structured field proposals (OCR, document parsing, ...).
pub trait Extractor {
    fn extract(&self, text: &str) -> Result<Vec<FieldProposal>>;
}

/// Everything a report renderer needs from one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderInput {
    pub job_id: String,
    pub fields: BTreeMap<String, String>,
    pub measurements: Vec<BTreeMap<String, String>>,
    /// Slot key to absolute asset path.
    pub photo_slots: BTreeMap<String, PathBuf>,
}

/// Produces an output document from a template and a job's data.
pub trait Renderer {
    fn render(&self, template: &Path, input: &RenderInput) -> Result<PathBuf>;
}

/// Snapshot of one job for operators.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub job_dir: PathBuf,
    pub record: JobRecord,
    pub identity_hash: String,
    pub full_hash: String,
    pub missing_slots: Vec<String>,
    pub runs: Vec<String>,
    pub lock_holder: Option<LockMeta>,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    paths: StorePaths,
    config: StoreConfig,
}

impl JobStore {
    /// Open a store root, reading `config.json` when present.
    pub fn open(root: &Path) -> Result<Self> {
        let config = load_config_or_default(root)?;
        Ok(Self::with_config(root, config))
    }

    pub fn with_config(root: &Path, config: StoreConfig) -> Self {
        Self {
            paths: StorePaths::new(root.to_path_buf()),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.paths.job_dir(job_id)
    }

    /// Directory of an existing job, or `Io(NotFound)`.
    pub fn existing_job_dir(&self, job_id: &str) -> Result<PathBuf> {
        let job_dir = self.job_dir(job_id);
        let record_path = JobPaths::new(job_dir.clone()).record_path();
        if !record_path.is_file() {
            return Err(StoreError::io(
                "open job",
                &record_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "job does not exist"),
            ));
        }
        Ok(job_dir)
    }

    /// Create or reopen the job for a work order line.
    pub fn ensure_job(&self, wo_no: &str, line: &str) -> Result<(PathBuf, String)> {
        let job_id = generate_job_id(wo_no, line);
        let job_dir = self.job_dir(&job_id);
        self.with_lock(&job_dir, |_| record::ensure(&job_dir, wo_no, line))?;
        Ok((job_dir, job_id))
    }

    /// Run `body` while holding the lock for `job_dir`.
    pub fn with_lock<T>(
        &self,
        job_dir: &Path,
        body: impl FnOnce(&mut LockHandle) -> Result<T>,
    ) -> Result<T> {
        lock::with_lock(job_dir, &self.config.lock, body)
    }

    /// Merge fields (and optionally replace measurements), then persist.
    pub fn record_fields(
        &self,
        job_dir: &Path,
        lock: &LockHandle,
        fields: BTreeMap<String, FieldValue>,
        measurements: Option<Vec<MeasurementRow>>,
    ) -> Result<JobRecord> {
        lock.ensure_guards(job_dir)?;
        let mut record = record::load(job_dir)?;
        record.apply_fields(fields, measurements)?;
        self.persist(job_dir, &mut record)?;
        Ok(record)
    }

    /// Ingest candidates into a slot and record the new mapping.
    ///
    /// An ambiguous pick is logged to `run`, which is created on demand.
    pub fn ingest_photo(
        &self,
        job_dir: &Path,
        lock: &LockHandle,
        slot_key: &str,
        candidates: &[PathBuf],
        run: &mut Option<RunLog>,
    ) -> Result<IngestOutcome> {
        lock.ensure_guards(job_dir)?;
        let mut record = record::load(job_dir)?;
        let outcome = photos::ingest(job_dir, &self.config, slot_key, candidates)?;

        record
            .photo_slots
            .insert(slot_key.to_string(), outcome.mapping.clone());
        record.slot_overrides.remove(slot_key);
        self.persist(job_dir, &mut record)
            .map_err(|err| ingest_not_recorded(&record.job_id, slot_key, &outcome, err))?;

        if outcome.selection.is_ambiguous() {
            let passed_over: Vec<String> = outcome
                .selection
                .passed_over
                .iter()
                .map(|path| path.display().to_string())
                .collect();
            let warning = WarningInput {
                level: WarningLevel::Warning,
                code: AMBIGUOUS_SLOT_MATCH.to_string(),
                action_id: "ingest_photo".to_string(),
                field_or_slot: slot_key.to_string(),
                original_value: passed_over.join(", "),
                resolved_value: outcome.mapping.source_filename.clone(),
                message: format!(
                    "{} candidates for slot; chose by prefer_order then newest",
                    passed_over.len() + 1
                ),
            };
            let run = open_run(job_dir, &record, run)?;
            run.emit_warning(warning)?;
            run.save()?;
            tracing::warn!(job_id = %record.job_id, slot = slot_key, "ambiguous slot match");
        }
        Ok(outcome)
    }

    /// Proceed without evidence for a slot that permits it.
    pub fn record_slot_override(
        &self,
        job_dir: &Path,
        lock: &LockHandle,
        slot_key: &str,
        reason: &str,
        user: &str,
        run: &mut Option<RunLog>,
    ) -> Result<JobRecord> {
        lock.ensure_guards(job_dir)?;
        let mut record = record::load(job_dir)?;
        let slot = self.declared_slot(slot_key, &record.job_id)?;
        if !slot.allow_override {
            return Err(StoreError::reject(
                RejectCode::InvalidSlot,
                RejectContext::new("slot does not allow override")
                    .job(&record.job_id)
                    .subject(slot_key),
            ));
        }
        if reason.trim().is_empty() || user.trim().is_empty() {
            return Err(StoreError::reject(
                RejectCode::InvalidValue,
                RejectContext::new("override requires a reason and a user")
                    .job(&record.job_id)
                    .subject(slot_key),
            ));
        }

        let log = open_run(job_dir, &record, run)?;
        log.emit_override(slot_key, reason, user)?;
        log.save()?;

        record.slot_overrides.insert(
            slot_key.to_string(),
            SlotOverride {
                reason: reason.to_string(),
                user: user.to_string(),
                recorded_at: now_utc(),
            },
        );
        self.persist(job_dir, &mut record)?;
        tracing::info!(job_id = %record.job_id, slot = slot_key, user, "recorded slot override");
        Ok(record)
    }

    /// Required slots with neither an asset nor an override.
    pub fn missing_required_slots(&self, record: &JobRecord) -> Vec<String> {
        self.config
            .slots
            .iter()
            .filter(|slot| slot.required)
            .filter(|slot| {
                !record.photo_slots.contains_key(&slot.key)
                    && !record.slot_overrides.contains_key(&slot.key)
            })
            .map(|slot| slot.key.clone())
            .collect()
    }

    /// Fail with `RequiredSlotMissing` unless every required slot is covered.
    pub fn check_required_slots(&self, record: &JobRecord) -> Result<()> {
        let missing = self.missing_required_slots(record);
        let Some(first) = missing.first() else {
            return Ok(());
        };
        Err(StoreError::reject(
            RejectCode::RequiredSlotMissing,
            RejectContext::new(format!(
                "required slots without evidence or override: {}",
                missing.join(", ")
            ))
            .job(&record.job_id)
            .subject(first),
        ))
    }

    pub fn compute_identity_hash(&self, record: &JobRecord) -> Result<String> {
        packet_hash(
            &record.packet_value()?,
            HashMode::Identity,
            &self.config.free_text_set(),
        )
    }

    pub fn compute_full_hash(&self, record: &JobRecord) -> Result<String> {
        record.full_hash()
    }

    pub fn log_warning(
        &self,
        job_dir: &Path,
        lock: &LockHandle,
        run: &mut RunLog,
        warning: WarningInput,
    ) -> Result<()> {
        lock.ensure_guards(job_dir)?;
        run.emit_warning(warning)?;
        run.save()?;
        Ok(())
    }

    pub fn log_override(
        &self,
        job_dir: &Path,
        lock: &LockHandle,
        run: &mut RunLog,
        field_or_slot: &str,
        reason: &str,
        user: &str,
    ) -> Result<()> {
        lock.ensure_guards(job_dir)?;
        run.emit_override(field_or_slot, reason, user)?;
        run.save()?;
        Ok(())
    }

    /// Feed extraction output through the same validation as manual entry.
    ///
    /// Proposals only fill fields the record does not have yet; a proposal
    /// that disagrees with an existing value is logged and dropped.
    pub fn apply_extraction(
        &self,
        job_dir: &Path,
        lock: &LockHandle,
        extractor: &dyn Extractor,
        text: &str,
        run: &mut Option<RunLog>,
    ) -> Result<JobRecord> {
        lock.ensure_guards(job_dir)?;
        let current = record::load(job_dir)?;
        let mut accepted = BTreeMap::new();
        let mut disagreements = Vec::new();
        for proposal in extractor.extract(text)? {
            let value = FieldValue::from_json(&proposal.value).map_err(|err| match err {
                StoreError::PolicyReject { code, context } => StoreError::reject(
                    code,
                    context.job(&current.job_id).subject(&proposal.field),
                ),
                other => other,
            })?;
            match current.fields.get(&proposal.field) {
                Some(existing) if *existing != value => {
                    disagreements.push((proposal.field, existing.clone(), value));
                }
                Some(_) => {}
                None => {
                    accepted.insert(proposal.field, value);
                }
            }
        }

        if !disagreements.is_empty() {
            let log = open_run(job_dir, &current, run)?;
            for (field, existing, proposed) in disagreements {
                log.emit_warning(WarningInput {
                    level: WarningLevel::Warning,
                    code: EXTRACTION_DISAGREEMENT.to_string(),
                    action_id: "apply_extraction".to_string(),
                    field_or_slot: field,
                    original_value: proposed.display_text(),
                    resolved_value: existing.display_text(),
                    message: "extraction disagrees with recorded value; kept recorded value"
                        .to_string(),
                })?;
            }
            log.save()?;
        }
        self.record_fields(job_dir, lock, accepted, None)
    }

    /// Render a job once every required slot is covered.
    pub fn render_job(
        &self,
        job_dir: &Path,
        renderer: &dyn Renderer,
        template: &Path,
    ) -> Result<PathBuf> {
        let record = record::load(job_dir)?;
        self.check_required_slots(&record)?;
        renderer.render(template, &render_input(job_dir, &record))
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus> {
        let job_dir = self.existing_job_dir(job_id)?;
        let record = record::load(&job_dir)?;
        Ok(JobStatus {
            job_id: record.job_id.clone(),
            identity_hash: self.compute_identity_hash(&record)?,
            full_hash: self.compute_full_hash(&record)?,
            missing_slots: self.missing_required_slots(&record),
            runs: runlog::list_runs(&job_dir)?,
            lock_holder: read_meta(&JobPaths::new(job_dir.clone()).lock_meta_path()),
            job_dir,
            record,
        })
    }

    fn declared_slot(&self, slot_key: &str, job_id: &str) -> Result<&SlotConfig> {
        self.config.slot(slot_key).ok_or_else(|| {
            StoreError::reject(
                RejectCode::InvalidSlot,
                RejectContext::new("slot is not declared in config")
                    .job(job_id)
                    .subject(slot_key),
            )
        })
    }

    fn persist(&self, job_dir: &Path, record: &mut JobRecord) -> Result<()> {
        record.refresh_hashes(&self.config.free_text_set())?;
        record.touch();
        let durability = record::write(job_dir, record)?;
        if !durability.is_durable() {
            tracing::warn!(
                job_id = %record.job_id,
                ?durability,
                "job record written without full durability"
            );
        }
        Ok(())
    }
}

/// Assets already moved but `job.json` still maps the previous file.
fn ingest_not_recorded(
    job_id: &str,
    slot_key: &str,
    outcome: &IngestOutcome,
    err: StoreError,
) -> StoreError {
    let archived: Vec<String> = outcome
        .archived
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    tracing::error!(
        job_id,
        slot = slot_key,
        stored_path = %outcome.mapping.stored_path,
        archived = ?archived,
        error = %err,
        "asset installed but job record not updated"
    );
    StoreError::reject(
        RejectCode::AssetMove,
        RejectContext::new(format!(
            "installed {} but the record update failed ({err}); previous assets archived: [{}]",
            outcome.mapping.stored_path,
            archived.join(", ")
        ))
        .job(job_id)
        .subject(slot_key)
        .path(Path::new(&outcome.mapping.stored_path)),
    )
}

/// Flatten a record into the shape renderers consume.
pub fn render_input(job_dir: &Path, record: &JobRecord) -> RenderInput {
    let fields = record
        .fields
        .iter()
        .map(|(name, value)| (name.clone(), value.display_text()))
        .collect();
    let measurements = record
        .measurements
        .iter()
        .map(|row| {
            row.iter()
                .map(|(column, value)| (column.clone(), value.display_text()))
                .collect()
        })
        .collect();
    let photo_slots = record
        .photo_slots
        .iter()
        .map(|(slot, mapping)| (slot.clone(), job_dir.join(&mapping.stored_path)))
        .collect();
    RenderInput {
        job_id: record.job_id.clone(),
        fields,
        measurements,
        photo_slots,
    }
}

fn open_run<'a>(
    job_dir: &Path,
    record: &JobRecord,
    run: &'a mut Option<RunLog>,
) -> Result<&'a mut RunLog> {
    if let Some(existing) = run.as_ref() {
        if existing.record().job_id != record.job_id {
            return Err(StoreError::reject(
                RejectCode::IdentityMismatch,
                RejectContext::new(format!(
                    "run {} belongs to job {}",
                    existing.run_id(),
                    existing.record().job_id
                ))
                .job(&record.job_id),
            ));
        }
    }
    let log = match run.take() {
        Some(log) => log,
        None => runlog::create_run(job_dir)?,
    };
    Ok(run.insert(log))
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;
