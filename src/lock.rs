//! Advisory per-job lock built on exclusive file creation.
//!
//! The `.lock` marker is created with `O_CREAT | O_EXCL` and holds a random
//! token; `.lock.meta` records the owner (pid, host, time) under the same
//! token. Metadata is only trusted when its token matches the marker.
//!
//! Staleness is a heuristic: a lock is presumed abandoned when its owner is a
//! dead pid on this host, when its last heartbeat is older than
//! `stale_after`, or when the marker outlives `meta_grace` without matching
//! metadata. Long-running holders should call [`LockHandle::refresh`].
use crate::config::LockConfig;
use crate::durable::atomic_write_json;
use crate::error::{RejectCode, RejectContext, Result, StoreError};
use crate::paths::JobPaths;
use crate::util::{format_timestamp, hostname, now_utc, pid_is_alive};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Owner metadata written next to the marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockMeta {
    pub owner_pid: u32,
    pub owner_host: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    pub token: String,
}

impl LockMeta {
    /// Time of the most recent liveness evidence.
    pub fn last_seen(&self) -> DateTime<Utc> {
        match self.refreshed_at {
            Some(refreshed) if refreshed > self.acquired_at => refreshed,
            _ => self.acquired_at,
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Result of inspecting a contended lock.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Holder {
    /// The marker disappeared between attempts.
    Vacant,
    /// Someone plausibly holds it.
    Live { describe: String },
    /// Presumed abandoned; `token` is the marker content observed.
    Stale { token: String, reason: String },
}

/// Proof that the calling process holds a job's lock.
///
/// Dropping the handle releases the lock if [`LockHandle::release`] was not
/// called.
#[derive(Debug)]
pub struct LockHandle {
    job_dir: PathBuf,
    marker: PathBuf,
    meta_path: PathBuf,
    token: String,
    meta: LockMeta,
    released: bool,
}

impl LockHandle {
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    /// Whether the on-disk marker still carries this handle's token.
    pub fn is_held(&self) -> bool {
        !self.released && read_token(&self.marker).as_deref() == Some(self.token.as_str())
    }

    /// Fail with `LockNotHeld` unless this handle guards `job_dir`.
    pub fn ensure_guards(&self, job_dir: &Path) -> Result<()> {
        if self.job_dir == job_dir && self.is_held() {
            return Ok(());
        }
        Err(StoreError::reject(
            RejectCode::LockNotHeld,
            RejectContext::new(format!(
                "mutation requires the lock for this job (handle guards {})",
                self.job_dir.display()
            ))
            .path(job_dir),
        ))
    }

    /// Heartbeat: record fresh liveness evidence in the metadata.
    pub fn refresh(&mut self) -> Result<()> {
        if !self.is_held() {
            return Err(StoreError::reject(
                RejectCode::LockNotHeld,
                RejectContext::new("lock was released or taken over").path(&self.job_dir),
            ));
        }
        self.meta.refreshed_at = Some(now_utc());
        atomic_write_json(&self.meta_path, &self.meta, "lock metadata")?;
        tracing::debug!(job_dir = %self.job_dir.display(), "lock heartbeat");
        Ok(())
    }

    /// Release the lock. Cleanup failures are logged; returns whether it was clean.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;
        let mut clean = true;

        // Metadata first: a fresh owner may already have rewritten it.
        if read_meta(&self.meta_path).is_some_and(|meta| meta.token == self.token) {
            if let Err(err) = fs::remove_file(&self.meta_path) {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(
                        path = %self.meta_path.display(),
                        error = %err,
                        "remove lock metadata"
                    );
                    clean = false;
                }
            }
        }
        match read_token(&self.marker) {
            Some(token) if token == self.token => {
                if let Err(err) = fs::remove_file(&self.marker) {
                    if err.kind() != ErrorKind::NotFound {
                        tracing::warn!(
                            path = %self.marker.display(),
                            error = %err,
                            "remove lock marker"
                        );
                        clean = false;
                    }
                }
            }
            Some(_) => {
                tracing::warn!(
                    job_dir = %self.job_dir.display(),
                    "lock was taken over by another owner before release"
                );
                clean = false;
            }
            None => {}
        }
        tracing::debug!(job_dir = %self.job_dir.display(), clean, "lock released");
        clean
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            self.release_inner();
        }
    }
}

/// Acquire the job lock, retrying until `config.timeout`.
pub fn acquire(job_dir: &Path, config: &LockConfig) -> Result<LockHandle> {
    acquire_with_cancel(job_dir, config, None)
}

/// Acquire the job lock; `cancel` is polled between attempts.
pub fn acquire_with_cancel(
    job_dir: &Path,
    config: &LockConfig,
    cancel: Option<&AtomicBool>,
) -> Result<LockHandle> {
    fs::create_dir_all(job_dir).map_err(|err| StoreError::io("create", job_dir, err))?;
    let paths = JobPaths::new(job_dir.to_path_buf());
    let marker = paths.lock_path();
    let meta_path = paths.lock_meta_path();
    let started = Instant::now();
    let deadline = started + config.timeout();
    let mut last_holder = String::from("unknown owner");

    loop {
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(StoreError::reject(
                RejectCode::LockCancelled,
                RejectContext::new("lock acquisition cancelled").path(job_dir),
            ));
        }

        match try_create(&marker) {
            Ok(Some(token)) => {
                let meta = LockMeta {
                    owner_pid: std::process::id(),
                    owner_host: hostname(),
                    acquired_at: now_utc(),
                    refreshed_at: None,
                    token: token.clone(),
                };
                if let Err(err) = atomic_write_json(&meta_path, &meta, "lock metadata") {
                    tracing::warn!(
                        path = %meta_path.display(),
                        error = %err,
                        "write lock metadata"
                    );
                }
                tracing::info!(
                    job_dir = %job_dir.display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "lock acquired"
                );
                return Ok(LockHandle {
                    job_dir: job_dir.to_path_buf(),
                    marker,
                    meta_path,
                    token,
                    meta,
                    released: false,
                });
            }
            Ok(None) => {}
            Err(err) => return Err(StoreError::io("create lock marker", &marker, err)),
        }

        let retry_now = match inspect_holder(&marker, &meta_path, config) {
            Holder::Vacant => true,
            Holder::Stale { token, reason } => take_over(&marker, &token, &reason),
            Holder::Live { describe } => {
                last_holder = describe;
                false
            }
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(StoreError::reject(
                RejectCode::LockTimeout,
                RejectContext::new(format!(
                    "timed out after {}ms waiting for lock held by {last_holder}",
                    config.timeout_ms
                ))
                .path(job_dir),
            ));
        }
        if !retry_now {
            std::thread::sleep(config.retry_interval().min(deadline - now));
        }
    }
}

/// Run `body` while holding the job lock, releasing afterwards.
pub fn with_lock<T>(
    job_dir: &Path,
    config: &LockConfig,
    body: impl FnOnce(&mut LockHandle) -> Result<T>,
) -> Result<T> {
    let mut handle = acquire(job_dir, config)?;
    let outcome = body(&mut handle);
    handle.release();
    outcome
}

/// Read the owner metadata for diagnostics, if present and parseable.
pub fn read_meta(meta_path: &Path) -> Option<LockMeta> {
    let bytes = fs::read(meta_path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn read_token(marker: &Path) -> Option<String> {
    fs::read_to_string(marker)
        .ok()
        .map(|text| text.trim().to_string())
}

fn try_create(marker: &Path) -> std::io::Result<Option<String>> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker)
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => return Err(err),
    };
    let token = format!("{:016x}", rand::random::<u64>());
    if let Err(err) = file.write_all(token.as_bytes()).and_then(|()| file.sync_all()) {
        tracing::warn!(path = %marker.display(), error = %err, "write lock token");
    }
    Ok(Some(token))
}

fn inspect_holder(marker: &Path, meta_path: &Path, config: &LockConfig) -> Holder {
    let token = match fs::read_to_string(marker) {
        Ok(text) => text.trim().to_string(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Holder::Vacant,
        Err(err) => {
            return Holder::Live {
                describe: format!("an owner with an unreadable marker ({err})"),
            }
        }
    };
    let meta = read_meta(meta_path).filter(|meta| !token.is_empty() && meta.token == token);
    match meta {
        Some(meta) => {
            let describe = format!(
                "pid {} on {} since {}",
                meta.owner_pid,
                meta.owner_host,
                format_timestamp(&meta.acquired_at)
            );
            if meta.owner_host == hostname() && !pid_is_alive(meta.owner_pid) {
                return Holder::Stale {
                    token,
                    reason: format!("owner {describe} is no longer running"),
                };
            }
            let age = meta.age(now_utc());
            if age > config.stale_after() {
                return Holder::Stale {
                    token,
                    reason: format!("owner {describe} silent for {}s", age.as_secs()),
                };
            }
            Holder::Live { describe }
        }
        None => {
            let modified = match fs::metadata(marker).and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) if err.kind() == ErrorKind::NotFound => return Holder::Vacant,
                Err(err) => {
                    return Holder::Live {
                        describe: format!("an owner with an unreadable marker ({err})"),
                    }
                }
            };
            // A marker dated in the future (clock skew) counts as just created.
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO);
            if age < config.meta_grace() {
                return Holder::Live {
                    describe: "an owner still writing metadata".to_string(),
                };
            }
            Holder::Stale {
                token,
                reason: format!("metadata missing for {}s", age.as_secs()),
            }
        }
    }
}

/// Move a stale marker aside. Returns true when the caller may retry creation.
fn take_over(marker: &Path, observed_token: &str, reason: &str) -> bool {
    let aside = marker.with_file_name(format!(
        ".lock.stale.{}.{:08x}",
        std::process::id(),
        rand::random::<u32>()
    ));
    if let Err(err) = fs::rename(marker, &aside) {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %marker.display(), error = %err, "move stale lock aside");
            return false;
        }
        return true;
    }
    let moved_token = read_token(&aside).unwrap_or_default();
    if moved_token != observed_token {
        // Another contender re-acquired between inspection and rename.
        match fs::hard_link(&aside, marker) {
            Ok(()) => {
                let _ = fs::remove_file(&aside);
            }
            Err(err) => {
                tracing::warn!(path = %marker.display(), error = %err, "restore fresh lock marker");
            }
        }
        return false;
    }
    if let Err(err) = fs::remove_file(&aside) {
        tracing::warn!(path = %aside.display(), error = %err, "remove stale lock marker");
    }
    tracing::warn!(path = %marker.display(), reason, "took over stale lock");
    true
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
