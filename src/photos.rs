//! Photo asset relocation, slot selection, and archival.
//!
//! Files are never overwritten and never dropped: a destination collision
//! picks a numbered sibling, same-volume moves link-then-unlink, and
//! cross-volume moves copy, verify the digest, and only then remove the
//! source. Superseded slot assets go to `photos/_archive/`.
use crate::config::{RetryConfig, SlotConfig, StoreConfig};
use crate::error::{RejectCode, RejectContext, Result, StoreError};
use crate::paths::JobPaths;
use crate::record::PhotoSlotMapping;
use crate::util::{display_path, now_utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Upper bound on numbered siblings tried before giving up on a name.
const MAX_COLLISION_SUFFIX: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMethod {
    /// Same volume: hard link at the destination, then unlink the source.
    Link,
    /// Plain rename (filesystems without hard links).
    Rename,
    /// Cross volume: copy, fsync, verify digest, then delete the source.
    CopyVerify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveResult {
    /// Path actually used; differs from the request after a collision.
    pub final_path: PathBuf,
    pub method: MoveMethod,
    pub collided: bool,
}

/// Outcome of choosing among candidate files for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub chosen: PathBuf,
    /// Other acceptable candidates that lost on priority or recency.
    pub passed_over: Vec<PathBuf>,
    /// Candidates whose extension the slot does not accept.
    pub unaccepted: Vec<PathBuf>,
}

impl Selection {
    /// More than one acceptable candidate competed for the slot.
    pub fn is_ambiguous(&self) -> bool {
        !self.passed_over.is_empty()
    }
}

/// Result of ingesting one asset into a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub mapping: PhotoSlotMapping,
    pub selection: Selection,
    pub archived: Vec<PathBuf>,
}

/// Move `source` to `dest` without overwriting and without losing the file.
pub fn safe_move(source: &Path, dest: &Path, retry: &RetryConfig) -> Result<MoveResult> {
    if !source.is_file() {
        return Err(StoreError::io(
            "move source",
            source,
            io::Error::new(ErrorKind::NotFound, "source file does not exist"),
        ));
    }
    if let Some(parent) = dest.parent() {
        with_retry(retry, "create", parent, || fs::create_dir_all(parent))?;
    }

    let mut suffix = 0;
    while suffix <= MAX_COLLISION_SUFFIX {
        let candidate = collision_candidate(dest, suffix);
        if candidate.exists() {
            suffix += 1;
            continue;
        }
        match place(source, &candidate, retry)? {
            Some(method) => {
                tracing::info!(
                    from = %source.display(),
                    to = %candidate.display(),
                    ?method,
                    "moved asset"
                );
                return Ok(MoveResult {
                    final_path: candidate,
                    method,
                    collided: suffix > 0,
                });
            }
            // Lost a race for this name; try the next one.
            None => suffix += 1,
        }
    }
    Err(StoreError::io(
        "choose destination for",
        dest,
        io::Error::new(ErrorKind::AlreadyExists, "no free collision suffix"),
    ))
}

/// Pick the candidate for a slot by `prefer_order`, then newest mtime.
///
/// Returns `Ok(None)` for an optional slot with no acceptable candidate.
pub fn select_photo_for_slot(
    candidates: &[PathBuf],
    slot: &SlotConfig,
) -> Result<Option<Selection>> {
    let mut ranked = Vec::new();
    let mut unaccepted = Vec::new();
    for path in candidates {
        if !path.is_file() {
            unaccepted.push(path.clone());
            continue;
        }
        match slot.rank_of(extension_of(path).as_deref()) {
            Some(rank) => {
                let modified = fs::metadata(path)
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                ranked.push((rank, modified, path.clone()));
            }
            None => unaccepted.push(path.clone()),
        }
    }
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

    let mut ranked = ranked.into_iter().map(|(_, _, path)| path);
    let Some(chosen) = ranked.next() else {
        if slot.required {
            return Err(StoreError::reject(
                RejectCode::RequiredSlotMissing,
                RejectContext::new(format!(
                    "no candidate matches prefer_order {:?} ({} offered)",
                    slot.prefer_order,
                    candidates.len()
                ))
                .subject(&slot.key),
            ));
        }
        return Ok(None);
    };
    Ok(Some(Selection {
        chosen,
        passed_over: ranked.collect(),
        unaccepted,
    }))
}

/// Move every active asset of `slot_key` into `photos/_archive/`.
///
/// Archived names keep the slot key and add a timestamp. Returns the archived
/// paths.
pub fn archive_old_derived(
    job_dir: &Path,
    slot_key: &str,
    retry: &RetryConfig,
) -> Result<Vec<PathBuf>> {
    let paths = JobPaths::new(job_dir.to_path_buf());
    let mut archived = Vec::new();
    for active in active_assets(&paths, slot_key)? {
        let stamp = now_utc().format("%Y%m%dT%H%M%S%.3fZ");
        let name = match extension_of(&active) {
            Some(ext) => format!("{slot_key}__{stamp}.{ext}"),
            None => format!("{slot_key}__{stamp}"),
        };
        let moved = safe_move(&active, &paths.archive_dir().join(name), retry)?;
        tracing::info!(
            slot = slot_key,
            archived = %moved.final_path.display(),
            "archived superseded asset"
        );
        archived.push(moved.final_path);
    }
    Ok(archived)
}

/// Select, stage, archive the previous asset, and install the new one.
///
/// Moves files only; the caller records the returned mapping in the job
/// record while still holding the job lock.
pub fn ingest(
    job_dir: &Path,
    config: &StoreConfig,
    slot_key: &str,
    candidates: &[PathBuf],
) -> Result<IngestOutcome> {
    let slot = config.slot(slot_key).ok_or_else(|| {
        StoreError::reject(
            RejectCode::InvalidSlot,
            RejectContext::new("slot is not declared in config").subject(slot_key),
        )
    })?;
    let selection = select_photo_for_slot(candidates, slot)?.ok_or_else(|| {
        StoreError::reject(
            RejectCode::InvalidSlot,
            RejectContext::new("no candidate is accepted by the slot prefer_order")
                .subject(slot_key),
        )
    })?;
    let paths = JobPaths::new(job_dir.to_path_buf());
    let retry = &config.move_retry;
    let as_reject = |err: StoreError| asset_move_reject(slot_key, err);

    let source_filename = selection
        .chosen
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sha256 = file_sha256(&selection.chosen).map_err(as_reject)?;
    let ext = extension_of(&selection.chosen);

    // Stage inside photos/ first so the install step is a same-directory rename.
    let staging_name = format!(".incoming-{slot_key}-{:08x}", rand::random::<u32>());
    let staged = safe_move(&selection.chosen, &paths.photos_dir().join(staging_name), retry)
        .map_err(as_reject)?
        .final_path;

    let archived = archive_old_derived(job_dir, slot_key, retry).map_err(|err| {
        StoreError::reject(
            RejectCode::AssetMove,
            RejectContext::new(format!(
                "archiving previous asset failed ({err}); new asset kept at {}",
                staged.display()
            ))
            .subject(slot_key),
        )
    })?;

    let installed = safe_move(&staged, &paths.slot_asset_path(slot_key, ext.as_deref()), retry)
        .map_err(as_reject)?
        .final_path;
    let mapping = PhotoSlotMapping {
        slot_key: slot_key.to_string(),
        source_filename,
        stored_path: display_path(&installed, Some(job_dir)),
        sha256,
        mapped_at: now_utc(),
    };
    Ok(IngestOutcome {
        mapping,
        selection,
        archived,
    })
}

/// SHA-256 of a file's contents, streamed.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|err| StoreError::io("open", path, err))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| StoreError::io("hash", path, err))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn asset_move_reject(slot_key: &str, err: StoreError) -> StoreError {
    if err.is_policy_reject() {
        return err;
    }
    StoreError::reject(
        RejectCode::AssetMove,
        RejectContext::new(err.to_string()).subject(slot_key),
    )
}

fn active_assets(paths: &JobPaths, slot_key: &str) -> Result<Vec<PathBuf>> {
    let dir = paths.photos_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io("read", &dir, err)),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io("read", &dir, err))?;
        let path = entry.path();
        if path.is_file() && path.file_stem().and_then(|stem| stem.to_str()) == Some(slot_key) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn collision_candidate(dest: &Path, suffix: u32) -> PathBuf {
    if suffix == 0 {
        return dest.to_path_buf();
    }
    let stem = dest
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match dest.extension() {
        Some(ext) => format!("{stem}_{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{suffix}"),
    };
    dest.with_file_name(name)
}

/// Place `source` at `dest`; `Ok(None)` means `dest` appeared concurrently.
fn place(source: &Path, dest: &Path, retry: &RetryConfig) -> Result<Option<MoveMethod>> {
    match with_retry(retry, "link", dest, || fs::hard_link(source, dest)) {
        Ok(()) => {
            remove_source(source);
            return Ok(Some(MoveMethod::Link));
        }
        Err(StoreError::Io { source: err, .. }) if err.kind() == ErrorKind::AlreadyExists => {
            return Ok(None)
        }
        Err(StoreError::Io { source: err, .. }) if is_cross_device(&err) => {}
        Err(StoreError::Io { source: err, .. }) if links_unsupported(&err) => {
            // No hard links here; a same-volume rename is still atomic.
            if dest.exists() {
                return Ok(None);
            }
            match with_retry(retry, "rename", dest, || fs::rename(source, dest)) {
                Ok(()) => return Ok(Some(MoveMethod::Rename)),
                Err(StoreError::Io { source: err, .. }) if is_cross_device(&err) => {}
                Err(other) => return Err(other),
            }
        }
        Err(other) => return Err(other),
    }
    copy_verify(source, dest, retry)
}

fn copy_verify(source: &Path, dest: &Path, retry: &RetryConfig) -> Result<Option<MoveMethod>> {
    let mut out = match fs::OpenOptions::new().write(true).create_new(true).open(dest) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => return Err(StoreError::io("create", dest, err)),
    };
    let copied = with_retry(retry, "copy to", dest, || {
        out.set_len(0)?;
        out.seek(SeekFrom::Start(0))?;
        let mut input = fs::File::open(source)?;
        io::copy(&mut input, &mut out)?;
        out.flush()?;
        out.sync_all()
    });
    if let Err(err) = copied {
        discard_partial(dest);
        return Err(err);
    }
    let (expected, actual) = match (file_sha256(source), file_sha256(dest)) {
        (Ok(expected), Ok(actual)) => (expected, actual),
        (Err(err), _) | (_, Err(err)) => {
            discard_partial(dest);
            return Err(err);
        }
    };
    if expected != actual {
        discard_partial(dest);
        return Err(StoreError::io(
            "verify copy at",
            dest,
            io::Error::new(ErrorKind::InvalidData, "digest mismatch after copy"),
        ));
    }
    remove_source(source);
    Ok(Some(MoveMethod::CopyVerify))
}

fn remove_source(source: &Path) {
    if let Err(err) = fs::remove_file(source) {
        // The destination is already durable; a leftover source is only clutter.
        tracing::warn!(path = %source.display(), error = %err, "remove moved source");
    }
}

fn discard_partial(dest: &Path) {
    if let Err(err) = fs::remove_file(dest) {
        tracing::warn!(path = %dest.display(), error = %err, "remove partial copy");
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

fn links_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EPERM || code == libc::ENOTSUP || code == libc::EMLINK
    ) || err.kind() == ErrorKind::Unsupported
}

fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock)
        || matches!(
            err.raw_os_error(),
            Some(code) if code == libc::EAGAIN || code == libc::EBUSY || code == libc::ETXTBSY
        )
}

/// Run `op`, retrying transient failures with linear backoff.
fn with_retry<T>(
    retry: &RetryConfig,
    what: &'static str,
    path: &Path,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempt >= attempts {
                    return Err(StoreError::TransientIo {
                        op: what,
                        path: path.to_path_buf(),
                        attempts,
                        source: err,
                    });
                }
                tracing::debug!(
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "retrying transient io"
                );
                std::thread::sleep(Duration::from_millis(retry.backoff_ms * u64::from(attempt)));
                attempt += 1;
            }
            Err(err) => return Err(StoreError::io(what, path, err)),
        }
    }
}

#[cfg(test)]
#[path = "photos_tests.rs"]
mod tests;
