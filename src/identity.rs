//! Job and run identifiers.
//!
//! Job ids are a pure function of `(wo_no, line)` so concurrent submissions of
//! the same work order resolve to the same directory. Run ids only need to be
//! unique and carry a readable timestamp.
use crate::util::{now_utc, sha256_hex};

/// Prefix shared by every job id.
pub const JOB_ID_PREFIX: &str = "JOB";
/// Substitute for a component that sanitizes to nothing.
pub const EMPTY_COMPONENT: &str = "X";
/// Maximum length of each sanitized component.
pub const COMPONENT_MAX_LEN: usize = 20;

/// Derive the deterministic job id for a work order line.
pub fn generate_job_id(wo_no: &str, line: &str) -> String {
    let digest = sha256_hex(format!("{wo_no}:{line}").as_bytes());
    format!(
        "{JOB_ID_PREFIX}_{}_{}_{}",
        sanitize_component(wo_no),
        sanitize_component(line),
        &digest[..8]
    )
}

/// Reduce arbitrary text to a short, filesystem-safe ASCII token.
///
/// ASCII alphanumerics are kept; every other character becomes a separator.
/// Separator runs collapse to one underscore and edges are trimmed.
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out.truncate(COMPONENT_MAX_LEN);
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        EMPTY_COMPONENT.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Allocate a fresh run id: UTC second timestamp plus 32 random bits.
pub fn generate_run_id() -> String {
    let suffix: u32 = rand::random();
    format!("{}-{suffix:08x}", now_utc().format("%Y%m%dT%H%M%SZ"))
}
