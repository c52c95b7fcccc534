//! Error taxonomy for the job store.
//!
//! Hard invariant violations surface as `PolicyReject` with a closed code and
//! structured context. Transient filesystem trouble is retried by the caller
//! that owns the retry budget and escalates to `TransientIo` once exhausted.
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Closed set of policy violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    CorruptRecord,
    IdentityMismatch,
    UnsupportedSchema,
    RequiredSlotMissing,
    InvalidSlot,
    AssetMove,
    LockTimeout,
    LockCancelled,
    LockNotHeld,
    InvalidNumber,
    InvalidValue,
    ReservedField,
    UnknownSession,
    AppendOnlyViolation,
}

impl RejectCode {
    /// Return the stable string identifier used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::CorruptRecord => "corrupt_record",
            RejectCode::IdentityMismatch => "identity_mismatch",
            RejectCode::UnsupportedSchema => "unsupported_schema",
            RejectCode::RequiredSlotMissing => "required_slot_missing",
            RejectCode::InvalidSlot => "invalid_slot",
            RejectCode::AssetMove => "asset_move",
            RejectCode::LockTimeout => "lock_timeout",
            RejectCode::LockCancelled => "lock_cancelled",
            RejectCode::LockNotHeld => "lock_not_held",
            RejectCode::InvalidNumber => "invalid_number",
            RejectCode::InvalidValue => "invalid_value",
            RejectCode::ReservedField => "reserved_field",
            RejectCode::UnknownSession => "unknown_session",
            RejectCode::AppendOnlyViolation => "append_only_violation",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing context attached to every policy rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RejectContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_or_slot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub detail: String,
}

impl RejectContext {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            ..Self::default()
        }
    }

    pub fn job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn subject(mut self, field_or_slot: impl Into<String>) -> Self {
        self.field_or_slot = Some(field_or_slot.into());
        self
    }

    pub fn path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }
}

impl fmt::Display for RejectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)?;
        if let Some(job_id) = &self.job_id {
            write!(f, " (job {job_id})")?;
        }
        if let Some(subject) = &self.field_or_slot {
            write!(f, " [{subject}]")?;
        }
        if let Some(path) = &self.path {
            write!(f, " at {}", path.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("policy reject {code}: {context}")]
    PolicyReject {
        code: RejectCode,
        context: RejectContext,
    },

    #[error("{op} {} failed after {attempts} attempts: {source}", .path.display())]
    TransientIo {
        op: &'static str,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {reason}")]
    Config { reason: String },
}

impl StoreError {
    pub fn reject(code: RejectCode, context: RejectContext) -> Self {
        StoreError::PolicyReject { code, context }
    }

    pub fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn serialization(what: &'static str, source: serde_json::Error) -> Self {
        StoreError::Serialization { what, source }
    }

    pub fn is_policy_reject(&self) -> bool {
        matches!(self, StoreError::PolicyReject { .. })
    }

    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            StoreError::PolicyReject { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn reject_context(&self) -> Option<&RejectContext> {
        match self {
            StoreError::PolicyReject { context, .. } => Some(context),
            _ => None,
        }
    }
}
