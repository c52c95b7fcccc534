//! Filesystem-backed job state store.
//!
//! Each job lives in its own directory holding one authoritative record
//! (`job.json`), a lock marker, append-only run ledgers, and photo assets.
//! Identity is derived from `(wo_no, line)`; content is fingerprinted with a
//! canonical JSON hash that can skip free-text fields.
pub mod cli;
pub mod config;
pub mod durable;
pub mod error;
pub mod hash;
pub mod identity;
pub mod jobs;
pub mod lock;
pub mod paths;
pub mod photos;
pub mod record;
pub mod runlog;
pub mod session;
pub mod util;
pub mod value;

pub use config::{LockConfig, RetryConfig, SlotConfig, StoreConfig};
pub use durable::Durability;
pub use error::{RejectCode, RejectContext, Result, StoreError};
pub use jobs::{Extractor, FieldProposal, JobStatus, JobStore, RenderInput, Renderer};
pub use lock::LockHandle;
pub use record::{JobRecord, MeasurementRow, PhotoSlotMapping};
pub use runlog::{RunEvent, RunLog, WarningInput, WarningLevel};
pub use value::{Decimal, FieldValue};
