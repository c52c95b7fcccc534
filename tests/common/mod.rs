//! Shared helpers for integration tests.
#![allow(dead_code)]

use jobstore::config::default_config;
use jobstore::JobStore;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A throwaway store root plus a separate directory for uploads.
pub struct StoreFixture {
    pub root: TempDir,
    pub uploads: TempDir,
}

impl Default for StoreFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreFixture {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("store root"),
            uploads: tempfile::tempdir().expect("uploads dir"),
        }
    }

    /// Store with short lock timings so contention tests finish quickly.
    pub fn store(&self) -> JobStore {
        let mut config = default_config();
        config.lock.timeout_ms = 2_000;
        config.lock.retry_interval_ms = 10;
        config.move_retry.backoff_ms = 1;
        JobStore::with_config(self.root.path(), config)
    }

    pub fn upload(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.uploads.path().join(name);
        std::fs::write(&path, contents).expect("write upload");
        path
    }

    /// Run the `jobstore` binary against this fixture's root.
    pub fn cli(&self, args: &[&str]) -> Output {
        run_cli(self.root.path(), args)
    }
}

pub fn run_cli(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jobstore"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("JOBSTORE_ROOT")
        .env("JOBSTORE_LOG", "off")
        .output()
        .expect("spawn jobstore")
}

pub fn stdout_line(output: &Output) -> String {
    assert!(
        output.status.success(),
        "jobstore failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
