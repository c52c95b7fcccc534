//! Typed paths into the store and job directory layouts.
//!
//! Centralizing path construction keeps file access consistent across
//! components and prevents drift when the layout evolves.
use std::path::{Path, PathBuf};

/// Directory name under the store root holding one directory per job.
pub const JOBS_DIR: &str = "jobs";
/// Directory name under a job's `photos/` tree holding superseded assets.
pub const ARCHIVE_DIR: &str = "_archive";

/// Paths rooted at the store root (shared by all jobs).
#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `config.json` path.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Return the `sessions.json` path.
    pub fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    /// Return the `jobs/` directory path.
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join(JOBS_DIR)
    }

    /// Return the directory for a single job id.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(job_id)
    }
}

/// Convenience wrapper for locating artifacts inside one job directory.
#[derive(Debug, Clone)]
pub struct JobPaths {
    root: PathBuf,
}

impl JobPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `job.json` path.
    pub fn record_path(&self) -> PathBuf {
        self.root.join("job.json")
    }

    /// Return the `.lock` marker path.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Return the `.lock.meta` owner metadata path.
    pub fn lock_meta_path(&self) -> PathBuf {
        self.root.join(".lock.meta")
    }

    /// Return the `runs/` directory path.
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    /// Return the `runs/<run_id>.json` path.
    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    /// Return the `photos/` directory path.
    pub fn photos_dir(&self) -> PathBuf {
        self.root.join("photos")
    }

    /// Return the `photos/_archive/` directory path.
    pub fn archive_dir(&self) -> PathBuf {
        self.photos_dir().join(ARCHIVE_DIR)
    }

    /// Return the active asset path for a slot, keeping the source extension.
    pub fn slot_asset_path(&self, slot_key: &str, extension: Option<&str>) -> PathBuf {
        match extension {
            Some(ext) if !ext.is_empty() => self.photos_dir().join(format!("{slot_key}.{ext}")),
            _ => self.photos_dir().join(slot_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_layout_matches_documented_tree() {
        let paths = JobPaths::new(PathBuf::from("/store/jobs/JOB_X"));
        assert_eq!(paths.record_path(), Path::new("/store/jobs/JOB_X/job.json"));
        assert_eq!(paths.lock_meta_path(), Path::new("/store/jobs/JOB_X/.lock.meta"));
        assert_eq!(
            paths.run_path("R1"),
            Path::new("/store/jobs/JOB_X/runs/R1.json")
        );
        assert_eq!(
            paths.slot_asset_path("overview", Some("jpg")),
            Path::new("/store/jobs/JOB_X/photos/overview.jpg")
        );
        assert_eq!(
            paths.archive_dir(),
            Path::new("/store/jobs/JOB_X/photos/_archive")
        );
    }
}
