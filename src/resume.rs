//! Resume-detection: reconciling restored jobs with what is on disk.

use std::path::{Path, PathBuf};

use crate::fs::{FileSystem, TokioFileSystem};
use crate::job::JobId;

/// Sidecar suffixes the download tools leave next to an unfinished output.
const SIDECARS: &[&str] = &[".part", ".ytdl", ".aria2"];

/// On-disk state of a job's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// The output exists and no tool left a sidecar behind.
    Complete,
    /// A sidecar exists: the tool can continue from it.
    Partial,
    /// Nothing on disk yet.
    Missing,
}

/// Jobs whose recorded status disagrees with the filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Jobs whose output is already fully present.
    pub completed: Vec<JobId>,
    /// Jobs with partial artifacts to continue from.
    pub partial: Vec<JobId>,
}

/// Inspects job outputs through a [`FileSystem`].
pub struct ResumeScanner<F: FileSystem = TokioFileSystem> {
    fs: F,
}

impl ResumeScanner<TokioFileSystem> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fs: TokioFileSystem::new(),
        }
    }
}

impl Default for ResumeScanner<TokioFileSystem> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FileSystem> ResumeScanner<F> {
    pub const fn with_fs(fs: F) -> Self {
        Self { fs }
    }

    /// Classifies one output path.
    pub async fn classify_output(&self, output: &Path) -> FileStatus {
        for suffix in SIDECARS {
            if self.fs.file_exists(&sidecar_path(output, suffix)).await {
                return FileStatus::Partial;
            }
        }
        match self.fs.file_size(output).await {
            Some(0) => FileStatus::Missing,
            Some(_) => FileStatus::Complete,
            // Torrent outputs are directories; file_size only reports files.
            None if self.fs.file_exists(output).await => FileStatus::Complete,
            None => FileStatus::Missing,
        }
    }

    /// Scans every `(job, output)` pair.
    pub async fn scan(&self, targets: Vec<(JobId, PathBuf)>) -> ScanReport {
        let mut report = ScanReport::default();
        for (id, output) in targets {
            match self.classify_output(&output).await {
                FileStatus::Complete => {
                    log::info!("Job {id}: output {} already complete", output.display());
                    report.completed.push(id);
                }
                FileStatus::Partial => {
                    log::info!("Job {id}: resumable partial at {}", output.display());
                    report.partial.push(id);
                }
                FileStatus::Missing => {}
            }
        }
        report
    }
}

fn sidecar_path(output: &Path, suffix: &str) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
