//! Append-only JSONL manifest of executed jobs.
//!
//! Every external invocation lands here with its exit status and duration,
//! giving a reviewable index over the per-job stdout/stderr captures in the
//! log dir.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One executed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration_ms: u64,
    pub finished_at: DateTime<Local>,
}

/// Writer over `<log_dir>/manifest.jsonl`.
pub struct JobLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JobLog {
    const FILE_NAME: &'static str = "manifest.jsonl";

    /// Open (or create) the manifest in the given log dir.
    pub fn open(log_dir: impl AsRef<Path>) -> Result<Self> {
        let path = log_dir.as_ref().join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record as one JSON line.
    pub fn append(&self, record: &JobRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read every record back, skipping blank lines.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<JobRecord>> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                records.push(serde_json::from_str(&line)?);
            }
        }
        Ok(records)
    }
}
