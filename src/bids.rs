//! BIDS identifiers and filename arithmetic.
//!
//! Subjects and sessions are carried as validated newtypes; EPI derivative
//! filenames follow the eight-field convention
//! `sub_ses_task_run_space_res_desc_suffix` and output names are derived by
//! swapping the `desc-` field.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FuncPrepError, Result};

/// A BIDS subject identifier, e.g. `sub-ER0009`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject(String);

impl Subject {
    /// Validate and wrap a subject identifier.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        match raw.strip_prefix("sub-") {
            Some(id) if !id.is_empty() => Ok(Self(raw)),
            _ => Err(FuncPrepError::BidsName(raw)),
        }
    }

    /// Full identifier, with the `sub-` prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bare identifier, e.g. `ER0009`, as fMRIPrep's `--participant-label` wants.
    pub fn label(&self) -> &str {
        &self.0[4..]
    }

    /// Short form used in scheduler job names, e.g. `0009` for `sub-ER0009`.
    pub fn short(&self) -> &str {
        let label = self.label();
        if label.len() > 2 { &label[2..] } else { label }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A BIDS session identifier, e.g. `ses-day2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session(String);

impl Session {
    /// Validate and wrap a session identifier.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        match raw.strip_prefix("ses-") {
            Some(id) if !id.is_empty() => Ok(Self(raw)),
            _ => Err(FuncPrepError::BidsName(raw)),
        }
    }

    /// Full identifier, with the `ses-` prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bare identifier, e.g. `day2`.
    pub fn label(&self) -> &str {
        &self.0[4..]
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed eight-field EPI derivative filename.
///
/// `sub-X_ses-Y_task-T_run-N_space-S_res-R_desc-D_bold.nii.gz`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpiName {
    pub sub: String,
    pub ses: String,
    pub task: String,
    pub run: String,
    pub space: String,
    pub res: String,
    pub desc: String,
    /// Trailing suffix including extension, e.g. `bold.nii.gz`.
    pub suffix: String,
}

impl EpiName {
    /// Parse an EPI filename (path components are ignored).
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let name = path
            .as_ref()
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FuncPrepError::BidsName(path.as_ref().display().to_string()))?;

        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() != 8 {
            return Err(FuncPrepError::BidsName(name.to_string()));
        }

        let expect = |idx: usize, prefix: &str| -> Result<String> {
            let field = fields[idx];
            if field.starts_with(prefix) {
                Ok(field.to_string())
            } else {
                Err(FuncPrepError::BidsName(name.to_string()))
            }
        };

        Ok(Self {
            sub: expect(0, "sub-")?,
            ses: expect(1, "ses-")?,
            task: expect(2, "task-")?,
            run: expect(3, "run-")?,
            space: expect(4, "space-")?,
            res: expect(5, "res-")?,
            desc: expect(6, "desc-")?,
            suffix: fields[7].to_string(),
        })
    }

    /// Rebuild the filename with a different `desc-` field.
    pub fn with_desc(&self, desc: &str) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}_desc-{}_{}",
            self.sub, self.ses, self.task, self.run, self.space, self.res, desc, self.suffix
        )
    }

    /// Session this run belongs to.
    pub fn session(&self) -> Result<Session> {
        Session::new(self.ses.clone())
    }

    /// Compact scheduler job name: `<sub>_<ses>_<task initial>_r<run digit>_<step>`.
    pub fn job_name(&self, step: &str) -> String {
        let sub = self.sub.strip_prefix("sub-").unwrap_or(&self.sub);
        let ses = self.ses.strip_prefix("ses-").unwrap_or(&self.ses);
        let task_initial = self
            .task
            .strip_prefix("task-")
            .unwrap_or(&self.task)
            .chars()
            .next()
            .unwrap_or('x');
        let run_digit = self.run.chars().last().unwrap_or('0');
        format!("{}_{}_{}_r{}_{}", sub, ses, task_initial, run_digit, step)
    }
}
