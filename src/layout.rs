//! Directory bookkeeping for the project and work partitions.
//!
//! The project side is the BIDS tree on the group partition where final
//! derivatives are stored; the work side is the scratch tree where tools run
//! and intermediates accumulate. Sessions are treated independently for
//! fMRIPrep and FreeSurfer, so those work dirs are session-scoped.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::bids::{Session, Subject};
use crate::error::Result;

/// Derivative pipeline step names, also the directory names under
/// `derivatives/pre_processing`.
pub const DERIV_STEPS: [&str; 3] = ["fmriprep", "freesurfer", "fsl_denoise"];

/// BIDS project tree on the group partition.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    proj_dir: PathBuf,
}

impl ProjectLayout {
    pub fn new(proj_dir: impl Into<PathBuf>) -> Self {
        Self {
            proj_dir: proj_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.proj_dir
    }

    pub fn rawdata(&self) -> PathBuf {
        self.proj_dir.join("rawdata")
    }

    pub fn subject_rawdata(&self, subj: &Subject) -> PathBuf {
        self.rawdata().join(subj.as_str())
    }

    pub fn derivatives(&self) -> PathBuf {
        self.proj_dir.join("derivatives").join("pre_processing")
    }

    pub fn step(&self, step: &str) -> PathBuf {
        self.derivatives().join(step)
    }

    /// Create the storage dirs that receive final files.
    pub fn create(&self) -> Result<()> {
        for step in ["fmriprep", "fsl_denoise"] {
            fs::create_dir_all(self.step(step))?;
        }
        Ok(())
    }
}

/// Scratch tree where the tools actually run.
#[derive(Debug, Clone)]
pub struct WorkLayout {
    work_deriv: PathBuf,
}

impl WorkLayout {
    pub fn new(work_deriv: impl Into<PathBuf>) -> Self {
        Self {
            work_deriv: work_deriv.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.work_deriv
    }

    /// Session-scoped fMRIPrep output dir.
    pub fn fmriprep(&self, ses: &Session) -> PathBuf {
        self.work_deriv.join("fmriprep").join(ses.as_str())
    }

    /// fMRIPrep writes `<subj>.html` next to the subject dir; its presence
    /// marks a finished run.
    pub fn fmriprep_report(&self, subj: &Subject, ses: &Session) -> PathBuf {
        self.fmriprep(ses).join(format!("{}.html", subj))
    }

    pub fn fmriprep_subject(&self, subj: &Subject, ses: &Session) -> PathBuf {
        self.fmriprep(ses).join(subj.as_str())
    }

    /// fMRIPrep scratch dir, purged after each run.
    pub fn fmriprep_scratch(&self, subj: &Subject, ses: &Session) -> PathBuf {
        self.work_deriv
            .join("fmriprep")
            .join("tmp_work")
            .join(ses.as_str())
            .join(subj.as_str())
    }

    /// PyBIDS database dir inside the scratch area.
    pub fn bids_database(&self, subj: &Subject, ses: &Session) -> PathBuf {
        self.fmriprep_scratch(subj, ses).join("bids_layout")
    }

    /// Session-scoped FreeSurfer subjects dir, driven by fMRIPrep.
    pub fn freesurfer(&self, ses: &Session) -> PathBuf {
        self.work_deriv.join("freesurfer").join(ses.as_str())
    }

    pub fn fsl_denoise(&self) -> PathBuf {
        self.work_deriv.join("fsl_denoise")
    }

    pub fn fsl_subject(&self, subj: &Subject) -> PathBuf {
        self.fsl_denoise().join(subj.as_str())
    }

    /// Output dir for one run's denoise intermediates and finals.
    pub fn fsl_func(&self, subj: &Subject, ses: &Session) -> PathBuf {
        self.fsl_subject(subj).join(ses.as_str()).join("func")
    }

    /// Create the top-level work dirs.
    pub fn create(&self) -> Result<()> {
        for step in DERIV_STEPS {
            fs::create_dir_all(self.work_deriv.join(step))?;
        }
        Ok(())
    }
}

/// Sorted glob matches; entries the walk could not read are skipped.
pub fn glob_sorted(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)?.filter_map(|entry| entry.ok()).collect();
    paths.sort();
    Ok(paths)
}

/// Default work dir when `--work-dir` is not given:
/// `<work_root>/<user>/<project>/pre_processing`.
pub fn default_work_dir(work_root: &Path, user: &str, project: &str) -> PathBuf {
    work_root.join(user).join(project).join("pre_processing")
}

/// Create the timestamped log dir beside the work tree:
/// `<parent-of-work_deriv>/logs/funcprep_<yymmdd_HHMM>`.
///
/// Job stdout/stderr captures, generated sbatch scripts, and the run
/// manifest all land here.
pub fn make_log_dir(work_deriv: &Path, now: DateTime<Local>) -> Result<PathBuf> {
    let parent = work_deriv.parent().unwrap_or(work_deriv);
    let log_dir = parent
        .join("logs")
        .join(format!("funcprep_{}", now.format("%y%m%d_%H%M")));
    fs::create_dir_all(&log_dir)?;
    Ok(log_dir)
}
