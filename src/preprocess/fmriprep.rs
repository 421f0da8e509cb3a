//! Containerized fMRIPrep invocation and output collection.
//!
//! fMRIPrep runs once per subject/session from singularity with binds for
//! rawdata, the work tree, templateflow, and the FreeSurfer license. The
//! `<subj>.html` report marks a finished run and gives the resume point.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bids::{Session, Subject};
use crate::config::{EnvConfig, JobResources};
use crate::error::{FuncPrepError, Result};
use crate::layout::{glob_sorted, WorkLayout};
use crate::submit::{JobRunner, JobSpec};

/// Inputs for one subject/session fMRIPrep run.
pub struct FmriprepJob<'a> {
    pub subj: &'a Subject,
    pub ses: &'a Session,
    /// Project rawdata dir bound into the container as `/data`
    pub raw_dir: PathBuf,
    pub work: &'a WorkLayout,
    pub env: &'a EnvConfig,
    pub fd_thresh: f64,
    pub ignore_fmaps: bool,
    pub resources: JobResources,
}

impl<'a> FmriprepJob<'a> {
    /// Build the `singularity run` command line.
    pub fn command(&self) -> String {
        let work_fp = self.work.fmriprep(self.ses);
        let scratch = self.work.fmriprep_scratch(self.subj, self.ses);
        let bids_db = self.work.bids_database(self.subj, self.ses);
        let work_fs = self.work.freesurfer(self.ses);
        let fs_license_dir = self
            .env
            .fs_license
            .parent()
            .unwrap_or(&self.env.fs_license)
            .to_path_buf();

        let mut parts = vec![
            "singularity run".to_string(),
            "--cleanenv".to_string(),
            format!("--bind {}:{}", self.raw_dir.display(), self.raw_dir.display()),
            format!(
                "--bind {}:{}",
                self.work.root().display(),
                self.work.root().display()
            ),
            format!(
                "--bind {}:{}",
                self.env.tplflow_dir.display(),
                self.env.tplflow_dir.display()
            ),
            format!(
                "--bind {}:{}",
                fs_license_dir.display(),
                fs_license_dir.display()
            ),
            format!("--bind {}:/data", self.raw_dir.display()),
            format!("--bind {}:/out", work_fp.display()),
            format!(
                "{} /data /out participant",
                self.env.sing_fmriprep.display()
            ),
            format!("--work-dir {}", scratch.display()),
            format!("--participant-label {}", self.subj.label()),
            "--skull-strip-template MNI152NLin6Asym".to_string(),
            "--output-spaces MNI152NLin6Asym:res-2".to_string(),
            format!("--fs-license {}", self.env.fs_license.display()),
            format!("--fs-subjects-dir {}", work_fs.display()),
            "--use-aroma".to_string(),
            format!("--fd-spike-threshold {}", self.fd_thresh),
            "--skip-bids-validation".to_string(),
            format!("--bids-database-dir {}", bids_db.display()),
            format!(
                "--nthreads {} --omp-nthreads {}",
                self.resources.cpus, self.resources.cpus
            ),
            "--stop-on-first-crash".to_string(),
            "--debug all".to_string(),
        ];

        if self.ignore_fmaps {
            parts.push("--ignore fieldmaps".to_string());
        }

        parts.join(" ")
    }

    fn job_name(&self) -> String {
        format!("{}_{}_fmriprep", self.subj.short(), self.ses.label())
    }

    /// Run fMRIPrep, skipping when the report already exists, then purge the
    /// container scratch.
    pub async fn run(&self, runner: Arc<dyn JobRunner>) -> Result<()> {
        let report = self.work.fmriprep_report(self.subj, self.ses);
        if report.exists() {
            log::info!(
                "fMRIPrep report exists for {}/{}, skipping",
                self.subj,
                self.ses
            );
        } else {
            fs::create_dir_all(self.work.bids_database(self.subj, self.ses))?;
            fs::create_dir_all(self.work.freesurfer(self.ses))?;

            let job = JobSpec::new(self.job_name(), self.command()).resources(self.resources);
            let output = runner.run(&job).await?;

            if !report.exists() {
                log::error!(
                    "fMRIPrep finished without report\nstdout: {}\nstderr: {}",
                    output.stdout,
                    output.stderr
                );
                return Err(FuncPrepError::MissingOutput {
                    name: self.job_name(),
                    path: report,
                });
            }
        }

        // Scratch is large and never needed again; FreeSurfer output stays
        // in the work tree until it is copied out with the derivatives
        let scratch = self.work.fmriprep_scratch(self.subj, self.ses);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        let work_fs_subj = self.work.freesurfer(self.ses).join(self.subj.as_str());
        if !work_fs_subj.exists() {
            log::warn!("FreeSurfer output not found for {}, continuing", self.subj);
        }

        Ok(())
    }
}

/// File lists handed to the FSL/AFNI denoise steps.
#[derive(Debug, Clone)]
pub struct FmriprepOutputs {
    /// Per-run `*desc-preproc_bold.nii.gz`, sorted
    pub preproc_bold: Vec<PathBuf>,
    /// Per-run `*desc-brain_mask.nii.gz`, sorted and aligned with
    /// `preproc_bold`
    pub mask_bold: Vec<PathBuf>,
    /// Anatomical `*_res-2_desc-brain_mask.nii.gz`
    pub mask_anat: PathBuf,
}

/// Collect fMRIPrep outputs for a subject across sessions.
pub fn collect_outputs(
    work: &WorkLayout,
    subj: &Subject,
    sessions: &[Session],
) -> Result<FmriprepOutputs> {
    let mut preproc_bold = Vec::new();
    let mut mask_bold = Vec::new();
    let mut mask_anat: Option<PathBuf> = None;

    for ses in sessions {
        let subj_dir = work.fmriprep_subject(subj, ses);
        preproc_bold.extend(glob_sorted(&format!(
            "{}/**/func/*desc-preproc_bold.nii.gz",
            subj_dir.display()
        ))?);
        mask_bold.extend(glob_sorted(&format!(
            "{}/**/func/*desc-brain_mask.nii.gz",
            subj_dir.display()
        ))?);

        if mask_anat.is_none() {
            // Anat lands at the subject level for single-session runs,
            // under ses-*/anat otherwise
            let mask_str = format!("{}_*_res-2_desc-brain_mask.nii.gz", subj);
            let direct = glob_sorted(&format!("{}/anat/{}", subj_dir.display(), mask_str))?;
            let nested =
                glob_sorted(&format!("{}/ses-*/anat/{}", subj_dir.display(), mask_str))?;
            mask_anat = direct.into_iter().next().or_else(|| nested.into_iter().next());
        }
    }

    preproc_bold.sort();
    mask_bold.sort();

    let mask_anat = mask_anat.ok_or_else(|| FuncPrepError::MissingOutput {
        name: format!("{}_fmriprep", subj.short()),
        path: work.root().join("fmriprep"),
    })?;

    if preproc_bold.is_empty() || mask_bold.is_empty() {
        return Err(FuncPrepError::MissingOutput {
            name: format!("{}_fmriprep", subj.short()),
            path: work.root().join("fmriprep"),
        });
    }
    if preproc_bold.len() != mask_bold.len() {
        return Err(FuncPrepError::RunMismatch {
            preproc: preproc_bold.len(),
            masks: mask_bold.len(),
        });
    }

    Ok(FmriprepOutputs {
        preproc_bold,
        mask_bold,
        mask_anat,
    })
}
