//! Per-subject preprocessing workflow.
//!
//! fetch -> fMRIPrep per session -> FSL/AFNI denoise per run -> copy work
//! derivatives to the project tree -> push to the archive -> purge work.
//! Runs fan out concurrently; each is an independent chain of tool calls
//! with no shared state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::bids::{EpiName, Session, Subject};
use crate::config::{Config, EnvConfig};
use crate::error::{FuncPrepError, Result};
use crate::joblog::JobLog;
use crate::layout::{ProjectLayout, WorkLayout};
use crate::preprocess::denoise::{purge_intermediates, verify_scaled};
use crate::preprocess::{collect_outputs, Denoiser, FmriprepJob};
use crate::submit::{JobRunner, JobSpec, LocalRunner, SlurmRunner};
use crate::transfer::DataSync;

/// Everything one subject's workflow needs.
pub struct PreprocContext {
    pub subj: Subject,
    pub sessions: Vec<Session>,
    pub proj: ProjectLayout,
    pub work: WorkLayout,
    pub log_dir: PathBuf,
    pub fd_thresh: f64,
    pub ignore_fmaps: bool,
    /// Local execution: no scheduler wrapping, no remote staging
    pub run_local: bool,
    pub rsa_key: Option<PathBuf>,
}

/// Run the full preprocessing workflow for one subject.
pub async fn run_preproc(ctx: &PreprocContext, config: &Config, env: &EnvConfig) -> Result<()> {
    ctx.proj.create()?;
    ctx.work.create()?;

    let manifest = Arc::new(JobLog::open(&ctx.log_dir)?);
    // Housekeeping commands (cp, rm, rsync) always run on this host; the
    // heavy tool invocations get their own allocations off-local.
    let shell_runner: Arc<dyn JobRunner> =
        Arc::new(LocalRunner::new(&ctx.log_dir, manifest.clone()));
    let job_runner: Arc<dyn JobRunner> = if ctx.run_local {
        Arc::new(LocalRunner::new(&ctx.log_dir, manifest.clone()))
    } else {
        Arc::new(SlurmRunner::new(&ctx.log_dir, manifest.clone()))
    };

    // Download needed files
    let sync = if ctx.run_local {
        None
    } else {
        let user = env
            .user
            .clone()
            .ok_or_else(|| FuncPrepError::MissingEnv("USER".to_string()))?;
        let rsa_key = ctx.rsa_key.clone().ok_or_else(|| {
            FuncPrepError::Transfer("RSA key required for remote staging".to_string())
        })?;
        Some(DataSync::new(
            shell_runner.clone(),
            ctx.proj.clone(),
            &config.remote,
            &user,
            rsa_key,
        ))
    };
    if let Some(sync) = &sync {
        for ses in &ctx.sessions {
            sync.pull_rawdata(&ctx.subj, ses).await?;
        }
    }

    // fMRIPrep, sessions independently
    for ses in &ctx.sessions {
        let job = FmriprepJob {
            subj: &ctx.subj,
            ses,
            raw_dir: ctx.proj.rawdata(),
            work: &ctx.work,
            env,
            fd_thresh: ctx.fd_thresh,
            ignore_fmaps: ctx.ignore_fmaps,
            resources: config.slurm.fmriprep,
        };
        job.run(job_runner.clone()).await?;
    }

    // Finish preprocessing with FSL, AFNI; one task per run
    let outputs = collect_outputs(&ctx.work, &ctx.subj, &ctx.sessions)?;
    let denoiser = Arc::new(Denoiser::new(
        job_runner.clone(),
        env.sing_afni.clone(),
        config.denoise.clone(),
        config.slurm.denoise,
    ));

    let mut tasks: JoinSet<Result<PathBuf>> = JoinSet::new();
    for (run_epi, run_mask) in outputs
        .preproc_bold
        .iter()
        .cloned()
        .zip(outputs.mask_bold.iter().cloned())
    {
        let ses = EpiName::parse(&run_epi)?.session()?;
        let out_dir = ctx.work.fsl_func(&ctx.subj, &ses);
        let denoiser = denoiser.clone();
        tasks.spawn(async move { denoiser.process_run(&run_epi, &run_mask, &out_dir).await });
    }
    while let Some(joined) = tasks.join_next().await {
        let _smoothed = joined.map_err(|e| FuncPrepError::JobFailed {
            name: "denoise".to_string(),
            code: None,
            stderr: e.to_string(),
        })??;
    }

    let work_fsl_subj = ctx.work.fsl_subject(&ctx.subj);
    verify_scaled(&work_fsl_subj, outputs.preproc_bold.len())?;
    purge_intermediates(&work_fsl_subj)?;

    // Clean up
    if let Some(sync) = &sync {
        copy_clean(
            shell_runner.clone(),
            &ctx.proj,
            &ctx.work,
            &ctx.subj,
            &ctx.sessions,
        )
        .await?;
        sync.push_derivatives(&ctx.subj, &ctx.sessions).await?;
    }

    Ok(())
}

/// Copy finished derivatives from the work tree to the project tree and
/// remove the work copies. Missing sources (e.g. no FreeSurfer output) are
/// skipped with a warning.
pub async fn copy_clean(
    runner: Arc<dyn JobRunner>,
    proj: &ProjectLayout,
    work: &WorkLayout,
    subj: &Subject,
    sessions: &[Session],
) -> Result<()> {
    let short = subj.short();

    // (job name, source, destination); sources under fmriprep are
    // session-scoped in work but merged per subject in the project tree
    let mut entries: Vec<(String, String, PathBuf)> = vec![(
        format!("{}_cp_fsl", short),
        work.fsl_subject(subj).display().to_string(),
        proj.step("fsl_denoise"),
    )];
    for ses in sessions {
        let proj_fp_subj = proj.step("fmriprep").join(subj.as_str());
        entries.push((
            format!("{}_{}_cp_fp", short, ses.label()),
            format!("{}/*", work.fmriprep_subject(subj, ses).display()),
            proj_fp_subj,
        ));
        entries.push((
            format!("{}_{}_cp_html", short, ses.label()),
            work.fmriprep_report(subj, ses).display().to_string(),
            proj.step("fmriprep").join(format!("{}_{}.html", subj, ses)),
        ));
        entries.push((
            format!("{}_{}_cp_fs", short, ses.label()),
            work.freesurfer(ses).join(subj.as_str()).display().to_string(),
            proj.step("freesurfer").join(ses.as_str()),
        ));
    }

    for (name, src, dst) in entries {
        // A glob source is checked and removed via its parent dir
        let src_dir = src.trim_end_matches("/*").to_string();
        if !Path::new(&src_dir).exists() {
            log::warn!("Source {} missing, skipping copy", src);
            continue;
        }
        std::fs::create_dir_all(dst.parent().unwrap_or(&dst))?;
        if src.ends_with("/*") || dst.extension().is_none() {
            std::fs::create_dir_all(&dst)?;
        }
        let job = JobSpec::new(
            name,
            format!("cp -r {} {} && rm -r {}", src, dst.display(), src_dir),
        );
        runner.run(&job).await?;
    }

    Ok(())
}
