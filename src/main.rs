use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use funcprep::bids::{Session, Subject};
use funcprep::cli::Cli;
use funcprep::config::{Config, EnvConfig};
use funcprep::joblog::JobLog;
use funcprep::layout::{ProjectLayout, WorkLayout, default_work_dir, make_log_dir};
use funcprep::submit::{JobRunner, JobSpec, LocalRunner, ParentInvocation, write_parent_script};
use funcprep::workflows::{PreprocContext, run_preproc};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("funcprep")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("funcprep.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Resolve the project and work dirs, requiring that they exist.
///
/// The project dir must always be present; a given work dir must be too, so
/// a typo cannot silently grow a fresh tree and reprocess everything. The
/// default work dir is derived from the user and created later.
fn resolve_paths(cli: &Cli, config: &Config, user: Option<&str>) -> Result<(PathBuf, PathBuf)> {
    let proj_dir = cli
        .proj_dir
        .clone()
        .unwrap_or_else(|| config.project.proj_dir.clone());
    if !proj_dir.is_dir() {
        bail!("Project directory does not exist: {}", proj_dir.display());
    }

    let work_deriv = match &cli.work_dir {
        Some(dir) => {
            if !dir.is_dir() {
                bail!("Work directory does not exist: {}", dir.display());
            }
            dir.clone()
        }
        None => {
            if cli.run_local {
                bail!("--work-dir is required with --run-local");
            }
            let Some(user) = user else {
                bail!("--work-dir is required when USER is not set");
            };
            default_work_dir(&config.project.work_root, user, &config.project.name)
        }
    };

    Ok((proj_dir, work_deriv))
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting funcprep");

    if cli.verbose {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let subjects = cli
        .subjects
        .iter()
        .map(|s| Subject::new(s.clone()))
        .collect::<funcprep::Result<Vec<_>>>()
        .context("Invalid subject identifier")?;

    let session_names = if cli.sessions.is_empty() {
        config.sessions.clone()
    } else {
        cli.sessions.clone()
    };
    let sessions = session_names
        .iter()
        .map(|s| Session::new(s.clone()))
        .collect::<funcprep::Result<Vec<_>>>()
        .context("Invalid session identifier")?;

    let rsa_key = match (&cli.rsa_key, cli.run_local) {
        (Some(key), _) => Some(key.clone()),
        (None, true) => None,
        (None, false) => bail!("--rsa-key is required unless --run-local"),
    };

    let env = EnvConfig::resolve(cli.run_local)?;

    let (proj_dir, work_deriv) = resolve_paths(cli, config, env.user.as_deref())?;

    // A parent job re-entering via --execute reuses the log dir the
    // submitting process created, so scripts, captures, and the manifest
    // all land in one place
    let log_dir = match &cli.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).context("Failed to create log directory")?;
            dir.clone()
        }
        None => make_log_dir(&work_deriv, chrono::Local::now())?,
    };
    info!("Writing job logs to {}", log_dir.display());

    if cli.execute || cli.run_local {
        // Inside a parent job (or running locally): drive the workflow here
        for subj in &subjects {
            println!("{} {}", "Preprocessing:".green(), subj);
            let ctx = PreprocContext {
                subj: subj.clone(),
                sessions: sessions.clone(),
                proj: ProjectLayout::new(&proj_dir),
                work: WorkLayout::new(&work_deriv),
                log_dir: log_dir.clone(),
                fd_thresh: cli.fd_thresh,
                ignore_fmaps: cli.ignore_fmaps,
                run_local: cli.run_local,
                rsa_key: rsa_key.clone(),
            };
            run_preproc(&ctx, config, &env)
                .await
                .context(format!("Preprocessing failed for {}", subj))?;
            println!("{} {}", "Finished:".green(), subj);
        }
        return Ok(());
    }

    // Submitting from a login node: one parent job per subject
    let Some(rsa_key) = rsa_key else {
        bail!("--rsa-key is required unless --run-local");
    };
    let binary = std::env::current_exe().context("Failed to resolve own binary path")?;
    let manifest = Arc::new(JobLog::open(&log_dir)?);
    let runner = LocalRunner::new(&log_dir, manifest);

    for subj in &subjects {
        let invocation = ParentInvocation {
            binary: binary.clone(),
            subject: subj.clone(),
            sessions: sessions.clone(),
            proj_dir: proj_dir.clone(),
            work_dir: work_deriv.clone(),
            log_dir: log_dir.clone(),
            fd_thresh: cli.fd_thresh,
            ignore_fmaps: cli.ignore_fmaps,
            rsa_key: rsa_key.clone(),
            config: cli.config.clone(),
        };
        let script = write_parent_script(&invocation, &config.slurm.parent)?;
        println!("{} {}", "Submitting:".cyan(), script.display());

        let job = JobSpec::new(
            format!("submit_{}", subj.short()),
            format!("sbatch {}", script.display()),
        );
        let output = runner.run(&job).await?;
        print!("{}", output.stdout);

        // Stagger submissions so the scheduler and archive host are not hit
        // all at once
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    println!(
        "{} logs and scripts under {}",
        "Submitted.".green(),
        log_dir.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging()?;

    let config = Config::load(cli.config.as_ref())?;

    if let Err(e) = run_application(&cli, &config).await {
        eprintln!("{} {:#}", "Error:".red(), e);
        std::process::exit(1);
    }

    Ok(())
}
