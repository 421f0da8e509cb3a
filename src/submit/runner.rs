//! Job submission seam.
//!
//! Everything external runs through a [`JobRunner`]: directly on the current
//! host, or wrapped in an `sbatch --wait` allocation when the workflow runs
//! on the cluster. Both paths capture stdout/stderr to the log dir and
//! record the job in the run manifest.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Local;
use tokio::process::Command;

use crate::config::JobResources;
use crate::error::{FuncPrepError, Result};
use crate::joblog::{JobLog, JobRecord};

/// One unit of external work.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Scheduler/log name, e.g. `ER0009_day2_fmriprep`
    pub name: String,
    /// Shell command to run. Avoid double quotes; they conflict with the
    /// sbatch `--wrap` syntax (particularly relevant with AFNI).
    pub command: String,
    pub resources: JobResources,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            resources: JobResources::default(),
        }
    }

    /// Set the scheduler resource request.
    pub fn resources(mut self, resources: JobResources) -> Self {
        self.resources = resources;
        self
    }
}

/// Captured output of a finished job.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes [`JobSpec`]s. Implementations must check the exit status and
/// fail with the captured stderr on a nonzero exit.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &JobSpec) -> Result<JobOutput>;
}

async fn run_shell(command: &str) -> std::io::Result<std::process::Output> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = cmd.spawn()?;
    child.wait_with_output().await
}

fn record_job(
    manifest: &JobLog,
    job: &JobSpec,
    status: &std::process::ExitStatus,
    started: Instant,
) {
    let record = JobRecord {
        name: job.name.clone(),
        command: job.command.clone(),
        exit_code: status.code(),
        success: status.success(),
        duration_ms: started.elapsed().as_millis() as u64,
        finished_at: Local::now(),
    };
    if let Err(e) = manifest.append(&record) {
        log::warn!("Failed to record job '{}' in manifest: {}", job.name, e);
    }
}

fn check_status(job: &JobSpec, output: &std::process::Output) -> Result<JobOutput> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        Ok(JobOutput { stdout, stderr })
    } else {
        Err(FuncPrepError::JobFailed {
            name: job.name.clone(),
            code: output.status.code(),
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Runs jobs as plain subprocesses on the current host.
pub struct LocalRunner {
    log_dir: PathBuf,
    manifest: Arc<JobLog>,
}

impl LocalRunner {
    pub fn new(log_dir: impl Into<PathBuf>, manifest: Arc<JobLog>) -> Self {
        Self {
            log_dir: log_dir.into(),
            manifest,
        }
    }

    fn write_captures(&self, job: &JobSpec, output: &std::process::Output) -> Result<()> {
        let out_path = self.log_dir.join(format!("out_{}.log", job.name));
        let err_path = self.log_dir.join(format!("err_{}.log", job.name));
        std::fs::write(out_path, &output.stdout)?;
        std::fs::write(err_path, &output.stderr)?;
        Ok(())
    }
}

#[async_trait]
impl JobRunner for LocalRunner {
    async fn run(&self, job: &JobSpec) -> Result<JobOutput> {
        log::info!("Running job '{}': {}", job.name, job.command);
        let started = Instant::now();
        let output = run_shell(&job.command).await?;
        self.write_captures(job, &output)?;
        record_job(&self.manifest, job, &output.status, started);
        check_status(job, &output)
    }
}

/// Wraps each job in an `sbatch --wait` allocation so heavy steps get their
/// own scheduler resources.
pub struct SlurmRunner {
    log_dir: PathBuf,
    manifest: Arc<JobLog>,
}

impl SlurmRunner {
    pub fn new(log_dir: impl Into<PathBuf>, manifest: Arc<JobLog>) -> Self {
        Self {
            log_dir: log_dir.into(),
            manifest,
        }
    }

    /// Build the sbatch wrapper command for a job.
    pub fn sbatch_command(&self, job: &JobSpec) -> String {
        let res = &job.resources;
        format!(
            "sbatch -J {name} -t {hours}:00:00 --cpus-per-task={cpus} --mem={mem}G \
             -o {log}/out_{name}.log -e {log}/err_{name}.log --wait --wrap=\"{cmd}\"",
            name = job.name,
            hours = res.hours,
            cpus = res.cpus,
            mem = res.mem_gb,
            log = self.log_dir.display(),
            cmd = job.command,
        )
    }
}

#[async_trait]
impl JobRunner for SlurmRunner {
    async fn run(&self, job: &JobSpec) -> Result<JobOutput> {
        let sbatch = self.sbatch_command(job);
        log::info!("Submitting sbatch job '{}': {}", job.name, sbatch);
        let started = Instant::now();
        let output = run_shell(&sbatch).await?;
        record_job(&self.manifest, job, &output.status, started);
        check_status(job, &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local_runner(dir: &TempDir) -> LocalRunner {
        let manifest = Arc::new(JobLog::open(dir.path()).unwrap());
        LocalRunner::new(dir.path(), manifest)
    }

    #[test]
    fn test_job_spec_builder() {
        let job = JobSpec::new("echo_job", "echo hi").resources(JobResources {
            hours: 2,
            cpus: 4,
            mem_gb: 8,
        });
        assert_eq!(job.name, "echo_job");
        assert_eq!(job.resources.cpus, 4);
    }

    #[tokio::test]
    async fn test_local_runner_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let runner = local_runner(&dir);

        let out = runner
            .run(&JobSpec::new("echo_foo", "echo foo local"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "foo local\n");

        let captured =
            std::fs::read_to_string(dir.path().join("out_echo_foo.log")).unwrap();
        assert_eq!(captured, "foo local\n");
        assert!(dir.path().join("err_echo_foo.log").exists());
    }

    #[tokio::test]
    async fn test_local_runner_nonzero_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let runner = local_runner(&dir);

        let err = runner
            .run(&JobSpec::new("fail_job", "echo boom >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            FuncPrepError::JobFailed { name, code, stderr } => {
                assert_eq!(name, "fail_job");
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_local_runner_records_manifest() {
        let dir = TempDir::new().unwrap();
        let runner = local_runner(&dir);

        runner.run(&JobSpec::new("ok_job", "true")).await.unwrap();
        let _ = runner.run(&JobSpec::new("bad_job", "false")).await;

        let records = JobLog::read_all(dir.path().join("manifest.jsonl")).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert!(!records[1].success);
        assert_eq!(records[1].name, "bad_job");
    }

    #[test]
    fn test_sbatch_command_shape() {
        let dir = TempDir::new().unwrap();
        let manifest = Arc::new(JobLog::open(dir.path()).unwrap());
        let runner = SlurmRunner::new("/work/logs", manifest);

        let job = JobSpec::new("0009_fmriprep", "singularity run img").resources(JobResources {
            hours: 40,
            cpus: 10,
            mem_gb: 12,
        });
        let cmd = runner.sbatch_command(&job);

        assert!(cmd.starts_with("sbatch -J 0009_fmriprep -t 40:00:00"));
        assert!(cmd.contains("--cpus-per-task=10"));
        assert!(cmd.contains("--mem=12G"));
        assert!(cmd.contains("-o /work/logs/out_0009_fmriprep.log"));
        assert!(cmd.contains("-e /work/logs/err_0009_fmriprep.log"));
        assert!(cmd.contains("--wait"));
        assert!(cmd.ends_with("--wrap=\"singularity run img\""));
    }
}
