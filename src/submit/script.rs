//! Parent-job script generation.
//!
//! Off-local, each subject gets a long-lived `p<subj>` scheduler job that
//! drives the whole workflow on an allocated node. The script re-invokes
//! this binary with the hidden `--execute` flag and is kept in the log dir
//! for review.

use std::fs;
use std::path::PathBuf;

use crate::bids::{Session, Subject};
use crate::config::JobResources;
use crate::error::Result;

/// Everything needed to re-invoke the binary for one subject.
#[derive(Debug, Clone)]
pub struct ParentInvocation {
    /// Path to the funcprep binary
    pub binary: PathBuf,
    pub subject: Subject,
    pub sessions: Vec<Session>,
    pub proj_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Log dir created at submission; the parent job reuses it so its
    /// manifest and captures land next to the script and `par<subj>.txt`
    pub log_dir: PathBuf,
    pub fd_thresh: f64,
    pub ignore_fmaps: bool,
    pub rsa_key: PathBuf,
    /// Explicit config file, if one was given
    pub config: Option<PathBuf>,
}

impl ParentInvocation {
    /// Command line the parent job executes.
    pub fn command_line(&self) -> String {
        let mut parts = vec![
            self.binary.display().to_string(),
            "--execute".to_string(),
            "-s".to_string(),
            self.subject.to_string(),
            "--sessions".to_string(),
        ];
        parts.extend(self.sessions.iter().map(|s| s.to_string()));
        parts.push("--proj-dir".to_string());
        parts.push(self.proj_dir.display().to_string());
        parts.push("--work-dir".to_string());
        parts.push(self.work_dir.display().to_string());
        parts.push("--log-dir".to_string());
        parts.push(self.log_dir.display().to_string());
        parts.push("--fd-thresh".to_string());
        parts.push(self.fd_thresh.to_string());
        if self.ignore_fmaps {
            parts.push("--ignore-fmaps".to_string());
        }
        parts.push("--rsa-key".to_string());
        parts.push(self.rsa_key.display().to_string());
        if let Some(config) = &self.config {
            parts.push("--config".to_string());
            parts.push(config.display().to_string());
        }
        parts.join(" ")
    }
}

/// Render the `#SBATCH`-headed parent script.
pub fn render_parent_script(invocation: &ParentInvocation, resources: &JobResources) -> String {
    let short = invocation.subject.short();
    format!(
        "#!/bin/bash\n\n\
         #SBATCH --job-name=p{short}\n\
         #SBATCH --output={log}/par{short}.txt\n\
         #SBATCH --time={hours}:00:00\n\
         #SBATCH --cpus-per-task={cpus}\n\
         #SBATCH --mem-per-cpu={mem}G\n\n\
         {cmd}\n",
        short = short,
        log = invocation.log_dir.display(),
        hours = resources.hours,
        cpus = resources.cpus,
        mem = resources.mem_gb,
        cmd = invocation.command_line(),
    )
}

/// Write the parent script to `<log_dir>/run_funcprep_<subj>.sh` and return
/// its path.
pub fn write_parent_script(
    invocation: &ParentInvocation,
    resources: &JobResources,
) -> Result<PathBuf> {
    let script = render_parent_script(invocation, resources);
    let path = invocation
        .log_dir
        .join(format!("run_funcprep_{}.sh", invocation.subject));
    fs::write(&path, script)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> ParentInvocation {
        ParentInvocation {
            binary: PathBuf::from("/usr/local/bin/funcprep"),
            subject: Subject::new("sub-ER0009").unwrap(),
            sessions: vec![
                Session::new("ses-day2").unwrap(),
                Session::new("ses-day3").unwrap(),
            ],
            proj_dir: PathBuf::from("/hpc/group/proj"),
            work_dir: PathBuf::from("/work/user/proj/pre_processing"),
            log_dir: PathBuf::from("/work/logs"),
            fd_thresh: 0.5,
            ignore_fmaps: false,
            rsa_key: PathBuf::from("/home/user/.ssh/id_rsa"),
            config: None,
        }
    }

    #[test]
    fn test_command_line() {
        let cmd = invocation().command_line();
        assert!(cmd.starts_with("/usr/local/bin/funcprep --execute -s sub-ER0009"));
        assert!(cmd.contains("--sessions ses-day2 ses-day3"));
        assert!(cmd.contains("--proj-dir /hpc/group/proj"));
        assert!(cmd.contains("--log-dir /work/logs"));
        assert!(cmd.contains("--fd-thresh 0.5"));
        assert!(cmd.contains("--rsa-key /home/user/.ssh/id_rsa"));
        assert!(!cmd.contains("--ignore-fmaps"));
        assert!(!cmd.contains("--config"));
    }

    #[test]
    fn test_command_line_optional_flags() {
        let mut inv = invocation();
        inv.ignore_fmaps = true;
        inv.config = Some(PathBuf::from("/etc/funcprep.yml"));
        let cmd = inv.command_line();
        assert!(cmd.contains("--ignore-fmaps"));
        assert!(cmd.contains("--config /etc/funcprep.yml"));
    }

    #[test]
    fn test_render_script_header() {
        let resources = JobResources {
            hours: 60,
            cpus: 4,
            mem_gb: 6,
        };
        let script = render_parent_script(&invocation(), &resources);
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "#!/bin/bash");
        assert_eq!(lines[2], "#SBATCH --job-name=p0009");
        assert_eq!(lines[3], "#SBATCH --output=/work/logs/par0009.txt");
        assert_eq!(lines[4], "#SBATCH --time=60:00:00");
        assert_eq!(lines[5], "#SBATCH --cpus-per-task=4");
        assert_eq!(lines[6], "#SBATCH --mem-per-cpu=6G");
        assert!(lines[8].contains("--execute"));
        // Re-entry targets the same log dir the script and output live in
        assert!(lines[8].contains("--log-dir /work/logs"));
    }

    #[test]
    fn test_write_parent_script() {
        let dir = tempfile::tempdir().unwrap();
        let resources = JobResources::default();
        let mut inv = invocation();
        inv.log_dir = dir.path().to_path_buf();

        let path = write_parent_script(&inv, &resources).unwrap();
        assert_eq!(path, dir.path().join("run_funcprep_sub-ER0009.sh"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("#SBATCH --job-name=p0009"));
        assert!(content.contains(&format!("--log-dir {}", dir.path().display())));
        assert!(content.ends_with("\n"));
    }
}
