use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::FuncPrepError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub project: ProjectConfig,
    pub remote: RemoteConfig,
    pub slurm: SlurmConfig,
    pub denoise: DenoiseConfig,
    pub sessions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// BIDS project directory on the group partition
    pub proj_dir: PathBuf,
    /// Root of the scratch partition; work dirs default under
    /// `<work_root>/<user>/<name>/pre_processing`
    pub work_root: PathBuf,
    /// Project name used when deriving the default work dir
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            proj_dir: PathBuf::from(
                "/hpc/group/labarlab/EmoRep/Exp2_Compute_Emotion/data_scanner_BIDS",
            ),
            work_root: PathBuf::from("/work"),
            name: "EmoRep".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Archive host holding rawdata and receiving derivatives
    pub host: String,
    /// Project directory on the archive host
    pub proj_path: PathBuf,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "ccn-labarserv2.vm.duke.edu".to_string(),
            proj_path: PathBuf::from(
                "/mnt/keoki/experiments2/EmoRep/Exp2_Compute_Emotion/data_scanner_BIDS",
            ),
        }
    }
}

/// Scheduler resource request for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobResources {
    pub hours: u32,
    pub cpus: u32,
    pub mem_gb: u32,
}

impl Default for JobResources {
    fn default() -> Self {
        Self {
            hours: 1,
            cpus: 1,
            mem_gb: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    /// Per-subject parent job that drives the whole workflow
    pub parent: JobResources,
    /// fMRIPrep container job
    pub fmriprep: JobResources,
    /// FSL/AFNI denoise steps
    pub denoise: JobResources,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            parent: JobResources {
                hours: 60,
                cpus: 4,
                mem_gb: 6,
            },
            fmriprep: JobResources {
                hours: 40,
                cpus: 10,
                mem_gb: 12,
            },
            denoise: JobResources {
                hours: 1,
                cpus: 1,
                mem_gb: 6,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseConfig {
    /// fslmaths -bptf highpass sigma (volumes)
    pub bptf: u32,
    /// 3dmerge blur kernel (mm FWHM)
    pub smooth_fwhm: u32,
    /// Timeseries are scaled to this grand median
    pub scale_target: u32,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            bptf: 25,
            smooth_fwhm: 4,
            scale_target: 10000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            project: ProjectConfig::default(),
            remote: RemoteConfig::default(),
            slurm: SlurmConfig::default(),
            denoise: DenoiseConfig::default(),
            sessions: vec!["ses-day2".to_string(), "ses-day3".to_string()],
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir
                .join(project_name)
                .join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!(
                            "Failed to load config from {}: {}",
                            primary_config.display(),
                            e
                        );
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Paths resolved from the environment at startup.
///
/// Container images and licenses are named through environment variables,
/// matching how the cluster modules export them.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// AFNI singularity image (SING_AFNI)
    pub sing_afni: PathBuf,
    /// fMRIPrep singularity image (SING_FMRIPREP)
    pub sing_fmriprep: PathBuf,
    /// FreeSurfer license file (FS_LICENSE)
    pub fs_license: PathBuf,
    /// Templateflow clone for fMRIPrep (SINGULARITYENV_TEMPLATEFLOW_HOME)
    pub tplflow_dir: PathBuf,
    /// Cluster user name (USER); only required off-local
    pub user: Option<String>,
}

impl EnvConfig {
    /// Resolve required environment variables, erroring on the first missing one.
    ///
    /// FSLDIR is checked for presence only; the FSL binaries themselves are
    /// found through PATH.
    pub fn resolve(run_local: bool) -> crate::error::Result<Self> {
        let required = |key: &str| -> crate::error::Result<PathBuf> {
            env::var(key)
                .map(PathBuf::from)
                .map_err(|_| FuncPrepError::MissingEnv(key.to_string()))
        };

        let sing_afni = required("SING_AFNI")?;
        let sing_fmriprep = required("SING_FMRIPREP")?;
        let fs_license = required("FS_LICENSE")?;
        let tplflow_dir = required("SINGULARITYENV_TEMPLATEFLOW_HOME")?;

        if env::var("FSLDIR").is_err() {
            return Err(FuncPrepError::MissingEnv("FSLDIR".to_string()));
        }

        let user = match env::var("USER") {
            Ok(name) => Some(name),
            Err(_) if run_local => None,
            Err(_) => return Err(FuncPrepError::MissingEnv("USER".to_string())),
        };

        Ok(Self {
            sing_afni,
            sing_fmriprep,
            fs_license,
            tplflow_dir,
            user,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.sessions, vec!["ses-day2", "ses-day3"]);
        assert_eq!(config.denoise.bptf, 25);
        assert_eq!(config.denoise.smooth_fwhm, 4);
        assert_eq!(config.denoise.scale_target, 10000);
        assert_eq!(config.slurm.fmriprep.hours, 40);
        assert_eq!(config.slurm.fmriprep.cpus, 10);
        assert_eq!(config.slurm.parent.hours, 60);
    }

    #[test]
    fn test_config_partial_yaml() {
        let yaml = r#"
sessions:
  - ses-day2
denoise:
  smooth_fwhm: 6
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sessions, vec!["ses-day2"]);
        assert_eq!(config.denoise.smooth_fwhm, 6);
        // Untouched sections keep defaults
        assert_eq!(config.denoise.bptf, 25);
        assert_eq!(config.slurm.fmriprep.mem_gb, 12);
    }

    #[test]
    fn test_config_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("funcprep.yml");
        std::fs::write(&path, "sessions: [ses-day3]\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.sessions, vec!["ses-day3"]);
    }

    #[test]
    fn test_config_load_missing_explicit_file_errors() {
        let path = PathBuf::from("/nonexistent/funcprep.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_job_resources_default() {
        let res = JobResources::default();
        assert_eq!(res.hours, 1);
        assert_eq!(res.cpus, 1);
        assert_eq!(res.mem_gb, 4);
    }
}
