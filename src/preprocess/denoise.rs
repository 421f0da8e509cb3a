//! Extra preprocessing after fMRIPrep: temporal filtering, masking,
//! scaling, and smoothing via FSL and AFNI.
//!
//! FSL binaries run from the environment; AFNI runs from singularity with
//! the run's output dir bound in. Every step is skipped when its output
//! already exists and verified to have produced it afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bids::EpiName;
use crate::config::{DenoiseConfig, JobResources};
use crate::error::{FuncPrepError, Result};
use crate::layout::glob_sorted;
use crate::submit::{JobRunner, JobSpec};

/// Temporal mean command.
fn cmd_tmean(epi: &Path, out: &Path) -> String {
    format!("fslmaths {} -Tmean {}", epi.display(), out.display())
}

/// Bandpass filter, re-adding the mean that -bptf removes.
fn cmd_bandpass(epi: &Path, tmean: &Path, bptf: u32, out: &Path) -> String {
    format!(
        "fslmaths {} -bptf {} -1 -add {} {}",
        epi.display(),
        bptf,
        tmean.display(),
        out.display()
    )
}

/// Scale timeseries by a precomputed factor.
fn cmd_scale(epi: &Path, factor: f64, out: &Path) -> String {
    format!("fslmaths {} -mul {} {}", epi.display(), factor, out.display())
}

/// Median voxel value within the mask.
fn cmd_median(epi: &Path, mask: &Path) -> String {
    format!("fslstats {} -k {} -p 50", epi.display(), mask.display())
}

/// Singularity call setup for AFNI commands.
fn afni_prefix(sing_afni: &Path, out_dir: &Path) -> String {
    format!(
        "singularity run --cleanenv --bind {dir}:{dir} --bind {dir}:/opt/home {img}",
        dir = out_dir.display(),
        img = sing_afni.display()
    )
}

/// Mask the EPI with 3dcalc; the mask is copied beside the EPI first so it
/// sits inside the container bind.
fn cmd_mask_epi(
    sing_afni: &Path,
    out_dir: &Path,
    epi: &Path,
    mask: &Path,
    work_mask: &Path,
    out: &Path,
) -> String {
    format!(
        "cp {mask} {work_mask} ; {prefix} 3dcalc -a {epi} -b {work_mask} -float -prefix {out} -expr 'a*step(b)'",
        mask = mask.display(),
        work_mask = work_mask.display(),
        prefix = afni_prefix(sing_afni, out_dir),
        epi = epi.display(),
        out = out.display()
    )
}

/// Spatial smoothing with 3dmerge.
fn cmd_smooth(sing_afni: &Path, out_dir: &Path, epi: &Path, fwhm: u32, out: &Path) -> String {
    format!(
        "{prefix} 3dmerge -1blur_fwhm {fwhm} -doall -prefix {out} {epi}",
        prefix = afni_prefix(sing_afni, out_dir),
        fwhm = fwhm,
        out = out.display(),
        epi = epi.display()
    )
}

/// Multiplier that brings the run's median voxel value to the target,
/// rounded to six decimal places.
pub fn scale_factor(target: u32, median: f64) -> f64 {
    let raw = f64::from(target) / median;
    (raw * 1e6).round() / 1e6
}

/// Drives the per-run FSL/AFNI steps.
pub struct Denoiser {
    runner: Arc<dyn JobRunner>,
    sing_afni: PathBuf,
    params: DenoiseConfig,
    resources: JobResources,
}

impl Denoiser {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        sing_afni: impl Into<PathBuf>,
        params: DenoiseConfig,
        resources: JobResources,
    ) -> Self {
        Self {
            runner,
            sing_afni: sing_afni.into(),
            params,
            resources,
        }
    }

    /// Run the full step chain for one EPI run, returning the smoothed file.
    ///
    /// tmean -> bandpass -> mask -> median -> scale -> smooth, resuming at
    /// whatever already exists in `out_dir`.
    pub async fn process_run(
        &self,
        run_epi: &Path,
        run_mask: &Path,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        fs::create_dir_all(out_dir)?;
        let name = EpiName::parse(run_epi)?;

        let smoothed = out_dir.join(name.with_desc("smoothed"));
        if smoothed.exists() {
            log::info!("Smoothed output exists for {}, skipping", name.run);
            return Ok(smoothed);
        }

        let scaled = out_dir.join(name.with_desc("scaled"));
        if !scaled.exists() {
            log::info!("Finding mean timeseries");
            let tmean = self
                .submit_check(
                    name.job_name("tmean"),
                    cmd_tmean(run_epi, &out_dir.join(name.with_desc("tmean"))),
                    out_dir.join(name.with_desc("tmean")),
                )
                .await?;

            log::info!("Bandpass filtering");
            let tfilt = self
                .submit_check(
                    name.job_name("band"),
                    cmd_bandpass(
                        run_epi,
                        &tmean,
                        self.params.bptf,
                        &out_dir.join(name.with_desc("tfilt")),
                    ),
                    out_dir.join(name.with_desc("tfilt")),
                )
                .await?;

            log::info!("Masking EPI");
            let work_mask = out_dir.join(
                run_mask
                    .file_name()
                    .ok_or_else(|| FuncPrepError::MissingPath(run_mask.to_path_buf()))?,
            );
            let masked = self
                .submit_check(
                    name.job_name("mask"),
                    cmd_mask_epi(
                        &self.sing_afni,
                        out_dir,
                        &tfilt,
                        run_mask,
                        &work_mask,
                        &out_dir.join(name.with_desc("tfiltMasked")),
                    ),
                    out_dir.join(name.with_desc("tfiltMasked")),
                )
                .await?;

            log::info!("Calculating median voxel value");
            let median = self.median(&name, &masked, run_mask).await?;

            log::info!("Scaling timeseries");
            self.submit_check(
                name.job_name("scale"),
                cmd_scale(&masked, scale_factor(self.params.scale_target, median), &scaled),
                scaled.clone(),
            )
            .await?;
        }

        log::info!("Smoothing EPI dataset");
        self.submit_check(
            name.job_name("smooth"),
            cmd_smooth(
                &self.sing_afni,
                out_dir,
                &scaled,
                self.params.smooth_fwhm,
                &smoothed,
            ),
            smoothed.clone(),
        )
        .await?;

        Ok(smoothed)
    }

    /// Median voxel value from fslstats.
    pub async fn median(&self, name: &EpiName, epi: &Path, mask: &Path) -> Result<f64> {
        let job = JobSpec::new(name.job_name("median"), cmd_median(epi, mask))
            .resources(self.resources);
        let output = self.runner.run(&job).await?;
        output
            .stdout
            .split_whitespace()
            .next()
            .and_then(|tok| tok.parse::<f64>().ok())
            .ok_or_else(|| FuncPrepError::ToolOutput {
                name: "fslstats".to_string(),
                stdout: output.stdout.clone(),
            })
    }

    /// Submit a shell command and require that it produced `out_path`.
    async fn submit_check(
        &self,
        job_name: String,
        command: String,
        out_path: PathBuf,
    ) -> Result<PathBuf> {
        if out_path.exists() {
            return Ok(out_path);
        }
        let step = job_name.clone();
        let job = JobSpec::new(job_name, command).resources(self.resources);
        self.runner.run(&job).await?;
        if !out_path.exists() {
            return Err(FuncPrepError::MissingOutput {
                name: step,
                path: out_path,
            });
        }
        Ok(out_path)
    }
}

/// Require one scaled file per preprocessed run and return them.
pub fn verify_scaled(work_fsl_subj: &Path, expected: usize) -> Result<Vec<PathBuf>> {
    let scaled = glob_sorted(&format!(
        "{}/**/*desc-scaled_bold.nii.gz",
        work_fsl_subj.display()
    ))?;
    if scaled.len() != expected {
        return Err(FuncPrepError::MissingOutput {
            name: "scale".to_string(),
            path: work_fsl_subj.to_path_buf(),
        });
    }
    Ok(scaled)
}

/// Delete denoise intermediates, keeping only scaled and smoothed output.
/// Returns the removed paths.
pub fn purge_intermediates(work_fsl_subj: &Path) -> Result<Vec<PathBuf>> {
    let mut candidates = glob_sorted(&format!(
        "{}/**/func/*.nii.gz",
        work_fsl_subj.display()
    ))?;
    candidates.extend(glob_sorted(&format!(
        "{}/**/func/tmp_*",
        work_fsl_subj.display()
    ))?);

    let mut removed = Vec::new();
    for path in candidates {
        let keep = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains("scaled") || n.contains("smoothed"))
            .unwrap_or(false);
        if !keep {
            fs::remove_file(&path)?;
            removed.push(path);
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joblog::JobLog;
    use crate::submit::LocalRunner;
    use tempfile::TempDir;

    const EPI: &str =
        "sub-ER0009_ses-day2_task-movies_run-01_space-MNI152NLin6Asym_res-2_desc-preproc_bold.nii.gz";
    const MASK: &str =
        "sub-ER0009_ses-day2_task-movies_run-01_space-MNI152NLin6Asym_res-2_desc-brain_mask.nii.gz";

    fn denoiser(dir: &TempDir) -> Denoiser {
        let manifest = Arc::new(JobLog::open(dir.path()).unwrap());
        let runner = Arc::new(LocalRunner::new(dir.path(), manifest));
        Denoiser::new(
            runner,
            "/opt/sing/afni.simg",
            DenoiseConfig::default(),
            JobResources::default(),
        )
    }

    #[test]
    fn test_cmd_tmean() {
        let cmd = cmd_tmean(Path::new("/d/epi.nii.gz"), Path::new("/d/tmean.nii.gz"));
        assert_eq!(cmd, "fslmaths /d/epi.nii.gz -Tmean /d/tmean.nii.gz");
    }

    #[test]
    fn test_cmd_bandpass() {
        let cmd = cmd_bandpass(
            Path::new("/d/epi.nii.gz"),
            Path::new("/d/tmean.nii.gz"),
            25,
            Path::new("/d/tfilt.nii.gz"),
        );
        assert_eq!(
            cmd,
            "fslmaths /d/epi.nii.gz -bptf 25 -1 -add /d/tmean.nii.gz /d/tfilt.nii.gz"
        );
    }

    #[test]
    fn test_cmd_mask_epi() {
        let cmd = cmd_mask_epi(
            Path::new("/opt/afni.simg"),
            Path::new("/d"),
            Path::new("/d/tfilt.nii.gz"),
            Path::new("/fp/mask.nii.gz"),
            Path::new("/d/mask.nii.gz"),
            Path::new("/d/masked.nii.gz"),
        );
        assert!(cmd.starts_with("cp /fp/mask.nii.gz /d/mask.nii.gz ; "));
        assert!(cmd.contains("singularity run --cleanenv --bind /d:/d --bind /d:/opt/home /opt/afni.simg"));
        assert!(cmd.contains("3dcalc -a /d/tfilt.nii.gz -b /d/mask.nii.gz -float"));
        assert!(cmd.ends_with("-prefix /d/masked.nii.gz -expr 'a*step(b)'"));
    }

    #[test]
    fn test_cmd_smooth() {
        let cmd = cmd_smooth(
            Path::new("/opt/afni.simg"),
            Path::new("/d"),
            Path::new("/d/scaled.nii.gz"),
            4,
            Path::new("/d/smoothed.nii.gz"),
        );
        assert!(cmd.contains("3dmerge -1blur_fwhm 4 -doall -prefix /d/smoothed.nii.gz /d/scaled.nii.gz"));
    }

    #[test]
    fn test_scale_factor() {
        assert_eq!(scale_factor(10000, 5000.0), 2.0);
        // Rounded to six places
        assert_eq!(scale_factor(10000, 3.0), 3333.333333);
    }

    #[tokio::test]
    async fn test_median_parses_fslstats_stdout() {
        let dir = TempDir::new().unwrap();
        let manifest = Arc::new(JobLog::open(dir.path()).unwrap());
        let runner = Arc::new(LocalRunner::new(dir.path(), manifest));
        // Stand in for fslstats with echo
        let den = Denoiser::new(
            runner.clone(),
            "/opt/afni.simg",
            DenoiseConfig::default(),
            JobResources::default(),
        );
        let name = EpiName::parse(EPI).unwrap();

        // median() shells out to fslstats, which is absent here; drive the
        // parse through the runner directly instead
        let job = JobSpec::new("median_echo", "echo '4890.5 '");
        let output = runner.run(&job).await.unwrap();
        let value: f64 = output.stdout.split_whitespace().next().unwrap().parse().unwrap();
        assert_eq!(value, 4890.5);

        // And the error path: empty stdout cannot parse
        let err = den
            .median(&name, Path::new("/missing.nii.gz"), Path::new("/m.nii.gz"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FuncPrepError::ToolOutput { .. } | FuncPrepError::JobFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_process_run_skips_when_smoothed_exists() {
        let dir = TempDir::new().unwrap();
        let den = denoiser(&dir);
        let out_dir = dir.path().join("func");
        fs::create_dir_all(&out_dir).unwrap();

        let name = EpiName::parse(EPI).unwrap();
        let smoothed = out_dir.join(name.with_desc("smoothed"));
        fs::write(&smoothed, b"").unwrap();

        let result = den
            .process_run(Path::new(EPI), Path::new(MASK), &out_dir)
            .await
            .unwrap();
        assert_eq!(result, smoothed);
    }

    #[tokio::test]
    async fn test_submit_check_missing_output_is_error() {
        let dir = TempDir::new().unwrap();
        let den = denoiser(&dir);

        let err = den
            .submit_check(
                "noop".to_string(),
                "true".to_string(),
                dir.path().join("never_written.nii.gz"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FuncPrepError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn test_submit_check_skips_existing_output() {
        let dir = TempDir::new().unwrap();
        let den = denoiser(&dir);
        let out = dir.path().join("existing.nii.gz");
        fs::write(&out, b"").unwrap();

        // Command would fail if run; the existing output short-circuits it
        let path = den
            .submit_check("skip".to_string(), "exit 1".to_string(), out.clone())
            .await
            .unwrap();
        assert_eq!(path, out);
    }

    #[test]
    fn test_verify_scaled() {
        let dir = TempDir::new().unwrap();
        let func = dir.path().join("ses-day2").join("func");
        fs::create_dir_all(&func).unwrap();
        let name = EpiName::parse(EPI).unwrap();
        fs::write(func.join(name.with_desc("scaled")), b"").unwrap();

        assert_eq!(verify_scaled(dir.path(), 1).unwrap().len(), 1);
        assert!(verify_scaled(dir.path(), 2).is_err());
    }

    #[test]
    fn test_purge_intermediates_keeps_finals() {
        let dir = TempDir::new().unwrap();
        let func = dir.path().join("ses-day2").join("func");
        fs::create_dir_all(&func).unwrap();
        let name = EpiName::parse(EPI).unwrap();

        let keep_scaled = func.join(name.with_desc("scaled"));
        let keep_smoothed = func.join(name.with_desc("smoothed"));
        let drop_tmean = func.join(name.with_desc("tmean"));
        let drop_tmp = func.join("tmp_movies_r1_median.txt");
        for f in [&keep_scaled, &keep_smoothed, &drop_tmean] {
            fs::write(f, b"").unwrap();
        }
        fs::write(&drop_tmp, b"").unwrap();

        let removed = purge_intermediates(dir.path()).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(keep_scaled.exists());
        assert!(keep_smoothed.exists());
        assert!(!drop_tmean.exists());
        assert!(!drop_tmp.exists());
    }
}
