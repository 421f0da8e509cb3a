//! Error types for funcprep
//!
//! Centralized error handling using thiserror.

use std::path::PathBuf;
use thiserror::Error;

/// All error types that can occur in funcprep
#[derive(Debug, Error)]
pub enum FuncPrepError {
    /// Required environment variable is unset
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    /// A path that must exist does not
    #[error("Expected to find directory or file: {}", .0.display())]
    MissingPath(PathBuf),

    /// An external tool exited nonzero
    #[error("Job '{name}' failed with exit code {code:?}: {stderr}")]
    JobFailed {
        name: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Tool ran but did not produce the expected output file
    #[error("Job '{name}' produced no output at {}", .path.display())]
    MissingOutput { name: String, path: PathBuf },

    /// Remote file transfer failed or returned nothing
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Preprocessed BOLD and mask run counts disagree
    #[error("Mismatched run counts: {preproc} preprocessed vs {masks} masks")]
    RunMismatch { preproc: usize, masks: usize },

    /// BIDS name does not follow sub_ses_task_run_space_res_desc_suffix
    #[error("Unparseable BIDS name: {0}")]
    BidsName(String),

    /// Could not interpret tool stdout (e.g. fslstats median)
    #[error("Unparseable tool output from '{name}': {stdout}")]
    ToolOutput { name: String, stdout: String },

    /// Malformed glob pattern
    #[error("Glob pattern error: {0}")]
    Pattern(#[from] glob::PatternError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("Config error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for funcprep operations
pub type Result<T> = std::result::Result<T, FuncPrepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_env_error() {
        let err = FuncPrepError::MissingEnv("SING_AFNI".to_string());
        assert_eq!(
            err.to_string(),
            "Missing required environment variable: SING_AFNI"
        );
    }

    #[test]
    fn test_missing_path_error() {
        let err = FuncPrepError::MissingPath(PathBuf::from("/work/foo"));
        assert_eq!(err.to_string(), "Expected to find directory or file: /work/foo");
    }

    #[test]
    fn test_job_failed_error() {
        let err = FuncPrepError::JobFailed {
            name: "ER0009_fmriprep".to_string(),
            code: Some(1),
            stderr: "out of memory".to_string(),
        };
        assert!(err.to_string().contains("ER0009_fmriprep"));
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn test_missing_output_error() {
        let err = FuncPrepError::MissingOutput {
            name: "tmean".to_string(),
            path: PathBuf::from("/work/sub-A_desc-tmean_bold.nii.gz"),
        };
        assert!(err.to_string().contains("tmean"));
        assert!(err.to_string().contains("desc-tmean_bold"));
    }

    #[test]
    fn test_transfer_error() {
        let err = FuncPrepError::Transfer("no NIfTI files for ses-day2".to_string());
        assert_eq!(err.to_string(), "Transfer error: no NIfTI files for ses-day2");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FuncPrepError = io_err.into();
        assert!(matches!(err, FuncPrepError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(FuncPrepError::BidsName("foo.nii.gz".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
