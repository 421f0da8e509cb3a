//! CLI argument definitions using clap.
//!
//! One flat command: select subjects and sessions, point at the project and
//! work trees, and submit one parent job per subject. `--run-local` executes
//! everything in-process instead of wrapping jobs in sbatch.

use clap::Parser;
use std::path::PathBuf;

/// funcprep - fMRIPrep-based functional preprocessing for EmoRep
///
/// Stages rawdata from the archive host, runs fMRIPrep per session, applies
/// FSL/AFNI temporal filtering, masking, scaling, and smoothing to each EPI
/// run, then copies derivatives back to the archive.
#[derive(Parser, Debug)]
#[command(name = "funcprep")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Subjects to preprocess, e.g. sub-ER0009
    #[arg(short, long, num_args = 1.., required = true)]
    pub subjects: Vec<String>,

    /// Sessions to preprocess; defaults to the configured session list
    #[arg(long, num_args = 1..)]
    pub sessions: Vec<String>,

    /// Framewise displacement threshold for fMRIPrep spike regressors
    #[arg(long, default_value_t = 0.5)]
    pub fd_thresh: f64,

    /// Add fieldmaps to the fMRIPrep --ignore list
    #[arg(long)]
    pub ignore_fmaps: bool,

    /// BIDS project directory; overrides the configured default
    #[arg(long)]
    pub proj_dir: Option<PathBuf>,

    /// Work directory for intermediates; required with --run-local,
    /// otherwise defaults to /work/<user>/<project>/pre_processing
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// RSA key for ssh/rsync against the archive host; required unless
    /// --run-local
    #[arg(long)]
    pub rsa_key: Option<PathBuf>,

    /// Run everything on this host without sbatch or remote staging
    #[arg(long)]
    pub run_local: bool,

    /// Run the workflow inline instead of submitting parent jobs. Set by the
    /// generated parent scripts; not for interactive use.
    #[arg(long, hide = true)]
    pub execute: bool,

    /// Log dir created by the submitting process, reused under --execute so
    /// the whole run shares one dir. Set by the generated parent scripts.
    #[arg(long, hide = true)]
    pub log_dir: Option<PathBuf>,
}
