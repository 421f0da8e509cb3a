//! External-tool invocations: fMRIPrep from singularity, FSL/AFNI denoise
//! steps after it.

pub mod denoise;
pub mod fmriprep;

pub use denoise::Denoiser;
pub use fmriprep::{collect_outputs, FmriprepJob, FmriprepOutputs};
