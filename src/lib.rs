//! funcprep - functional MRI preprocessing for the EmoRep project
//!
//! Orchestrates fMRIPrep and the FSL/AFNI denoise chain per subject, staging
//! rawdata in from the archive host and derivatives back out. Off-local, each
//! subject becomes one scheduler parent job that re-invokes this binary.

pub mod bids;
pub mod cli;
pub mod config;
pub mod error;
pub mod joblog;
pub mod layout;
pub mod preprocess;
pub mod submit;
pub mod transfer;
pub mod workflows;

pub use error::{FuncPrepError, Result};
