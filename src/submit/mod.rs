//! Subprocess and scheduler submission.
//!
//! [`runner`] is the execution seam shared by every pipeline step;
//! [`script`] generates the per-subject parent jobs submitted off-local.

pub mod runner;
pub mod script;

pub use runner::{JobOutput, JobRunner, JobSpec, LocalRunner, SlurmRunner};
pub use script::{ParentInvocation, write_parent_script};
