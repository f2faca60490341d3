//! Workflow management for the conductor engine.
//!
//! A workflow is a named group of tasks submitted together, either as a
//! sequential chain or as a parallel fan-out. Its status is derived from
//! the statuses of its members.

mod composer;
mod types;

pub use composer::WorkflowComposer;
pub use types::{Workflow, WorkflowId, WorkflowMode, WorkflowStatus, WorkflowView};
