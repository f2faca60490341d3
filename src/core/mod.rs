//! Core domain models for the orchestration engine.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: task records and the dependency graph.

pub mod dag;
pub mod task;

pub use dag::DependencyGraph;
pub use task::{
    Attempt, AttemptOutcome, ErrorKind, Priority, Task, TaskError, TaskFilter, TaskId, TaskSpec,
    TaskStatus, TaskType,
};
