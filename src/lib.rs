//! Conductor: a dependency-aware task orchestration engine.
//!
//! Tasks form a DAG and are matched to heterogeneous agents by capability,
//! load and a running performance score. [`Engine`] is the entry point; it
//! owns the registries, the scheduler loop and the execution supervisor.

pub mod agent;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod log;
pub mod metrics;
pub mod orchestration;
pub mod plan;
pub mod registry;
pub mod state;
pub mod util;
pub mod workflow;

pub use agent::{Agent, AgentDescriptor, AgentId, AgentRole, AgentStatus};
pub use config::{CascadePolicy, EngineConfig, WorkflowFailurePolicy};
pub use crate::core::{
    ErrorKind, Priority, Task, TaskError, TaskFilter, TaskId, TaskSpec, TaskStatus, TaskType,
};
pub use engine::Engine;
pub use error::{Error, Result};
pub use events::{EngineEvent, EventKind};
pub use metrics::EngineMetrics;
pub use orchestration::{AgentExecutor, ExecutionError, SimulatedExecutor, TaskDescriptor};
pub use workflow::{WorkflowId, WorkflowMode, WorkflowStatus, WorkflowView};
