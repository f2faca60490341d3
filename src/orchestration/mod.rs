//! Orchestration layer for the conductor engine.
//!
//! This module provides the components that move tasks through their
//! lifecycle: dependency resolution, scheduling, execution supervision
//! with retries, and agent health monitoring.

pub mod executor;
mod health;
mod resolver;
mod scheduler;
mod supervisor;

pub use executor::{AgentExecutor, ExecutionError, ExecutorSet, SimulatedExecutor, TaskDescriptor};
pub use health::HealthMonitor;
pub use resolver::DependencyResolver;
pub use scheduler::{PassSummary, Scheduler};
pub use supervisor::{ExecutionSupervisor, RetryPolicy};
