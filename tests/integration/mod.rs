//! Integration test suite for conductor.
//!
//! These tests drive a full `Engine` (registries, scheduler loop, execution
//! supervisor) with in-process executors. Nothing leaves the process.
//!
//! # Test Categories
//!
//! - `scenarios`: the reference dependency, capacity, retry, workflow and FIFO scenarios
//! - `properties`: invariants checked under concurrent load
//! - `workflow_e2e`: workflow composition, failure policies and cancellation
//! - `recovery`: snapshot/restore, heartbeats, timeouts and agent loss

mod fixtures;

mod properties;
mod recovery;
mod workflow_e2e;
