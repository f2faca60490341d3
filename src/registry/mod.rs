//! Record stores for tasks and agents.
//!
//! Both registries lock per record. Task status only changes through
//! `TaskRegistry::compare_and_set_status`; agent load only changes through
//! `AgentRegistry::try_acquire` and `AgentRegistry::release`.

pub mod agents;
pub mod tasks;

pub use agents::AgentRegistry;
pub use tasks::TaskRegistry;
