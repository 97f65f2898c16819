//! Generate, execute, review and retry LLM-produced programs inside a sandbox.
//!
//! A submitted [`TaskSpec`](state_machine::TaskSpec) becomes a job. The
//! [`JobCoordinator`](coordinator::JobCoordinator) admits it, then a
//! [`RetryController`](controller::RetryController) drives the loop until a
//! candidate passes review, the attempt ceiling is reached, or the platform
//! gives up. Every attempt is persisted by a [`JobStore`](store::JobStore).

pub mod admission;
pub mod agent;
pub mod anthropic;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod language;
pub mod logging;
pub mod sandbox;
pub mod state_machine;
pub mod store;
pub mod task_file;

#[cfg(test)]
mod testing;
