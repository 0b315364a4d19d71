//! Cairn core: catalog adapter, planner, SSH executor, and run coordinator.
//!
//! This crate exposes the orchestration logic as a library so it can be
//! driven by the `cairn-agent` binary and exercised directly in tests
//! without going through a process boundary.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod logging;
pub mod naming;
pub mod planner;

pub use catalog::{load_snapshot, Catalog, MongoCatalog};
pub use config::AgentConfig;
pub use coordinator::{RunCoordinator, RunSummary};
pub use executor::{Executor, SshSession};
