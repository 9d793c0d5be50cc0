//! Multi-agent coding workflow orchestrator.
//!
//! A task description is planned into role-assigned subtasks, the subtasks
//! are dispatched to coder/tester agents by a bounded scheduler, and the
//! produced files are reviewed and tested once at the end. Side-effecting
//! agent actions pass through an auto-accept gate.
//!
//! - **[`core`]**: Pure logic (context model, gate rules, readiness, model
//!   output parsing). No I/O.
//! - **[`io`]**: Side effects (config, model client, project storage,
//!   artifact cache, child processes).
//! - **[`agents`]**, **[`monitoring`]**, **[`workflow`]**: the role contract
//!   and agents, dashboard state, and the driver that ties them together.

pub mod agents;
pub mod core;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod monitoring;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod wiring;
pub mod workflow;
