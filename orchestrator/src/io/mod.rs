//! Side-effecting adapters: configuration, model client, project storage,
//! artifact cache and child processes.

pub mod cache;
pub mod config;
pub mod model;
pub mod process;
pub mod storage;
