//! sandboxd: resource-aware sandbox orchestration.
//!
//! - [`resources`]: the machine-wide capacity ledger
//! - [`sandbox`]: per-sandbox lifecycle state machine
//! - [`executor`]: action batches against running sandboxes
//! - [`orchestrator`]: create/start/stop and control queries
//! - [`group`]: named sandbox collections sharing a template
//! - [`gateway`]: API keys and the authenticated reverse proxy

pub mod api;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod group;
pub mod orchestrator;
pub mod resources;
pub mod sandbox;
pub mod server;
pub mod tools;

pub use error::{Error, Result};
