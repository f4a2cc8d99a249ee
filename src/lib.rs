#![forbid(unsafe_code)]

//! `acp-broker`: a local agent coding protocol broker.
//!
//! Mediates line-delimited JSON-RPC between an upstream client and a
//! per-session downstream coding-agent process, serving the agent's
//! workspace callbacks (bounded file I/O, allowlisted command execution,
//! permission prompts) confined to a single workspace root.

pub mod broker;
pub mod config;
pub mod errors;
pub mod fsops;
pub mod rpc;
pub mod terminal;
pub mod workspace;

pub use config::Config;
pub use errors::{AppError, Result};
