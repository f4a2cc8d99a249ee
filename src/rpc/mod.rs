//! Bidirectional JSON-RPC over line-delimited stdio.
//!
//! This module implements the wire layer shared by the upstream client
//! connection and every downstream agent connection:
//!
//! - [`framing`]: one-message-per-line framing with a 1 MiB cap.
//! - [`types`]: the JSON-RPC envelope, error object, and response builders.
//! - [`conn`]: the full-duplex connection with request/response correlation,
//!   notifications, and server-initiated calls.

pub mod conn;
pub mod framing;
pub mod types;
