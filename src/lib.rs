//! carapace node host library
//!
//! Connects a machine to a carapace gateway as a node: newline-delimited JSON
//! frames over TCP (optionally TLS with certificate pinning), pairing and
//! heartbeat handling, and a policy-gated `system.run` pipeline backed by a
//! local approvals file.

pub mod cli;
pub mod config;
pub mod exec;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod skills;
pub mod tls;
