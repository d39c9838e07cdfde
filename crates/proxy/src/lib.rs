//! A local proxy that lets stdio-only MCP clients talk to Databricks-hosted
//! MCP servers.
//!
//! The client speaks line-delimited JSON-RPC on stdin/stdout; the remote
//! server speaks streamable HTTP (POST for requests, an SSE GET stream for
//! server-to-client traffic) behind OAuth. The proxy forwards frames in
//! order, correlates responses by id, keeps the bearer token fresh, and
//! replays the MCP handshake when the server expires the session.
//!
//! stdout carries protocol frames exclusively; all diagnostics go to stderr.

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod orchestrator;
pub mod session;
pub mod transport;

pub use config::{Cli, CredentialMode, ProxyConfig};
pub use orchestrator::{run, run_with_io, ExitReason};
