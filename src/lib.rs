//! Credential broker and tool proxy for sandboxed agents.
//!
//! Library crate behind the `credential-broker` binary; integration tests in
//! `tests/` drive it through these modules.

pub mod api;
pub mod auth;
pub mod cli;
pub mod cloud;
pub mod config;
pub mod errors;
pub mod integrations;
pub mod mcp;
pub mod state;
pub mod vault;

pub use state::AppState;
