//! Shared domain types for the skein agent-run runtime.
//!
//! Everything that crosses a crate boundary lives here: thread messages,
//! agent runs, the event vocabulary of the resumable run log, tool calls
//! and schemas, MCP server configuration, LLM chunk/stream types, the
//! shared error type, and environment configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod mcp;
pub mod message;
pub mod run;
pub mod store;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
