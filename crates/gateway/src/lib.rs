//! Blackbox gateway: exposes a small tool surface to one caller and fans calls out to
//! configured MCP backends.

pub mod backend;
pub mod callback;
pub mod chain;
pub mod config;
pub mod connections;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod registry;
pub mod rmcp_backend;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{GatewayError, Result};
pub use gateway::Gateway;
