//! MCP stdio surface over the shared pipelines.
pub mod server;
pub mod tools;

pub use server::McpServer;
