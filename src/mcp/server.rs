//! MCP Server setup using `rmcp` with stdio transport.
use crate::mcp::tools::AppTools;
use crate::state::AppState;
use anyhow::{Context, Result};
use rmcp::{ServiceExt, handler::server::router::Router, transport::io::stdio};
use tracing::info;

/// MCP Server wrapping the shared services and serving via stdio.
#[derive(Clone)]
pub struct McpServer {
    pub state: AppState,
}

impl McpServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Start the MCP server on stdio transport (blocks until the client disconnects).
    pub async fn start(self) -> Result<()> {
        info!("Starting MCP server on stdio...");
        let (stdin, stdout) = stdio();

        let app_tools = AppTools::new(self.state);
        let router = Router::new(app_tools.clone()).with_tools(app_tools.tool_router.clone());

        let service = router
            .serve((stdin, stdout))
            .await
            .context("MCP Server failed to start on stdio transport")?;
        service
            .waiting()
            .await
            .context("MCP Server encountered an error during stdio transport")?;

        Ok(())
    }
}
