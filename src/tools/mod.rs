pub mod add_memory;
pub mod list_devices;
pub mod search_memory;

use add_memory::AddMemoryParams;
use list_devices::ListDevicesParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use search_memory::SearchMemoryParams;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::gateway::{BoundSession, Gateway, ToolCall, ToolOutput};

/// MCP tool handler for one authenticated stdio session. Every tool goes through
/// [`Gateway::call`], so quota, timeouts and metering match the WebSocket transport.
#[derive(Clone)]
pub struct GatewayTools {
    tool_router: ToolRouter<Self>,
    gateway: Gateway,
    session: Arc<BoundSession>,
}

fn render(result: Result<ToolOutput, GatewayError>) -> Result<String, String> {
    match result {
        Ok(output) => {
            serde_json::to_string(&output).map_err(|e| format!("serialization failed: {e}"))
        }
        Err(e) => {
            tracing::info!(code = e.code(), error = %e, "tool call rejected");
            Err(serde_json::json!({
                "code": e.code(),
                "message": e.user_message(),
                "retryable": e.is_retryable(),
                "resets_at": e.resets_at(),
            })
            .to_string())
        }
    }
}

#[tool_router]
impl GatewayTools {
    pub fn new(gateway: Gateway, session: Arc<BoundSession>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            gateway,
            session,
        }
    }

    /// Store a memory in the session's application.
    #[tool(description = "Remember a piece of text. Optional metadata must be a JSON object.")]
    async fn add_memory(
        &self,
        Parameters(params): Parameters<AddMemoryParams>,
    ) -> Result<String, String> {
        tracing::info!(text_len = params.text.len(), "add_memory called");
        render(
            self.gateway
                .call(&self.session, ToolCall::AddMemory(params))
                .await,
        )
    }

    /// Search the account's memories.
    #[tool(description = "Search your memories by natural language query. Returns the best matches with scores.")]
    async fn search_memory(
        &self,
        Parameters(params): Parameters<SearchMemoryParams>,
    ) -> Result<String, String> {
        tracing::info!(query = %params.query, "search_memory called");
        render(
            self.gateway
                .call(&self.session, ToolCall::SearchMemory(params))
                .await,
        )
    }

    /// List devices bound to the account.
    #[tool(description = "List the devices bound to your account.")]
    async fn list_devices(
        &self,
        Parameters(params): Parameters<ListDevicesParams>,
    ) -> Result<String, String> {
        render(
            self.gateway
                .call(&self.session, ToolCall::ListDevices(params))
                .await,
        )
    }
}

#[tool_handler]
impl ServerHandler for GatewayTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "memgate stores and searches memories for your account. Use add_memory to \
                 remember something, search_memory to recall it, and list_devices to see \
                 which devices are bound to you."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
