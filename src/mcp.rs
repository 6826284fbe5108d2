//! MCP JSON-RPC protocol bridge.
//!
//! Exposes the [`ToolGateway`]'s registry as MCP tools over the Streamable
//! HTTP transport mounted at `/mcp`. Calls go through
//! [`ToolGateway::execute`], so validation, logging and error kinds match
//! the plain HTTP endpoints.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};

use crate::tools::{ToolExecutionRequest, ToolGateway};

/// Each MCP session gets a clone; all of them share one gateway.
#[derive(Clone)]
pub struct McpBridge {
    gateway: Arc<ToolGateway>,
}

impl McpBridge {
    pub fn new(gateway: Arc<ToolGateway>) -> Self {
        Self { gateway }
    }

    fn to_mcp_tool(tool: &dyn crate::tools::Tool) -> Tool {
        let input_schema = match tool.input_schema() {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(tool.read_only())),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "rag-harness".to_string(),
                title: Some("RAG Harness".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "RAG Harness: document ingestion and retrieval. Use search to find relevant \
                 chunks, ingest_document to add a document, and list_documents, \
                 get_document_info and delete_document to manage the corpus."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .gateway
            .registry()
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.gateway.registry().find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if self.gateway.registry().find(&request.name).is_none() {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            ));
        }

        let arguments = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Null);

        let result = self
            .gateway
            .execute(ToolExecutionRequest::new(request.name.to_string(), arguments))
            .await;

        if result.success {
            let text = serde_json::to_string_pretty(&result.result).unwrap_or_default();
            Ok(CallToolResult::success(vec![Content::text(text)]))
        } else {
            let text = result.error.unwrap_or_default();
            Ok(CallToolResult::error(vec![Content::text(text)]))
        }
    }
}
