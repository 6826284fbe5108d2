//! HTTP server for the tool gateway.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | All registered tools with their input schemas |
//! | `POST` | `/tools/execute` | Run a [`ToolExecutionRequest`] |
//! | `POST` | `/tools/{name}` | Run a tool by name; the body is its arguments |
//! | `GET`  | `/health` | Liveness check with the crate version |
//! | `*`    | `/mcp` | MCP Streamable HTTP transport over the same tools |
//!
//! # Status codes
//!
//! Tool calls always answer with a [`ToolExecutionResult`] body. The status
//! is `200` on success and otherwise follows the error kind:
//!
//! | Kind | Status |
//! |------|--------|
//! | `UnknownTool`, `DocumentNotFound` | 404 |
//! | `InvalidArguments`, `UnsupportedFormat` | 400 |
//! | `EmbeddingUnavailable`, `EmbeddingRejected`, `RetrievalUnavailable` | 503 |
//! | anything else | 500 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use rag_harness_core::RagError;

use crate::config::Config;
use crate::mcp::McpBridge;
use crate::pipeline::Pipeline;
use crate::tools::{ToolDefinition, ToolExecutionRequest, ToolExecutionResult, ToolGateway};

/// Open the pipeline from `config` and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(config).await?);
    let gateway = Arc::new(ToolGateway::with_builtins(pipeline));

    for def in gateway.definitions() {
        info!(tool = %def.name, "registered tool");
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Build the router. Exposed for embedding and tests.
pub fn router(gateway: Arc<ToolGateway>) -> Router {
    let bridge = McpBridge::new(gateway.clone());
    let mcp = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/execute", post(handle_execute))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/health", get(handle_health))
        .nest_service("/mcp", mcp)
        .layer(cors)
        .with_state(gateway)
}

/// HTTP status for a failed tool call, keyed by error kind.
pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "UnknownTool" | "DocumentNotFound" => StatusCode::NOT_FOUND,
        "InvalidArguments" | "UnsupportedFormat" => StatusCode::BAD_REQUEST,
        "EmbeddingUnavailable" | "EmbeddingRejected" | "RetrievalUnavailable" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond(result: ToolExecutionResult) -> Response {
    let status = result.error_kind().map_or(StatusCode::OK, status_for_kind);
    (status, Json(result)).into_response()
}

/// Request bodies are parsed by hand so that malformed JSON still gets a
/// [`ToolExecutionResult`] rather than a plain-text rejection.
fn parse_body(tool_name: &str, body: &Bytes) -> Result<Value, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| {
        let err = RagError::invalid(format!("request body is not valid JSON: {}", e));
        respond(ToolExecutionResult::failure(tool_name, err))
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolDefinition>,
}

async fn handle_list_tools(State(gateway): State<Arc<ToolGateway>>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: gateway.definitions(),
    })
}

// ============ POST /tools/execute ============

async fn handle_execute(State(gateway): State<Arc<ToolGateway>>, body: Bytes) -> Response {
    let request = match parse_body("", &body) {
        Ok(value) => serde_json::from_value::<ToolExecutionRequest>(value),
        Err(rejection) => return rejection,
    };
    match request {
        Ok(request) => respond(gateway.execute(request).await),
        Err(e) => respond(ToolExecutionResult::failure(
            "",
            RagError::invalid(format!("malformed tool request: {}", e)),
        )),
    }
}

// ============ POST /tools/{name} ============

async fn handle_tool_call(
    State(gateway): State<Arc<ToolGateway>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    match parse_body(&name, &body) {
        Ok(arguments) => respond(
            gateway
                .execute(ToolExecutionRequest::new(name, arguments))
                .await,
        ),
        Err(rejection) => rejection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for_kind("UnknownTool"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_kind("DocumentNotFound"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_kind("InvalidArguments"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_kind("UnsupportedFormat"), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for_kind("EmbeddingUnavailable"),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for_kind("RetrievalUnavailable"),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for_kind("StorageUnavailable"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_blank_body_means_no_arguments() {
        assert_eq!(parse_body("t", &Bytes::from_static(b"  \n")).ok(), Some(Value::Null));
        assert!(parse_body("t", &Bytes::from_static(b"{nope")).is_err());
    }
}
