//! Tool gateway: a registry of schema-described tools and the dispatcher
//! that turns every invocation into a [`ToolExecutionResult`].
//!
//! # Architecture
//!
//! ```text
//! ToolExecutionRequest { toolName, arguments }
//!          │
//!          ▼
//!   registry lookup ──▶ validate_args ──▶ Tool::execute(args, pipeline)
//!          │                  │                     │
//!          ▼                  ▼                     ▼
//! ToolExecutionResult { success, result, error?, metadata, timestamp }
//! ```
//!
//! The gateway never returns an `Err`: unknown tools, invalid arguments and
//! handler failures all come back as `success = false` with the error kind
//! in `metadata.errorKind`. The HTTP and MCP surfaces share one gateway.

mod builtin;

pub use builtin::{
    DeleteDocumentTool, GetDocumentInfoTool, IngestDocumentTool, ListDocumentsTool, SearchTool,
};

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use rag_harness_core::{RagError, Result};

use crate::config::RetrievalConfig;
use crate::pipeline::Pipeline;

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A callable tool exposed through the gateway.
///
/// Arguments reaching [`execute`](Tool::execute) have already been
/// validated against [`input_schema`](Tool::input_schema), with defaults
/// filled in.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique, lowercase identifier with underscores. Also the route
    /// segment of `POST /tools/{name}`.
    fn name(&self) -> &str;

    /// One-line description for agent discovery.
    fn description(&self) -> &str;

    /// JSON Schema (`type: object`) for the arguments.
    fn input_schema(&self) -> Value;

    /// Whether the tool leaves the index unchanged. Advertised to MCP
    /// clients as a tool annotation.
    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, pipeline: &Pipeline) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionRequest {
    #[serde(alias = "name")]
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolExecutionRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        ToolExecutionRequest {
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub success: bool,
    pub result: Value,
    /// `"<Kind>: <message>"` on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_name: String,
    pub metadata: Value,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl ToolExecutionResult {
    fn from_outcome(tool_name: &str, outcome: Result<Value>, duration_ms: u64) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        match outcome {
            Ok(result) => ToolExecutionResult {
                success: true,
                result,
                error: None,
                tool_name: tool_name.to_string(),
                metadata: json!({ "durationMs": duration_ms }),
                timestamp,
            },
            Err(e) => {
                let message = error_message(&e);
                ToolExecutionResult {
                    success: false,
                    result: Value::Null,
                    error: Some(format!("{}: {}", e.kind(), message)),
                    tool_name: tool_name.to_string(),
                    metadata: json!({
                        "errorKind": e.kind(),
                        "message": message,
                        "durationMs": duration_ms,
                    }),
                    timestamp,
                }
            }
        }
    }

    /// A failed result for an error raised outside any tool.
    pub fn failure(tool_name: &str, error: RagError) -> Self {
        Self::from_outcome(tool_name, Err(error), 0)
    }

    /// The error kind of a failed execution.
    pub fn error_kind(&self) -> Option<&str> {
        self.metadata.get("errorKind").and_then(Value::as_str)
    }
}

/// The detail part of an error, without the kind prefix `Display` adds.
fn error_message(e: &RagError) -> String {
    match e {
        RagError::UnsupportedFormat(m)
        | RagError::EmbeddingRejected(m)
        | RagError::RetrievalUnavailable(m)
        | RagError::UnknownTool(m)
        | RagError::InvalidArguments(m)
        | RagError::StorageUnavailable(m)
        | RagError::DocumentNotFound(m)
        | RagError::DuplicateTool(m)
        | RagError::Cancelled(m) => m.clone(),
        RagError::PartialExtraction { reason, .. } => reason.clone(),
        RagError::EmbeddingUnavailable { .. } => e.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Name-unique collection of tools, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the five built-in tools. `search` takes its
    /// `topK` default and maximum from `retrieval`.
    pub fn with_builtins(retrieval: &RetrievalConfig) -> Self {
        ToolRegistry {
            tools: vec![
                Box::new(SearchTool::new(retrieval)),
                Box::new(IngestDocumentTool),
                Box::new(ListDocumentsTool),
                Box::new(GetDocumentInfoTool),
                Box::new(DeleteDocumentTool),
            ],
        }
    }

    /// Add a tool. Names are unique; a second tool with a taken name is
    /// rejected with `DuplicateTool`.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<()> {
        if self.find(tool.name()).is_some() {
            return Err(RagError::DuplicateTool(tool.name().to_string()));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Gateway
// ═══════════════════════════════════════════════════════════════════════

pub struct ToolGateway {
    registry: ToolRegistry,
    pipeline: Arc<Pipeline>,
}

impl ToolGateway {
    pub fn new(registry: ToolRegistry, pipeline: Arc<Pipeline>) -> Self {
        Self { registry, pipeline }
    }

    pub fn with_builtins(pipeline: Arc<Pipeline>) -> Self {
        let registry = ToolRegistry::with_builtins(pipeline.retriever.settings());
        Self::new(registry, pipeline)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Look up, validate and run a tool. Every outcome, including an
    /// unknown tool name, is reported in the returned result.
    pub async fn execute(&self, request: ToolExecutionRequest) -> ToolExecutionResult {
        let started = Instant::now();
        let outcome = self.call(&request.tool_name, request.arguments).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => info!(tool = %request.tool_name, duration_ms, "tool executed"),
            Err(e) => warn!(
                tool = %request.tool_name,
                kind = e.kind(),
                error = %e,
                duration_ms,
                "tool failed"
            ),
        }
        ToolExecutionResult::from_outcome(&request.tool_name, outcome, duration_ms)
    }

    /// Like [`execute`](Self::execute) but returns the raw outcome.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value> {
        let tool = self
            .registry
            .find(name)
            .ok_or_else(|| RagError::UnknownTool(name.to_string()))?;
        let args = validate_args(&tool.input_schema(), &arguments)?;
        tool.execute(args, &self.pipeline).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Argument validation
// ═══════════════════════════════════════════════════════════════════════

/// Check `args` against a tool's JSON Schema and fill in defaults.
///
/// Supported keywords: `properties`, `required`, `type`, `enum`, `items`,
/// `minimum`, `maximum` and `additionalProperties: true`. Unknown keys are
/// rejected unless `additionalProperties` is `true`. A `null` value counts
/// as absent. Missing `arguments` (JSON `null`) means `{}`.
pub fn validate_args(schema: &Value, args: &Value) -> Result<Value> {
    let mut given = match args {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        other => {
            return Err(RagError::invalid(format!(
                "arguments must be an object, got {}",
                json_type_name(other)
            )))
        }
    };
    given.retain(|_, v| !v.is_null());

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let open = schema
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !open {
        if let Some(unknown) = given.keys().find(|k| !properties.contains_key(*k)) {
            return Err(RagError::invalid(format!("unknown parameter: {}", unknown)));
        }
    }

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for field in required {
        if !given.contains_key(field) {
            return Err(RagError::invalid(format!(
                "missing required parameter: {}",
                field
            )));
        }
    }

    for (name, prop) in &properties {
        match given.get(name) {
            Some(value) => check_value(name, prop, value)?,
            None => {
                if let Some(default) = prop.get("default") {
                    given.insert(name.clone(), default.clone());
                }
            }
        }
    }

    Ok(Value::Object(given))
}

fn check_value(name: &str, prop: &Value, value: &Value) -> Result<()> {
    if let Some(expected) = prop.get("type").and_then(Value::as_str) {
        let type_ok = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !type_ok {
            return Err(RagError::invalid(format!(
                "parameter '{}' must be of type '{}', got {}",
                name,
                expected,
                json_type_name(value)
            )));
        }
    }

    if let (Some(items), Some(values)) = (prop.get("items"), value.as_array()) {
        for (i, item) in values.iter().enumerate() {
            check_value(&format!("{}[{}]", name, i), items, item)?;
        }
    }

    if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let allowed: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
            return Err(RagError::invalid(format!(
                "parameter '{}' must be one of [{}], got {}",
                name,
                allowed.join(", "),
                value
            )));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = prop.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(RagError::invalid(format!(
                    "parameter '{}' must be >= {}, got {}",
                    name, min, value
                )));
            }
        }
        if let Some(max) = prop.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(RagError::invalid(format!(
                    "parameter '{}' must be <= {}, got {}",
                    name, max, value
                )));
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
