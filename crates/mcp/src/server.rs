// MCP server: line-delimited JSON-RPC over stdio

use crate::error::{McpError, McpResult};
use crate::lifecycle::{LifecycleCoordinator, NotificationSink, ShutdownCause};
use crate::protocol::{
    methods, CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, ToolSchema,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Sends outbound lines to the single writer task.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    pub fn send(&self, message: &impl Serialize) -> McpResult<()> {
        let line = serde_json::to_string(message)?;
        self.tx.send(line).map_err(|_| McpError::OutputClosed)
    }
}

#[async_trait]
impl NotificationSink for Outbound {
    async fn send_notification(&self, notification: JsonRpcRequest) -> McpResult<()> {
        self.send(&notification)
    }
}

#[derive(Clone)]
pub struct McpServer {
    lifecycle: Arc<LifecycleCoordinator>,
}

impl McpServer {
    pub fn new(lifecycle: Arc<LifecycleCoordinator>) -> Self {
        Self { lifecycle }
    }

    /// Serve on the process's stdin and stdout.
    pub async fn run_stdio(&self) -> McpResult<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve until `input` reaches EOF, then trigger shutdown.
    pub async fn serve<R, W>(&self, input: R, output: W) -> McpResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(output, rx));

        let outbound = Outbound { tx };
        self.lifecycle.set_sink(Arc::new(outbound.clone()));
        info!("MCP server listening on stdio");

        let mut lines = FramedRead::new(input, LinesCodec::new());
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(LinesCodecError::Io(e)) => {
                    error!(error = %e, "Failed to read from stdin");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable input line");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let server = self.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle_line(&line).await {
                    if let Err(e) = outbound.send(&response) {
                        warn!(error = %e, "Failed to queue response");
                    }
                }
            });
        }

        info!("stdin closed");
        self.lifecycle.shutdown(ShutdownCause::StdinClosed);
        Ok(())
    }

    /// Handle one input line. Returns the response to send, if any.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to parse request");
                return Some(JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error()));
            }
        };

        let request: JsonRpcRequest = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(_) => {
                let id = value.get("id").cloned().unwrap_or(Value::Null);
                return Some(JsonRpcResponse::error(id, JsonRpcError::invalid_request()));
            }
        };

        if request.is_notification() {
            self.handle_notification(&request);
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        Some(self.handle_request(id, request).await)
    }

    async fn handle_request(&self, id: Value, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %request.method, "Handling request");
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            methods::INITIALIZE => {
                let params: InitializeParams = serde_json::from_value(params).unwrap_or_default();
                JsonRpcResponse::success(id, self.initialize(params).await)
            }
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::TOOLS_LIST => JsonRpcResponse::success(id, self.list_tools()),
            methods::TOOLS_CALL => match serde_json::from_value::<CallToolParams>(params) {
                Ok(params) => JsonRpcResponse::success(id, self.call_tool(params).await),
                Err(e) => JsonRpcResponse::error(id, JsonRpcError::invalid_params(e.to_string())),
            },
            other => JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
        }
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            methods::INITIALIZED => info!("Client finished initialization"),
            methods::CANCELLED => debug!(params = ?request.params, "Client cancelled a request"),
            other => debug!(method = other, "Ignoring client notification"),
        }
    }

    async fn initialize(&self, params: InitializeParams) -> InitializeResult {
        let client_name = params
            .client_info
            .as_ref()
            .map(|info| info.name.as_str())
            .filter(|name| !name.is_empty());

        let tools = self.lifecycle.handle_initialize(client_name).await;
        InitializeResult::new(tools.map(|tools| tools.into_iter().map(ToolSchema::from).collect()))
    }

    fn list_tools(&self) -> ListToolsResult {
        let tools: Vec<ToolSchema> = self
            .lifecycle
            .capabilities()
            .list_tools()
            .into_iter()
            .map(ToolSchema::from)
            .collect();
        debug!(tool_count = tools.len(), "Providing tools");
        ListToolsResult { tools }
    }

    async fn call_tool(&self, params: CallToolParams) -> CallToolResult {
        debug!(tool = %params.name, "Tool call");
        match self
            .lifecycle
            .capabilities()
            .call_tool(&params.name, params.arguments)
            .await
        {
            Ok(Value::String(text)) => CallToolResult::text(text),
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
                CallToolResult::text(text)
            }
            Err(e) => CallToolResult::error(format!("Error executing {}: {}", params.name, e)),
        }
    }
}

async fn write_loop<W>(mut output: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let written = async {
            output.write_all(line.as_bytes()).await?;
            output.flush().await
        }
        .await;
        if let Err(e) = written {
            error!(error = %e, "Failed to write to stdout");
            break;
        }
    }
}
