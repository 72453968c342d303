//! Line-delimited JSON-RPC 2.0 transport on stdin/stdout.
//!
//! One JSON object per line in, one per line out. Requests are dispatched
//! on their own tasks so tool handlers run concurrently; responses are
//! matched to requests by `id`. Notifications are never answered. Stdout
//! carries only protocol frames; diagnostics go to stderr via tracing.

pub mod router;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::context::AppContext;
use crate::error::{Result, SibylError};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct RpcErrorBody {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: &SibylError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcErrorBody {
                code: error.rpc_code(),
                message: error.to_string(),
                data: error.rpc_data(),
            }),
        }
    }
}

/// Serve the protocol until stdin closes.
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            if stdout.write_all(frame.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let ctx = Arc::clone(&ctx);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = dispatch_line(&ctx, &line).await {
                match serde_json::to_string(&response) {
                    Ok(frame) => {
                        let _ = tx.send(frame);
                    }
                    Err(e) => error!(error = %e, "failed to serialize response"),
                }
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Handle one input line. Returns the response frame, or `None` for
/// notifications and for lines too malformed to answer.
pub async fn dispatch_line(ctx: &Arc<AppContext>, line: &str) -> Option<RpcResponse> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "dropping unparseable input line");
            return None;
        }
    };

    let id = value
        .get("id")
        .cloned()
        .filter(|id| !id.is_null());

    let Some(object) = value.as_object() else {
        return id.map(|id| {
            RpcResponse::failure(id, &SibylError::Parse("input line is not a request object".into()))
        });
    };

    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return answer(
            id,
            Err(SibylError::InvalidRequest("jsonrpc must be \"2.0\"".into())),
        );
    }

    let Some(method) = object.get("method").and_then(Value::as_str) else {
        return answer(
            id,
            Err(SibylError::InvalidRequest("missing method".into())),
        );
    };

    let params = object.get("params").cloned();
    debug!(method, has_id = id.is_some(), "dispatching request");

    let result = match method {
        "initialize" => Ok(initialize_result()),
        "tools/list" => Ok(router::tools_list()),
        "tools/call" => router::handle_tools_call(ctx, params).await,
        _ => Err(SibylError::MethodNotFound(format!(
            "Unknown method: {method}"
        ))),
    };

    answer(id, result)
}

fn answer(id: Option<Value>, result: Result<Value>) -> Option<RpcResponse> {
    match id {
        Some(id) => Some(match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(error) => RpcResponse::failure(id, &error),
        }),
        None => {
            if let Err(error) = result {
                warn!(error = %error, "notification handler failed");
            }
            None
        }
    }
}

fn initialize_result() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": {}
        }
    })
}
