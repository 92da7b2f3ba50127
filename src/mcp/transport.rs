//! Streamable-HTTP JSON-RPC transport shared by MCP-speaking providers.
//!
//! A call moves idle → request-sent → (SSE | JSON body) → parsed →
//! (result | MCP error). SSE bodies are scanned for `data:` frames;
//! blank frames and `[DONE]` are skipped.

use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::header::CONTENT_TYPE;
use reqwest::RequestBuilder;
use serde_json::Value;

use super::types::{JsonRpcRequest, JsonRpcResponse};
use super::McpError;

pub const ACCEPT_STREAMABLE: &str = "application/json, text/event-stream";
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Per-provider JSON-RPC id source.
#[derive(Debug)]
pub struct RequestIds(AtomicU64);

impl Default for RequestIds {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl RequestIds {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Outcome of one JSON-RPC exchange.
pub struct RpcReply {
    pub result: Value,
    /// `Mcp-Session-Id` the server assigned, if any.
    pub session_id: Option<String>,
}

/// Send `method` on an already-addressed and authenticated request.
pub async fn send(request: RequestBuilder, id: u64, method: &str, params: Option<Value>) -> Result<RpcReply, McpError> {
    let body = JsonRpcRequest::new(id, method, params);
    let resp = request
        .header("Accept", ACCEPT_STREAMABLE)
        .json(&body)
        .send()
        .await
        .map_err(|e| McpError::Transport(e.to_string()))?;

    let session_id = resp
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let is_sse = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    let status = resp.status();
    let text = resp.text().await.map_err(|e| McpError::Transport(e.to_string()))?;
    if !status.is_success() {
        return Err(McpError::Status {
            status: status.as_u16(),
            body: text,
        });
    }

    let result = if is_sse { decode_event_stream(&text)? } else { decode_json(&text)? };
    Ok(RpcReply { result, session_id })
}

/// Decode a plain JSON-RPC response body.
pub fn decode_json(body: &str) -> Result<Value, McpError> {
    let resp: JsonRpcResponse = serde_json::from_str(body).map_err(|e| McpError::Decode(e.to_string()))?;
    into_result(resp)
}

/// First JSON-RPC frame in an SSE body carrying a result or an error.
pub fn decode_event_stream(body: &str) -> Result<Value, McpError> {
    for line in body.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(data) else {
            continue;
        };
        if resp.error.is_some() || resp.result.is_some() {
            return into_result(resp);
        }
    }
    Err(McpError::EmptyStream)
}

fn into_result(resp: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = resp.error {
        return Err(McpError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    resp.result.ok_or_else(|| McpError::Decode("response missing both result and error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sse_skips_noise_and_done_frames() {
        let body = "event: message\n\
                    data: \n\
                    data: [DONE]\n\
                    data: not-json\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[]}}\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ignored\":true}}\n";
        assert_eq!(decode_event_stream(body).unwrap(), json!({ "tools": [] }));
    }

    #[test]
    fn test_sse_error_frame_is_typed() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-32601,\"message\":\"no such method\"}}\n";
        match decode_event_stream(body) {
            Err(McpError::Rpc { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "no such method");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sse_without_payload_is_empty_stream() {
        assert!(matches!(decode_event_stream("data: [DONE]\n\n"), Err(McpError::EmptyStream)));
    }

    #[test]
    fn test_json_body_error_and_result() {
        assert_eq!(
            decode_json(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":1}}"#).unwrap(),
            json!({ "ok": 1 })
        );
        assert!(matches!(
            decode_json(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"denied"}}"#),
            Err(McpError::Rpc { code: -32000, .. })
        ));
        assert!(matches!(decode_json(r#"{"jsonrpc":"2.0","id":1}"#), Err(McpError::Decode(_))));
    }

    #[test]
    fn test_request_ids_increment() {
        let ids = RequestIds::default();
        let a = ids.next();
        assert_eq!(ids.next(), a + 1);
    }
}
