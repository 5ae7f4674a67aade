//! Wire format of the chat endpoint
//!
//! Request bodies, the three accepted non-streaming reply shapes, and the
//! line framing of streamed fragments (raw NDJSON or SSE `data:` lines).

use crate::messages::{ChatMessage, Role};
use crate::{ErrorKind, Result, VoxError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Body of `POST /chat`; built fresh for every send
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<WireMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            temperature: 0.7,
            max_tokens: 2000,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
        }
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// A complete non-streaming reply
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    /// Server-assigned message id, when the server sends one
    pub id: Option<String>,
    pub content: String,
}

/// One partial unit of a streamed reply
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    /// Text carried by the fragment, if any
    pub content: Option<String>,
    /// Completion flag; set on the terminal fragment
    pub done: bool,
    /// Server-assigned message id, when present
    pub id: Option<String>,
}

impl Fragment {
    pub fn partial(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            done: false,
            id: None,
        }
    }

    pub fn done(content: Option<String>) -> Self {
        Self {
            content,
            done: true,
            id: None,
        }
    }
}

fn string_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = match key.parse::<usize>() {
            Ok(index) => current.get(index)?,
            Err(_) => current.get(*key)?,
        };
    }
    current.as_str()
}

fn reply_id(value: &Value) -> Option<String> {
    value.get("id").and_then(|id| match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Parse a non-streaming reply body.
///
/// Shapes are tried in order: `{message:{content}}`,
/// `{choices:[{message:{content}}]}`, `{response}`.
pub fn parse_chat_response(body: &str) -> Result<ChatReply> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        VoxError::chat(
            ErrorKind::MalformedResponse,
            format!("response is not JSON: {}", e),
        )
    })?;

    let content = string_at(&value, &["message", "content"])
        .or_else(|| string_at(&value, &["choices", "0", "message", "content"]))
        .or_else(|| string_at(&value, &["response"]))
        .ok_or_else(|| {
            VoxError::chat(
                ErrorKind::MalformedResponse,
                "response matched none of the known shapes",
            )
        })?;

    Ok(ChatReply {
        id: reply_id(&value),
        content: content.to_string(),
    })
}

/// Parse one line of a streamed reply.
///
/// Returns `None` for blank lines, SSE comments and non-data SSE fields.
pub fn parse_stream_line(line: &str) -> Option<Result<Fragment>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if line.starts_with('{') => line,
        // event:, id:, retry: and other SSE fields
        None => return None,
    };

    if payload == "[DONE]" {
        return Some(Ok(Fragment::done(None)));
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            return Some(Err(VoxError::chat(
                ErrorKind::MalformedResponse,
                format!("unparseable fragment: {}", e),
            )))
        }
    };

    if let Some(error) = string_at(&value, &["error"]) {
        return Some(Err(VoxError::chat(ErrorKind::UpstreamError, error)));
    }

    let content = string_at(&value, &["message", "content"])
        .or_else(|| string_at(&value, &["choices", "0", "delta", "content"]))
        .or_else(|| string_at(&value, &["choices", "0", "message", "content"]))
        .or_else(|| string_at(&value, &["response"]))
        .map(str::to_string);

    let done = value.get("done").and_then(Value::as_bool).unwrap_or(false)
        || value
            .pointer("/choices/0/finish_reason")
            .map(|reason| !reason.is_null())
            .unwrap_or(false);

    Some(Ok(Fragment {
        content,
        done,
        id: reply_id(&value),
    }))
}

/// Splits an incoming byte stream into complete lines.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters and
/// JSON objects split across network chunks are reassembled intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and take every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    /// Take whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub ollama_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest::new(
            "gemma3:1b",
            vec![WireMessage {
                role: Role::User,
                content: "hi".into(),
            }],
        );
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "gemma3:1b");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hi");
        assert_eq!(json["stream"], false);
        assert!(json.get("top_p").is_none());
    }

    #[test]
    fn test_parse_each_known_shape() {
        let ollama = parse_chat_response(r#"{"message":{"role":"assistant","content":"hello"}}"#);
        assert_eq!(ollama.unwrap().content, "hello");

        let openai = parse_chat_response(r#"{"choices":[{"message":{"content":"hey"}}]}"#);
        assert_eq!(openai.unwrap().content, "hey");

        let generate = parse_chat_response(r#"{"response":"yo","done":true}"#);
        assert_eq!(generate.unwrap().content, "yo");
    }

    #[test]
    fn test_shape_order_prefers_message() {
        let reply =
            parse_chat_response(r#"{"response":"second","message":{"content":"first"}}"#).unwrap();
        assert_eq!(reply.content, "first");
    }

    #[test]
    fn test_reply_id_is_kept() {
        let reply = parse_chat_response(r#"{"id":"abc","message":{"content":"x"}}"#).unwrap();
        assert_eq!(reply.id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_unknown_shapes_are_malformed() {
        for body in [
            "",
            "not json",
            "[]",
            "null",
            r#"{"message":{}}"#,
            r#"{"message":{"content":42}}"#,
            r#"{"choices":[]}"#,
            r#"{"text":"nope"}"#,
        ] {
            let err = parse_chat_response(body).unwrap_err();
            assert_eq!(err.kind(), Some(ErrorKind::MalformedResponse), "body: {body}");
        }
    }

    #[test]
    fn test_stream_line_ndjson_and_sse() {
        let raw = parse_stream_line(r#"{"message":{"content":"he"},"done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(raw, Fragment::partial("he"));

        let sse = parse_stream_line(r#"data: {"message":{"content":"hello"},"done":true}"#)
            .unwrap()
            .unwrap();
        assert_eq!(sse.content.as_deref(), Some("hello"));
        assert!(sse.done);

        assert!(parse_stream_line("").is_none());
        assert!(parse_stream_line(": keep-alive").is_none());
        assert!(parse_stream_line("event: message").is_none());
        assert!(parse_stream_line("data: [DONE]").unwrap().unwrap().done);
    }

    #[test]
    fn test_stream_line_errors() {
        let bad = parse_stream_line("data: {oops").unwrap().unwrap_err();
        assert_eq!(bad.kind(), Some(ErrorKind::MalformedResponse));

        let upstream = parse_stream_line(r#"{"error":"model not found"}"#)
            .unwrap()
            .unwrap_err();
        assert_eq!(upstream.kind(), Some(ErrorKind::UpstreamError));
    }

    #[test]
    fn test_line_buffer_reassembles_split_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"a\":").is_empty());

        let lines = buffer.push(b"1}\n{\"b\"");
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);

        // "é" split across two chunks
        let e_acute = "é".as_bytes();
        assert!(buffer.push(&e_acute[..1]).is_empty());
        let lines = buffer.push(&[&e_acute[1..], b"\r\n".as_slice()].concat());
        assert_eq!(lines, vec!["{\"b\"é".to_string()]);

        assert!(buffer.push(b"tail").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("tail"));
        assert!(buffer.finish().is_none());
    }
}
