// SPDX-License-Identifier: GPL-3.0-or-later

//! JSON-RPC message types and LSP Content-Length framing.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_null() -> serde_json::Value {
    serde_json::Value::Null
}

/// A JSON-RPC request. Outgoing requests always use numeric ids; incoming
/// server requests may use string ids, which are echoed back verbatim.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

/// A JSON-RPC response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// A JSON-RPC notification.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

/// A request id, numeric or string.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC error code for a server-internal failure.
pub const INTERNAL_ERROR: i64 = -32603;

/// An incoming message, classified by shape.
#[derive(Debug)]
pub enum IncomingMessage {
    /// Has `method` and `id`: the server wants an answer from us.
    Request(RequestMessage),
    /// Has `method` but no `id`.
    Notification(NotificationMessage),
    /// Has `id` but no `method`: answers one of our requests.
    Response(ResponseMessage),
}

/// Classifies a raw JSON-RPC payload.
///
/// # Errors
///
/// Returns [`Error::Transport`] when the payload is not a JSON-RPC message
/// of any known shape.
pub fn classify(raw: &str) -> Result<IncomingMessage> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| Error::Transport(format!("invalid JSON payload: {e}")))?;

    let has_method = value.get("method").is_some();
    let has_id = value.get("id").is_some();

    if has_method && has_id {
        let request = serde_json::from_value(value)
            .map_err(|e| Error::Transport(format!("malformed server request: {e}")))?;
        Ok(IncomingMessage::Request(request))
    } else if has_method {
        let notification = serde_json::from_value(value)
            .map_err(|e| Error::Transport(format!("malformed notification: {e}")))?;
        Ok(IncomingMessage::Notification(notification))
    } else if has_id {
        let response = serde_json::from_value(value)
            .map_err(|e| Error::Transport(format!("malformed response: {e}")))?;
        Ok(IncomingMessage::Response(response))
    } else {
        Err(Error::Transport(format!("unknown message shape: {raw}")))
    }
}

/// Encodes a message with its `Content-Length` header.
///
/// # Errors
///
/// Returns [`Error::Json`] when the message cannot be serialized.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_string(message)?;
    let mut framed = Vec::with_capacity(body.len() + 32);
    framed.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    framed.extend_from_slice(body.as_bytes());
    Ok(framed)
}

/// Extracts one complete framed message from the buffer, if present.
/// Header names are case-insensitive; unknown headers are skipped.
///
/// # Errors
///
/// Returns [`Error::Transport`] on malformed headers or a non-UTF-8 body.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<Option<String>> {
    let Some(header_end) = buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|i| i + 4)
    else {
        return Ok(None);
    };

    let headers = std::str::from_utf8(&buffer[..header_end - 4])
        .map_err(|_| Error::Transport("non-UTF-8 framing headers".to_string()))?;

    let mut content_length: Option<usize> = None;
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = Some(value.trim().parse().map_err(|_| {
                Error::Transport(format!("invalid Content-Length value: {value}"))
            })?);
        }
    }

    let Some(content_length) = content_length else {
        return Err(Error::Transport(
            "framing headers missing Content-Length".to_string(),
        ));
    };

    let total = header_end + content_length;
    if buffer.len() < total {
        return Ok(None);
    }

    buffer.advance(header_end);
    let body = buffer.split_to(content_length);
    let message = String::from_utf8(body.to_vec())
        .map_err(|_| Error::Transport("non-UTF-8 message body".to_string()))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &str) -> BytesMut {
        BytesMut::from(format!("Content-Length: {}\r\n\r\n{}", body.len(), body).as_str())
    }

    #[test]
    fn parse_complete_message() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let mut buffer = frame(body);

        let result = try_parse_message(&mut buffer).ok().flatten();
        assert_eq!(result, Some(body.to_string()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn parse_incomplete_header() {
        let mut buffer = BytesMut::from("Content-Length: 10\r\n");
        assert!(matches!(try_parse_message(&mut buffer), Ok(None)));
    }

    #[test]
    fn parse_incomplete_body() {
        let mut buffer = BytesMut::from("Content-Length: 100\r\n\r\n{\"partial\":");
        assert!(matches!(try_parse_message(&mut buffer), Ok(None)));
    }

    #[test]
    fn parse_multiple_messages() {
        let body1 = r#"{"jsonrpc":"2.0","id":1}"#;
        let body2 = r#"{"jsonrpc":"2.0","id":2}"#;
        let mut buffer = frame(body1);
        buffer.extend_from_slice(&frame(body2));

        assert_eq!(
            try_parse_message(&mut buffer).ok().flatten(),
            Some(body1.to_string())
        );
        assert_eq!(
            try_parse_message(&mut buffer).ok().flatten(),
            Some(body2.to_string())
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn parse_case_insensitive_header_with_extras() {
        let body = r#"{"test":true}"#;
        let raw = format!(
            "content-type: application/vscode-jsonrpc\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut buffer = BytesMut::from(raw.as_str());

        assert_eq!(
            try_parse_message(&mut buffer).ok().flatten(),
            Some(body.to_string())
        );
    }

    #[test]
    fn missing_content_length_is_a_transport_error() {
        let mut buffer = BytesMut::from("X-Something: 1\r\n\r\n{}");
        assert!(try_parse_message(&mut buffer).is_err());
    }

    #[test]
    fn encode_round_trips_through_parser() {
        let notification = NotificationMessage {
            jsonrpc: "2.0".to_string(),
            method: "initialized".to_string(),
            params: serde_json::json!({}),
        };
        let encoded = encode(&notification).unwrap_or_default();
        let mut buffer = BytesMut::from(encoded.as_slice());
        let parsed = try_parse_message(&mut buffer).ok().flatten();
        assert!(parsed.is_some_and(|p| p.contains("initialized")));
    }

    #[test]
    fn classify_request_notification_response() {
        let request = r#"{"jsonrpc":"2.0","id":"cfg-1","method":"workspace/configuration","params":{}}"#;
        assert!(matches!(
            classify(request),
            Ok(IncomingMessage::Request(r)) if r.id == RequestId::String("cfg-1".to_string())
        ));

        let notification = r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#;
        assert!(matches!(
            classify(notification),
            Ok(IncomingMessage::Notification(n)) if n.method == "initialized"
        ));

        let response = r#"{"jsonrpc":"2.0","id":7,"result":{"capabilities":{}}}"#;
        assert!(matches!(
            classify(response),
            Ok(IncomingMessage::Response(r)) if r.id == Some(RequestId::Number(7))
        ));
    }

    #[test]
    fn classify_error_response() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid Request"}}"#;
        let classified_as_error = match classify(raw) {
            Ok(IncomingMessage::Response(r)) => {
                r.result.is_none() && r.error.map(|e| e.code) == Some(-32600)
            }
            _ => false,
        };
        assert!(classified_as_error);
    }

    #[test]
    fn classify_rejects_garbage() {
        assert!(classify("{}").is_err());
        assert!(classify("not json").is_err());
    }
}
