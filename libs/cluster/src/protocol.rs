//! Wire Protocol
//!
//! One envelope type covers every message on a worker/gateway connection:
//! proxied requests and responses, published events, and the registration
//! handshake. Frames are a u32 big-endian length prefix followed by the
//! JSON-encoded envelope; correlation ids are opaque strings.

use mesh_runtime::{Payload, Result, RuntimeError, Subscription};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Oversized frames indicate a corrupt or
/// hostile peer and fail the connection.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Every message exchanged between a worker and a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Unicast RPC toward `target` (string-form agent id).
    Request {
        request_id: String,
        target: String,
        sender: Option<String>,
        payload: Payload,
    },
    /// Completion of a prior Request; exactly one of payload/error is set.
    Response {
        request_id: String,
        payload: Option<Payload>,
        error: Option<WireError>,
    },
    /// Topic broadcast (string-form topic id).
    Publish {
        message_id: String,
        topic: String,
        sender: Option<String>,
        payload: Payload,
    },
    /// Worker declares it can host an agent type.
    RegisterAgentType {
        request_id: String,
        agent_type: String,
    },
    RegisterAgentTypeResponse {
        request_id: String,
        error: Option<String>,
    },
    /// Worker installs a subscription gateway-side.
    AddSubscription {
        request_id: String,
        subscription: Subscription,
    },
    AddSubscriptionResponse {
        request_id: String,
        error: Option<String>,
    },
}

/// Structured fault carried by a [`Envelope::Response`].
///
/// Keeping the category on the wire lets the receiving side rebuild the
/// matching error variant instead of parsing message text, so a remote
/// timeout still classifies as a timeout for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum WireError {
    Addressing { message: String },
    Delivery { recipient: String, message: String },
    Timeout { operation: String, timeout_ms: u64 },
    Transport { message: String },
    Other { message: String },
}

impl From<&RuntimeError> for WireError {
    fn from(e: &RuntimeError) -> Self {
        match e {
            RuntimeError::Addressing { message } => Self::Addressing {
                message: message.clone(),
            },
            RuntimeError::Delivery { recipient, message } => Self::Delivery {
                recipient: recipient.clone(),
                message: message.clone(),
            },
            RuntimeError::Timeout {
                operation,
                timeout_ms,
            } => Self::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            RuntimeError::Transport { message, .. } => Self::Transport {
                message: message.clone(),
            },
            other => Self::Other {
                message: other.to_string(),
            },
        }
    }
}

impl WireError {
    /// Rebuild the runtime error, attributing uncategorized handler faults
    /// to `recipient`.
    pub fn into_runtime_error(self, recipient: &str) -> RuntimeError {
        match self {
            Self::Addressing { message } => RuntimeError::Addressing { message },
            Self::Delivery { recipient, message } => RuntimeError::Delivery { recipient, message },
            Self::Timeout {
                operation,
                timeout_ms,
            } => RuntimeError::Timeout {
                operation,
                timeout_ms,
            },
            Self::Transport { message } => RuntimeError::transport(message),
            Self::Other { message } => RuntimeError::delivery(recipient, message),
        }
    }
}

impl Envelope {
    /// Short tag for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Publish { .. } => "publish",
            Self::RegisterAgentType { .. } => "register_agent_type",
            Self::RegisterAgentTypeResponse { .. } => "register_agent_type_response",
            Self::AddSubscription { .. } => "add_subscription",
            Self::AddSubscriptionResponse { .. } => "add_subscription_response",
        }
    }
}

/// Write one length-prefixed envelope frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(RuntimeError::transport(format!(
            "outbound frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one envelope frame. Returns `None` on a clean end-of-stream at a
/// frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RuntimeError::transport(format!(
            "inbound frame of {len} bytes exceeds limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_runtime::AgentType;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let envelope = Envelope::Request {
            request_id: "r1".into(),
            target: "echo/default".into(),
            sender: Some("caller/0".into()),
            payload: Payload::new("task", json!({ "id": "t1" })),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read, envelope);

        // Clean EOF at a frame boundary.
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscription_envelope_round_trip() {
        let envelope = Envelope::AddSubscription {
            request_id: "r2".into(),
            subscription: Subscription::prefix_with_id(
                "direct:echo",
                "echo:",
                AgentType::new("echo").unwrap(),
            ),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_wire_error_preserves_timeout_category() {
        let envelope = Envelope::Response {
            request_id: "r4".into(),
            payload: None,
            error: Some(WireError::from(&RuntimeError::timeout("proxied rpc", 200))),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let read = read_frame(&mut cursor).await.unwrap().unwrap();
        let Envelope::Response {
            error: Some(error), ..
        } = read
        else {
            panic!("expected a response envelope");
        };
        let rebuilt = error.into_runtime_error("echo/default");
        assert!(rebuilt.is_timeout());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let envelope = Envelope::Response {
            request_id: "r3".into(),
            payload: None,
            error: Some(WireError::Addressing {
                message: "agent not found".into(),
            }),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).await.unwrap();
        buf.truncate(buf.len() - 2);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err.category(), "transport");
    }
}
