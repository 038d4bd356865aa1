//! Wire protocol types and framing.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON payload:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The request/reply channel carries [`Request`] and [`Reply`] frames; the
//! event channel carries one [`Subscribe`]/[`Subscribed`] handshake followed
//! by a stream of [`ChangeRecord`] frames in strictly increasing revision
//! order.

use crate::config::ProtocolConfig;
use crate::error::{Result, ZprocError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A single state operation, tagged on the wire by `op`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Get { key: String },
    GetAll,
    Set { key: String, value: Value },
    Delete { key: String },
    UpdateMany { delta: Map<String, Value> },
    Atomic {
        handler: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Ping,
    Contains { key: String },
    Keys,
    Len,
    Pop { key: String },
    SetDefault { key: String, value: Value },
    Clear,
}

/// A correlated request on the reply channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Op,
}

/// Successful reply payload, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyBody {
    /// GET: the value, or `None` when the key is absent.
    Value { value: Option<Value> },
    /// GET_ALL: full snapshot plus the revision it reflects.
    Snapshot {
        revision: u64,
        entries: Map<String, Value>,
    },
    /// SET / DELETE / UPDATE_MANY / CLEAR: the server revision after the op.
    Revision { revision: u64 },
    /// ATOMIC: the handler's return value and the post-commit revision.
    Atomic { value: Value, revision: u64 },
    /// PING: server identity and current revision.
    Pong { server_id: String, revision: u64 },
    /// CONTAINS.
    Bool { value: bool },
    /// KEYS: sorted key list.
    Keys { keys: Vec<String> },
    /// LEN.
    Len { len: u64 },
    /// POP: the removed value (`None` when the key was absent) and the
    /// revision after the op.
    Popped {
        value: Option<Value>,
        revision: u64,
    },
    /// SET_DEFAULT: the value now stored at the key, and the revision.
    Defaulted { value: Value, revision: u64 },
}

/// A correlated reply. Exactly one of `value`/`error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ReplyBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    pub fn success(id: u64, value: ReplyBody) -> Self {
        Self {
            id,
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(id: u64, error: WireError) -> Self {
        Self {
            id,
            ok: false,
            value: None,
            error: Some(error),
        }
    }

    /// Collapse into the usual `Result`, flagging malformed replies.
    pub fn into_result(self) -> Result<ReplyBody> {
        match (self.ok, self.value, self.error) {
            (true, Some(body), None) => Ok(body),
            (false, None, Some(err)) => Err(err.into_error()),
            _ => Err(ZprocError::protocol("reply carries neither value nor error")),
        }
    }
}

/// Error kinds a server reply can carry. Transport and timeout failures are
/// always client-local and never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    KeyMissing,
    User,
    UnknownHandler,
    Protocol,
}

/// A failure record as it travels in a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WireError {
    /// Package a server-side failure for the wire.
    pub fn from_error(err: &ZprocError) -> Self {
        match err {
            ZprocError::KeyMissing { key } => Self {
                kind: WireErrorKind::KeyMissing,
                message: key.clone(),
                detail: None,
            },
            ZprocError::User { message, detail } => Self {
                kind: WireErrorKind::User,
                message: message.clone(),
                detail: detail.clone(),
            },
            ZprocError::UnknownHandler { name } => Self {
                kind: WireErrorKind::UnknownHandler,
                message: name.clone(),
                detail: None,
            },
            other => Self {
                kind: WireErrorKind::Protocol,
                message: other.to_string(),
                detail: None,
            },
        }
    }

    /// Re-raise on the client as the typed error it was on the server.
    pub fn into_error(self) -> ZprocError {
        match self.kind {
            WireErrorKind::KeyMissing => ZprocError::KeyMissing { key: self.message },
            WireErrorKind::User => ZprocError::User {
                message: self.message,
                detail: self.detail,
            },
            WireErrorKind::UnknownHandler => ZprocError::UnknownHandler { name: self.message },
            WireErrorKind::Protocol => ZprocError::Protocol {
                message: self.message,
            },
        }
    }
}

/// Per-key before/after pair inside a change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    pub existed_before: bool,
    pub exists_after: bool,
}

/// The server's description of what one revision changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub revision: u64,
    pub changes: BTreeMap<String, KeyChange>,
}

impl ChangeRecord {
    /// Whether this record touches the given key.
    pub fn touches(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    /// Whether this record touches any of the given keys.
    pub fn touches_any(&self, keys: &[String]) -> bool {
        keys.iter().any(|k| self.changes.contains_key(k))
    }
}

/// First frame a subscriber sends on the event channel. `keys = None`
/// subscribes to every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribe {
    pub keys: Option<Vec<String>>,
}

/// The server's acknowledgement, carrying the registration revision: every
/// subsequent frame on this connection has a strictly greater revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribed {
    pub revision: u64,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed between frames).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(ZprocError::transport(format!(
            "frame size {} exceeds maximum {}",
            len,
            ProtocolConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a message and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}

/// Read one frame and deserialize it, or `None` on clean EOF.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    match read_frame(reader).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_roundtrip() {
        let req = Request {
            id: 7,
            op: Op::Set {
                key: "apples".to_string(),
                value: json!(5),
            },
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let parsed: Request = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed.id, 7);
        match parsed.op {
            Op::Set { key, value } => {
                assert_eq!(key, "apples");
                assert_eq!(value, json!(5));
            }
            other => panic!("expected Set, got {:?}", other),
        }
    }

    #[test]
    fn test_op_tag_is_snake_case() {
        let req = Request {
            id: 1,
            op: Op::GetAll,
        };
        let text = serde_json::to_string(&req).unwrap();
        assert!(text.contains("\"op\":\"get_all\""));
    }

    #[test]
    fn test_reply_success_omits_error() {
        let reply = Reply::success(3, ReplyBody::Revision { revision: 12 });
        let text = serde_json::to_string(&reply).unwrap();
        assert!(text.contains("\"ok\":true"));
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn test_reply_into_result_rejects_malformed() {
        let reply = Reply {
            id: 1,
            ok: true,
            value: None,
            error: None,
        };
        assert!(matches!(
            reply.into_result(),
            Err(ZprocError::Protocol { .. })
        ));
    }

    #[test]
    fn test_wire_error_roundtrips_user_detail() {
        let err = ZprocError::User {
            message: "divide by zero".to_string(),
            detail: Some("at item 3".to_string()),
        };
        let wire = WireError::from_error(&err);
        match wire.into_error() {
            ZprocError::User { message, detail } => {
                assert_eq!(message, "divide by zero");
                assert_eq!(detail.as_deref(), Some("at item 3"));
            }
            other => panic!("expected User, got {:?}", other),
        }
    }

    #[test]
    fn test_change_record_touches() {
        let mut changes = BTreeMap::new();
        changes.insert(
            "a".to_string(),
            KeyChange {
                before: None,
                after: Some(json!(1)),
                existed_before: false,
                exists_after: true,
            },
        );
        let record = ChangeRecord {
            revision: 4,
            changes,
        };

        assert!(record.touches("a"));
        assert!(!record.touches("b"));
        assert!(record.touches_any(&["b".to_string(), "a".to_string()]));
        assert!(!record.touches_any(&["b".to_string()]));
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello zproc";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ProtocolConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let record = ChangeRecord {
            revision: 9,
            changes: BTreeMap::new(),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &record).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back: Option<ChangeRecord> = read_message(&mut cursor).await.unwrap();
        assert_eq!(back, Some(record));
    }
}
