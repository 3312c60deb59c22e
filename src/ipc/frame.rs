use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DispatchError;

/// Serialize request/response bodies as base64 — the wire payload is JSON
/// and cannot carry raw bytes.
mod body_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A request ticket as it crosses the bridge. Created at the edge; the body
/// buffer is moved in here when the ticket is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTicket {
    pub id: String,
    pub method: String,
    pub url: String,
    /// Header pairs in arrival order — per-name ordering is significant.
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub query: String,
    /// Path parameters filled in by the router.
    #[serde(default)]
    pub params: HashMap<String, String>,
    pub remote_addr: String,
    pub local_addr: String,
    #[serde(with = "body_bytes", default)]
    pub body: Bytes,
    /// Milliseconds left until the edge-side deadline fires.
    pub deadline_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub trace: Option<String>,
}

/// A worker's answer to one request ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_bytes", default)]
    pub body: Bytes,
}

/// A route claimed by a worker via `sync_routes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRoute {
    pub method: String,
    pub path: String,
}

/// Every message crossing a worker socket, in either direction.
///
/// Wire format: 4-byte big-endian length, then that many bytes of JSON.
/// The JSON object is tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Worker → edge, first frame after connect.
    RegisterWorker {
        id: String,
        #[serde(default)]
        weight: Option<u32>,
        #[serde(default)]
        capabilities: Option<serde_json::Value>,
        /// Shared secret, required from TCP upstreams only.
        #[serde(default)]
        token: Option<String>,
    },
    /// Worker → edge, optional after registration.
    SyncRoutes { routes: Vec<WorkerRoute> },
    /// Edge → worker.
    Request { ticket: RequestTicket },
    /// Worker → edge.
    Response { reply: WorkerReply },
    Ping { seq: u64 },
    Pong { seq: u64 },
    /// Edge → worker: garbage-collection hint from the autoscaler.
    ForceGc,
    /// Edge → worker: finish in-flight work, then exit.
    Shutdown,
}

impl Frame {
    /// Stable name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::RegisterWorker { .. } => "register_worker",
            Frame::SyncRoutes { .. } => "sync_routes",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::ForceGc => "force_gc",
            Frame::Shutdown => "shutdown",
        }
    }
}

/// Encode a frame into length-prefixed wire bytes.
pub fn encode_frame(frame: &Frame, max_frame_bytes: u32) -> Result<Bytes, DispatchError> {
    let payload =
        serde_json::to_vec(frame).map_err(|e| DispatchError::Protocol(e.to_string()))?;
    if payload.len() > max_frame_bytes as usize {
        return Err(DispatchError::Protocol(format!(
            "outbound frame of {} bytes exceeds cap {}",
            payload.len(),
            max_frame_bytes
        )));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(Bytes::from(buf))
}

/// Write one frame to the socket.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    max_frame_bytes: u32,
) -> Result<(), DispatchError> {
    let bytes = encode_frame(frame, max_frame_bytes)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| DispatchError::Protocol(format!("socket write failed: {}", e)))?;
    Ok(())
}

/// Read one frame from the socket.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. The declared
/// length is validated against the cap before any payload allocation;
/// any violation is a protocol error and the caller must drop the
/// connection.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Option<Frame>, DispatchError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DispatchError::Protocol(format!("socket read failed: {}", e))),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_bytes {
        return Err(DispatchError::Protocol(format!(
            "declared frame length {} exceeds cap {}",
            len, max_frame_bytes
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| DispatchError::Protocol(format!("truncated frame: {}", e)))?;

    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| DispatchError::Protocol(format!("malformed frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 100 * 1024 * 1024;

    fn ticket(id: &str) -> RequestTicket {
        RequestTicket {
            id: id.to_string(),
            method: "GET".to_string(),
            url: "/a".to_string(),
            headers: vec![
                ("accept".to_string(), "text/html".to_string()),
                ("accept".to_string(), "*/*".to_string()),
            ],
            query: "x=1".to_string(),
            params: HashMap::new(),
            remote_addr: "1.2.3.4:5678".to_string(),
            local_addr: "127.0.0.1:4349".to_string(),
            body: Bytes::from_static(b"\x00\x01binary"),
            deadline_ms: 30_000,
            retry_count: 0,
            trace: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let frame = Frame::Request { ticket: ticket("7-deadbeef") };
        write_frame(&mut client, &frame, MAX).await.unwrap();

        let decoded = read_frame(&mut server, MAX).await.unwrap().unwrap();
        match decoded {
            Frame::Request { ticket } => {
                assert_eq!(ticket.id, "7-deadbeef");
                assert_eq!(ticket.body, Bytes::from_static(b"\x00\x01binary"));
                // Per-name ordering survives the wire.
                assert_eq!(ticket.headers[0].1, "text/html");
                assert_eq!(ticket.headers[1].1, "*/*");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server, MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Declare 100 bytes, deliver 3, then hang up.
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server, MAX).await,
            Err(DispatchError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversize_length_rejected_before_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(MAX + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server, MAX).await.unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let garbage = b"{not json";
        client
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(garbage).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, MAX).await,
            Err(DispatchError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversize_payload() {
        let reply = WorkerReply {
            id: "1".to_string(),
            status: 200,
            headers: Vec::new(),
            body: Bytes::from(vec![0u8; 128]),
        };
        let err = encode_frame(&Frame::Response { reply }, 16).unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
    }

    #[test]
    fn test_tag_names_on_wire() {
        let json = serde_json::to_string(&Frame::ForceGc).unwrap();
        assert_eq!(json, r#"{"type":"force_gc"}"#);
        let json = serde_json::to_string(&Frame::Ping { seq: 3 }).unwrap();
        assert!(json.contains(r#""type":"ping""#));
    }
}
