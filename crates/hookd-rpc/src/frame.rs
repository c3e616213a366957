use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{RpcError, RpcResult};

pub const RPC_PROTOCOL_VERSION: u32 = 1;

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame a plugin writes once it is ready to serve calls.
    Hello {
        protocol_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    pub fn hello() -> Self {
        Self::Hello {
            protocol_version: RPC_PROTOCOL_VERSION,
            pid: Some(std::process::id()),
        }
    }

    pub fn response(id: u64, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => Self::Response {
                id,
                result,
                error: None,
            },
            Err(error) => Self::Response {
                id,
                result: Value::Null,
                error: Some(error),
            },
        }
    }
}

/// Serializes a frame as one newline-terminated JSON line.
pub fn encode_frame(frame: &Frame) -> RpcResult<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parses one trimmed line into a frame.
pub fn parse_frame(raw: &str) -> RpcResult<Frame> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RpcError::Protocol("empty frame".to_string()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Writes the handshake frame and flushes it.
pub async fn write_hello<W>(writer: &mut W) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_frame(&Frame::hello())?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads lines until the handshake frame arrives and validates its version.
///
/// Blank lines are skipped. End of stream before the handshake yields
/// [`RpcError::Closed`]; any other frame is a protocol violation.
pub async fn read_hello<R>(reader: &mut R) -> RpcResult<Option<u32>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(RpcError::Closed);
        }
        if line.trim().is_empty() {
            continue;
        }
        return match parse_frame(&line)? {
            Frame::Hello {
                protocol_version,
                pid,
            } => {
                if protocol_version != RPC_PROTOCOL_VERSION {
                    return Err(RpcError::VersionMismatch {
                        expected: RPC_PROTOCOL_VERSION,
                        actual: protocol_version,
                    });
                }
                Ok(pid)
            }
            other => Err(RpcError::Protocol(format!(
                "expected hello frame, received {}",
                frame_kind(&other)
            ))),
        };
    }
}

pub(crate) fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Hello { .. } => "hello",
        Frame::Request { .. } => "request",
        Frame::Response { .. } => "response",
    }
}
