//! Wire format shared by both transports.
//!
//! Every datagram and every connection starts with the message type id:
//!
//! - **type id**: `[id:8]` little-endian u64
//! - **status** (listener → dialer, point-to-point only): `[len:1][utf-8 token]`
//! - **frame**: `[len:4][json:N]` little-endian u32 length, JSON message body
//!
//! An addressed delivery may follow its frame with raw stream bytes up to EOF.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;
use crate::message::{Message, MessageTypeId};

/// Size of the leading type identifier.
pub const TYPE_ID_SIZE: usize = 8;

/// Size of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum size of a message frame body (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Handshake status written by the listener after reading the type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// A live subscription matched; the body may follow.
    Ok,
    /// No subscription matched; the listener closes the connection.
    AccessDenied,
}

impl HandshakeStatus {
    /// The token sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::AccessDenied => "AccessDenied",
        }
    }

    /// Parse a wire token.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "Ok" => Some(Self::Ok),
            "AccessDenied" => Some(Self::AccessDenied),
            _ => None,
        }
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Type id
// ---------------------------------------------------------------------------

/// Encode a type id into its fixed 8-byte form.
pub fn encode_type_id(id: MessageTypeId) -> [u8; TYPE_ID_SIZE] {
    id.as_u64().to_le_bytes()
}

/// Split a datagram into its type id and the remaining payload.
pub fn split_type_id(datagram: &[u8]) -> Result<(MessageTypeId, &[u8]), NetworkError> {
    if datagram.len() < TYPE_ID_SIZE {
        return Err(NetworkError::Protocol(format!(
            "datagram of {} bytes has no type id",
            datagram.len()
        )));
    }
    let (head, rest) = datagram.split_at(TYPE_ID_SIZE);
    let mut id = [0u8; TYPE_ID_SIZE];
    id.copy_from_slice(head);
    Ok((MessageTypeId(u64::from_le_bytes(id)), rest))
}

/// Read the leading type id from a stream.
pub async fn read_type_id<R>(reader: &mut R) -> Result<MessageTypeId, NetworkError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut id = [0u8; TYPE_ID_SIZE];
    reader.read_exact(&mut id).await?;
    Ok(MessageTypeId(u64::from_le_bytes(id)))
}

/// Write a type id to a stream.
pub async fn write_type_id<W>(writer: &mut W, id: MessageTypeId) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_type_id(id)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handshake status
// ---------------------------------------------------------------------------

/// Write a length-delimited status token and flush.
pub async fn write_status<W>(writer: &mut W, status: HandshakeStatus) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let token = status.as_str().as_bytes();
    let mut buf = Vec::with_capacity(1 + token.len());
    buf.push(token.len() as u8);
    buf.extend_from_slice(token);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited status token.
pub async fn read_status<R>(reader: &mut R) -> Result<HandshakeStatus, NetworkError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u8().await? as usize;
    let mut token = vec![0u8; len];
    reader.read_exact(&mut token).await?;
    let token = std::str::from_utf8(&token)
        .map_err(|e| NetworkError::Protocol(format!("status token is not UTF-8: {e}")))?;
    HandshakeStatus::parse(token)
        .ok_or_else(|| NetworkError::Protocol(format!("unknown status token {token:?}")))
}

// ---------------------------------------------------------------------------
// Message frames
// ---------------------------------------------------------------------------

/// Serialize a message into a length-prefixed frame.
pub fn encode_frame<M: Message>(message: &M) -> Result<Vec<u8>, NetworkError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame body from a stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, NetworkError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read one frame and decode it as `M`.
pub async fn read_message<M, R>(reader: &mut R) -> Result<M, NetworkError>
where
    M: Message,
    R: AsyncRead + Unpin + ?Sized,
{
    let body = read_frame(reader).await?;
    Ok(serde_json::from_slice(&body)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
