//! Remote client handles handed to subscription handlers.
//!
//! A handler receives its [`RemoteClient`] by value. The payload stream is
//! positioned right after the type id. Dropping the client closes an inbound
//! connection; moving it into another task keeps the connection open.

use std::io::Cursor;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::NetworkError;
use crate::message::{Message, MessageTypeId};
use crate::wire;

/// Which transport delivered an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A multicast datagram.
    Multicast,
    /// An accepted point-to-point connection.
    Connection,
}

/// Transport-specific view of the sender of an inbound message.
#[derive(Debug)]
pub enum RemoteClient {
    /// Read-only view over a received datagram.
    Multicast(MulticastRemoteClient),
    /// Bidirectional view over an accepted connection.
    Connection(ConnectionRemoteClient),
}

impl RemoteClient {
    /// The routing key the sender opened with.
    pub fn type_id(&self) -> MessageTypeId {
        match self {
            Self::Multicast(client) => client.type_id,
            Self::Connection(client) => client.type_id,
        }
    }

    /// Address the bytes came from.
    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            Self::Multicast(client) => client.remote_addr,
            Self::Connection(client) => client.remote_addr,
        }
    }

    /// Transport that delivered the message.
    pub fn origin(&self) -> Origin {
        match self {
            Self::Multicast(_) => Origin::Multicast,
            Self::Connection(_) => Origin::Connection,
        }
    }

    /// Stream over the payload following the type id.
    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Unpin + Send) {
        match self {
            Self::Multicast(client) => &mut client.payload,
            Self::Connection(client) => &mut client.reader,
        }
    }

    /// Stream back to the peer; `None` for multicast.
    pub fn writer(&mut self) -> Option<&mut (dyn AsyncWrite + Unpin + Send)> {
        match self {
            Self::Multicast(_) => None,
            Self::Connection(client) => Some(&mut client.writer),
        }
    }

    /// Decode the next message frame.
    pub async fn read_message<M: Message>(&mut self) -> Result<M, NetworkError> {
        wire::read_message(self.reader()).await
    }

    /// Read whatever remains of the payload.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, NetworkError> {
        let mut rest = Vec::new();
        self.reader().read_to_end(&mut rest).await?;
        Ok(rest)
    }
}

/// Payload of one multicast datagram.
#[derive(Debug)]
pub struct MulticastRemoteClient {
    type_id: MessageTypeId,
    remote_addr: SocketAddr,
    payload: Cursor<Vec<u8>>,
}

impl MulticastRemoteClient {
    pub(crate) fn new(type_id: MessageTypeId, remote_addr: SocketAddr, payload: Vec<u8>) -> Self {
        Self {
            type_id,
            remote_addr,
            payload: Cursor::new(payload),
        }
    }
}

/// An accepted connection that passed the handshake.
#[derive(Debug)]
pub struct ConnectionRemoteClient {
    type_id: MessageTypeId,
    remote_addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ConnectionRemoteClient {
    pub(crate) fn new(type_id: MessageTypeId, remote_addr: SocketAddr, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            type_id,
            remote_addr,
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }
}
