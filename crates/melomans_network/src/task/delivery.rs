//! Delivery strategies: where a task's bytes go.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::BodyStream;
use crate::error::NetworkError;
use crate::message::MessageTypeId;
use crate::wire::{self, HandshakeStatus};

/// Largest payload a UDP datagram can carry over IPv4.
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Produces the body stream; only called once the peer has accepted.
pub(crate) type BodyProvider<'a> = Box<dyn FnOnce() -> Option<BodyStream> + Send + 'a>;

/// Everything a delivery needs from the task for one run.
pub(crate) struct Outbound<'a> {
    pub type_id: MessageTypeId,
    pub frame: &'a [u8],
    pub body: Option<BodyProvider<'a>>,
    pub cancel: &'a CancellationToken,
    pub progress: &'a mut (dyn FnMut(u64, Option<u64>) + Send),
}

/// Where the bytes of a [`NetworkTask`](super::NetworkTask) go.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// One datagram to the multicast group.
    Broadcast(BroadcastDelivery),
    /// One connection to one peer, gated by the handshake.
    Addressed(AddressedDelivery),
}

impl Delivery {
    pub(crate) async fn deliver(&self, out: Outbound<'_>) -> Result<(), NetworkError> {
        match self {
            Self::Broadcast(broadcast) => broadcast.deliver(out).await,
            Self::Addressed(addressed) => addressed.deliver(out).await,
        }
    }
}

/// Sends `[type id][frame]` as one datagram.
///
/// Success means the local send completed; multicast has no acknowledgment.
#[derive(Debug, Clone)]
pub struct BroadcastDelivery {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    max_datagram: usize,
}

impl BroadcastDelivery {
    /// Create a broadcast delivery through `socket` to `group`.
    pub fn new(socket: Arc<UdpSocket>, group: SocketAddr, buffer_size: usize) -> Self {
        Self {
            socket,
            group,
            max_datagram: buffer_size.min(MAX_DATAGRAM_SIZE),
        }
    }

    /// Destination of the datagram.
    pub fn group(&self) -> SocketAddr {
        self.group
    }

    async fn deliver(&self, out: Outbound<'_>) -> Result<(), NetworkError> {
        let mut datagram = Vec::with_capacity(wire::TYPE_ID_SIZE + out.frame.len());
        datagram.extend_from_slice(&wire::encode_type_id(out.type_id));
        datagram.extend_from_slice(out.frame);
        if datagram.len() > self.max_datagram {
            return Err(NetworkError::FrameTooLarge {
                size: datagram.len(),
                max: self.max_datagram,
            });
        }

        let sent = guarded(out.cancel, async {
            Ok::<_, NetworkError>(self.socket.send_to(&datagram, self.group).await?)
        })
        .await?;
        trace!("Sent {sent}-byte datagram to {}", self.group);
        Ok(())
    }
}

/// Opens a connection, writes the type id, waits for the handshake status and
/// streams the body.
///
/// Success means the whole body was written and flushed.
#[derive(Debug, Clone)]
pub struct AddressedDelivery {
    peer: SocketAddr,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    chunk_size: usize,
}

impl AddressedDelivery {
    /// Create an addressed delivery to `peer`.
    pub fn new(
        peer: SocketAddr,
        connect_timeout: Duration,
        handshake_timeout: Duration,
        chunk_size: usize,
    ) -> Self {
        Self {
            peer,
            connect_timeout,
            handshake_timeout,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Address of the peer's listener.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn deliver(&self, out: Outbound<'_>) -> Result<(), NetworkError> {
        let Outbound {
            type_id,
            frame,
            body,
            cancel,
            progress,
        } = out;

        let mut stream = guarded(cancel, async {
            let connect = TcpStream::connect(self.peer);
            let stream = with_timeout(self.connect_timeout, async {
                Ok::<_, NetworkError>(connect.await?)
            })
            .await?;
            stream.set_nodelay(true)?;
            Ok::<_, NetworkError>(stream)
        })
        .await?;

        guarded(cancel, async {
            wire::write_type_id(&mut stream, type_id).await?;
            stream.flush().await?;
            Ok::<_, NetworkError>(())
        })
        .await?;

        let status = guarded(
            cancel,
            with_timeout(self.handshake_timeout, wire::read_status(&mut stream)),
        )
        .await?;
        if status == HandshakeStatus::AccessDenied {
            debug!("Peer {} denied {type_id}", self.peer);
            return Err(NetworkError::HandshakeRejected { peer: self.peer });
        }

        let body = body.and_then(|provide| provide());
        guarded(cancel, async { Ok::<_, NetworkError>(stream.write_all(frame).await?) }).await?;

        if let Some(BodyStream { mut reader, len }) = body {
            let mut buf = vec![0u8; self.chunk_size];
            let mut sent = 0u64;
            loop {
                let n = guarded(cancel, async {
                    Ok::<_, NetworkError>(reader.read(&mut buf).await?)
                })
                .await?;
                if n == 0 {
                    break;
                }
                guarded(cancel, async {
                    Ok::<_, NetworkError>(stream.write_all(&buf[..n]).await?)
                })
                .await?;
                sent += n as u64;
                progress(sent, len);
            }
            trace!("Streamed {sent} body bytes to {}", self.peer);
        }

        guarded(cancel, async {
            stream.flush().await?;
            stream.shutdown().await?;
            Ok::<_, NetworkError>(())
        })
        .await
    }
}

/// Run one blocking step, observing the cancellation token before and during it.
pub(crate) async fn guarded<T, F>(cancel: &CancellationToken, step: F) -> Result<T, NetworkError>
where
    F: Future<Output = Result<T, NetworkError>>,
{
    if cancel.is_cancelled() {
        return Err(NetworkError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NetworkError::Cancelled),
        result = step => result,
    }
}

async fn with_timeout<T, F>(limit: Duration, step: F) -> Result<T, NetworkError>
where
    F: Future<Output = Result<T, NetworkError>>,
{
    tokio::time::timeout(limit, step)
        .await
        .map_err(|_| NetworkError::Timeout(limit))?
}
