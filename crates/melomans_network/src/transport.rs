//! Transport adapters: the multicast socket and the point-to-point listener.
//!
//! Both adapters run a background loop on the tokio runtime that hands every
//! datagram / accepted connection to the router's [`Dispatcher`] on its own
//! task, so a fault in one never reaches the loop. Loops exit when the
//! shutdown signal fires, releasing their sockets.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkSettings;
use crate::error::NetworkError;
use crate::router::Dispatcher;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the point-to-point listener on all interfaces.
pub async fn bind_listener(port: u16) -> Result<TcpListener, NetworkError> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    TcpListener::bind(addr)
        .await
        .map_err(|e| NetworkError::Transport(format!("Listener bind on {addr} failed: {e}")))
}

/// Bind the multicast socket and join the configured group.
///
/// A non-multicast group address (unicast or broadcast) is used as a plain
/// datagram destination without joining.
pub async fn bind_multicast(settings: &NetworkSettings) -> Result<UdpSocket, NetworkError> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, settings.multicast_port);
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| NetworkError::Transport(format!("Multicast bind on {addr} failed: {e}")))?;

    let group = settings.multicast_address;
    if group.is_multicast() {
        socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| NetworkError::Transport(format!("Join {group} failed: {e}")))?;
        socket.set_multicast_ttl_v4(settings.multicast_ttl)?;
        socket.set_multicast_loop_v4(true)?;
        debug!("Joined multicast group {group} (ttl {})", settings.multicast_ttl);
    } else {
        if group.is_broadcast() {
            socket.set_broadcast(true)?;
        }
        socket.set_ttl(settings.multicast_ttl)?;
        debug!("Group address {group} is not multicast, sending datagrams directly");
    }

    Ok(socket)
}

/// Accept connections until shutdown, dispatching each on its own task.
pub async fn run_listener(
    listener: TcpListener,
    dispatcher: Dispatcher,
    mut shutdown: broadcast::Receiver<()>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("Point-to-point listener on {addr}"),
        Err(e) => warn!("Listener address unavailable: {e}"),
    }

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            match dispatcher.connection(stream, peer_addr).await {
                                Ok(outcome) => trace!("Connection from {peer_addr}: {outcome:?}"),
                                Err(e) => debug!("Connection from {peer_addr} failed: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                        // Back off so a persistent failure (e.g. EMFILE) doesn't spin.
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Point-to-point listener shutting down");
                break;
            }
        }
    }
}

/// Receive datagrams until shutdown, dispatching each on its own task.
pub async fn run_multicast_receiver(
    socket: Arc<UdpSocket>,
    dispatcher: Dispatcher,
    buffer_size: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; buffer_size.max(crate::wire::TYPE_ID_SIZE)];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src_addr)) => {
                        let datagram = buf[..len].to_vec();
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            match dispatcher.datagram(datagram, src_addr).await {
                                Ok(outcome) => trace!("Datagram from {src_addr}: {outcome:?}"),
                                Err(e) => debug!("Datagram from {src_addr} dropped: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Multicast recv error: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!("Multicast receiver shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
