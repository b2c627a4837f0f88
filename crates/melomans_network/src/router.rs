//! NetworkRouter: subscriptions, inbound dispatch and outbound task creation.
//!
//! The router owns the [`SubscriptionRegistry`] and the two transport loops.
//! Inbound bytes are classified by their leading [`MessageTypeId`] and handed
//! to the matching subscription; point-to-point connections for unknown ids
//! are refused with `AccessDenied`.

use std::future::Future;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::config::NetworkSettings;
use crate::error::NetworkError;
use crate::message::{DefinitionHasher, Message, MessageService, MessageTypeId};
use crate::peer::Meloman;
use crate::remote::{ConnectionRemoteClient, MulticastRemoteClient, RemoteClient};
use crate::subscription::{Subscription, SubscriptionHandler, SubscriptionRegistry};
use crate::task::{NetworkTask, PeerTasks, TaskFactory};
use crate::transport;
use crate::wire::{self, HandshakeStatus};

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// What happened to one inbound datagram or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A subscription handler ran.
    Delivered,
    /// The connection was refused with `AccessDenied`.
    Rejected,
}

/// Routes inbound traffic to the registry. Cloned into every receive loop.
#[derive(Clone)]
pub struct Dispatcher {
    registry: SubscriptionRegistry,
    handshake_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: SubscriptionRegistry, handshake_timeout: Duration) -> Self {
        Self {
            registry,
            handshake_timeout,
        }
    }

    /// Dispatch one multicast datagram.
    ///
    /// Datagrams without a type id, or whose id has no subscription, are
    /// returned as errors for the receive loop to log and drop.
    pub async fn datagram(
        &self,
        datagram: Vec<u8>,
        from: SocketAddr,
    ) -> Result<DispatchOutcome, NetworkError> {
        let (id, payload) = wire::split_type_id(&datagram)?;
        let Some(route) = self.registry.lookup(id) else {
            return Err(NetworkError::Unroutable(id));
        };

        trace!("Datagram {id} from {from} -> '{}'", route.definition().name);
        let client = RemoteClient::Multicast(MulticastRemoteClient::new(id, from, payload.to_vec()));
        if let Err(e) = route.invoke(client).await {
            warn!("Handler for '{}' failed: {e}", route.definition().name);
        }
        Ok(DispatchOutcome::Delivered)
    }

    /// Run the access handshake on an accepted connection and dispatch it.
    pub async fn connection(
        &self,
        mut stream: TcpStream,
        from: SocketAddr,
    ) -> Result<DispatchOutcome, NetworkError> {
        let id = tokio::time::timeout(self.handshake_timeout, wire::read_type_id(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout(self.handshake_timeout))??;

        let Some(route) = self.registry.lookup(id) else {
            debug!("Refusing {id} from {from}");
            wire::write_status(&mut stream, HandshakeStatus::AccessDenied).await?;
            stream.shutdown().await?;
            return Ok(DispatchOutcome::Rejected);
        };

        wire::write_status(&mut stream, HandshakeStatus::Ok).await?;
        trace!("Connection {id} from {from} -> '{}'", route.definition().name);

        let client = RemoteClient::Connection(ConnectionRemoteClient::new(id, from, stream));
        if let Err(e) = route.invoke(client).await {
            warn!("Handler for '{}' failed: {e}", route.definition().name);
        }
        Ok(DispatchOutcome::Delivered)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

struct Transports {
    multicast: Arc<UdpSocket>,
    multicast_target: SocketAddr,
    listen_addr: SocketAddr,
}

/// The melomans router.
///
/// Create one per process, call [`initialize`](NetworkRouter::initialize) to
/// bind the transports, then subscribe and publish. Dropping the router shuts
/// the transport loops down.
pub struct NetworkRouter {
    settings: Arc<NetworkSettings>,
    messages: Arc<dyn MessageService>,
    registry: SubscriptionRegistry,
    factory: TaskFactory,
    transports: Option<Transports>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    disposed: bool,
}

impl NetworkRouter {
    /// Create a router. No I/O happens until [`initialize`](Self::initialize).
    pub fn new(settings: NetworkSettings, messages: Arc<dyn MessageService>) -> Self {
        let settings = Arc::new(settings);
        let factory = TaskFactory::new(Arc::clone(&settings), Arc::clone(&messages));
        Self {
            settings,
            messages,
            registry: SubscriptionRegistry::new(),
            factory,
            transports: None,
            shutdown_tx: None,
            disposed: false,
        }
    }

    /// Create a router with default settings and [`DefinitionHasher`] ids.
    pub fn with_defaults() -> Self {
        Self::new(NetworkSettings::default(), Arc::new(DefinitionHasher))
    }

    /// The router's settings.
    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Bind both transports and start their loops.
    ///
    /// Returns the bound listener address, useful when `listen_port` is 0.
    pub async fn initialize(&mut self) -> Result<SocketAddr, NetworkError> {
        if self.disposed {
            return Err(NetworkError::InvalidState("router has been shut down".into()));
        }
        if self.transports.is_some() {
            return Err(NetworkError::InvalidState("router already initialized".into()));
        }

        let listener = transport::bind_listener(self.settings.listen_port).await?;
        let multicast = Arc::new(transport::bind_multicast(&self.settings).await?);
        let listen_addr = listener.local_addr()?;
        let multicast_target = SocketAddr::V4(SocketAddrV4::new(
            self.settings.multicast_address,
            multicast.local_addr()?.port(),
        ));

        let (shutdown_tx, _) = broadcast::channel(4);
        let dispatcher = Dispatcher::new(self.registry.clone(), self.settings.handshake_timeout);

        tokio::spawn(transport::run_listener(
            listener,
            dispatcher.clone(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(transport::run_multicast_receiver(
            Arc::clone(&multicast),
            dispatcher,
            self.settings.buffer_size,
            shutdown_tx.subscribe(),
        ));

        info!("Router listening on {listen_addr}, multicast group {multicast_target}");
        self.shutdown_tx = Some(shutdown_tx);
        self.transports = Some(Transports {
            multicast,
            multicast_target,
            listen_addr,
        });
        Ok(listen_addr)
    }

    /// Subscribe `handler` to message type `M`.
    ///
    /// The handler receives the remote client positioned after the type id.
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe<M, F, Fut>(&self, handler: F) -> Result<Subscription, NetworkError>
    where
        M: Message,
        F: Fn(RemoteClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetworkError>> + Send + 'static,
    {
        let definition = M::definition();
        let id = self.messages.type_id(&definition);
        let handler: SubscriptionHandler = Arc::new(move |client| handler(client).boxed());
        self.registry.insert(id, definition, handler)
    }

    /// Subscribe to `M` with the first message frame already decoded.
    pub fn on_message<M, F, Fut>(&self, handler: F) -> Result<Subscription, NetworkError>
    where
        M: Message,
        F: Fn(M, RemoteClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetworkError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.subscribe::<M, _, _>(move |mut client| {
            let handler = Arc::clone(&handler);
            async move {
                let message = client.read_message::<M>().await?;
                handler(message, client).await
            }
        })
    }

    /// A broadcast task sending `message` to the multicast group.
    ///
    /// Nothing is sent until the task is run.
    pub fn publish<M: Message>(&self, message: M) -> Result<NetworkTask<M>, NetworkError> {
        let transports = self.transports.as_ref().ok_or(NetworkError::NotRunning)?;
        Ok(self.factory.create_multicast_task(
            Arc::new(message),
            Arc::clone(&transports.multicast),
            transports.multicast_target,
        ))
    }

    /// One addressed task per peer, all sharing `message`.
    pub fn publish_for<M, I>(&self, peers: I, message: M) -> PeerTasks<M, I::IntoIter>
    where
        M: Message,
        I: IntoIterator<Item = Meloman>,
    {
        self.factory.create_address_tasks(peers, Arc::new(message))
    }

    /// Stop both transport loops. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if self.transports.take().is_some() {
            info!("Router shut down");
        }
    }

    /// Whether the transports are bound and running.
    pub fn is_running(&self) -> bool {
        self.transports.is_some()
    }

    /// Bound listener address, once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transports.as_ref().map(|t| t.listen_addr)
    }

    /// Destination of broadcast tasks, once initialized.
    pub fn multicast_target(&self) -> Option<SocketAddr> {
        self.transports.as_ref().map(|t| t.multicast_target)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether a live subscription exists for `id`.
    pub fn is_subscribed(&self, id: MessageTypeId) -> bool {
        self.registry.contains(id)
    }

    /// Routing key of message type `M`.
    pub fn type_id_of<M: Message>(&self) -> MessageTypeId {
        self.factory.type_id_of::<M>()
    }

    /// The router's registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// The router's task factory.
    pub fn factory(&self) -> &TaskFactory {
        &self.factory
    }
}

impl Drop for NetworkRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
