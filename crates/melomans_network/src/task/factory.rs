//! Task factory: builds broadcast and addressed tasks for a message.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use super::{AddressedDelivery, BroadcastDelivery, Delivery, NetworkTask};
use crate::config::NetworkSettings;
use crate::message::{Message, MessageService, MessageTypeId};
use crate::peer::{Meloman, Target};

/// Creates [`NetworkTask`]s bound to the router's settings and id derivation.
#[derive(Clone)]
pub struct TaskFactory {
    settings: Arc<NetworkSettings>,
    messages: Arc<dyn MessageService>,
}

impl TaskFactory {
    /// Create a factory.
    pub fn new(settings: Arc<NetworkSettings>, messages: Arc<dyn MessageService>) -> Self {
        Self { settings, messages }
    }

    /// Routing key of message type `M`.
    pub fn type_id_of<M: Message>(&self) -> MessageTypeId {
        self.messages.type_id(&M::definition())
    }

    /// A task sending `message` as one datagram to `group` through `socket`.
    pub fn create_multicast_task<M: Message>(
        &self,
        message: Arc<M>,
        socket: Arc<UdpSocket>,
        group: SocketAddr,
    ) -> NetworkTask<M> {
        let delivery = Delivery::Broadcast(BroadcastDelivery::new(
            socket,
            group,
            self.settings.buffer_size,
        ));
        NetworkTask::new(Target::All, self.type_id_of::<M>(), message, delivery)
    }

    /// A task delivering `message` to one peer over a fresh connection.
    pub fn create_address_task<M: Message>(&self, peer: Meloman, message: Arc<M>) -> NetworkTask<M> {
        let delivery = Delivery::Addressed(AddressedDelivery::new(
            peer.address,
            self.settings.connect_timeout,
            self.settings.handshake_timeout,
            self.settings.buffer_size,
        ));
        NetworkTask::new(Target::Peer(peer), self.type_id_of::<M>(), message, delivery)
    }

    /// Lazily create one addressed task per peer, all sharing `message`.
    pub fn create_address_tasks<M, I>(&self, peers: I, message: Arc<M>) -> PeerTasks<M, I::IntoIter>
    where
        M: Message,
        I: IntoIterator<Item = Meloman>,
    {
        PeerTasks {
            factory: self.clone(),
            message,
            peers: peers.into_iter(),
        }
    }
}

impl std::fmt::Debug for TaskFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFactory")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// One addressed task per input peer, created on demand.
///
/// Each element is a distinct delivery attempt; the sequence is not restartable.
pub struct PeerTasks<M, I> {
    factory: TaskFactory,
    message: Arc<M>,
    peers: I,
}

impl<M, I> Iterator for PeerTasks<M, I>
where
    M: Message,
    I: Iterator<Item = Meloman>,
{
    type Item = NetworkTask<M>;

    fn next(&mut self) -> Option<Self::Item> {
        let peer = self.peers.next()?;
        Some(
            self.factory
                .create_address_task(peer, Arc::clone(&self.message)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.peers.size_hint()
    }
}

impl<M, I> ExactSizeIterator for PeerTasks<M, I>
where
    M: Message,
    I: ExactSizeIterator<Item = Meloman>,
{
}
