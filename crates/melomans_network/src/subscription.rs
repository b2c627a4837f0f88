//! Subscription registry: routes keyed by message type id.
//!
//! The registry is an explicitly owned object shared by the router and its
//! receive loops. Reads (inbound dispatch) and writes (subscribe / drop of a
//! [`Subscription`]) go through one `parking_lot::RwLock`; dispatch clones the
//! matched route and releases the lock before awaiting the handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::NetworkError;
use crate::message::{MessageDefinition, MessageTypeId};
use crate::remote::RemoteClient;

/// A handler invoked with the remote client of a matched inbound message.
pub type SubscriptionHandler =
    Arc<dyn Fn(RemoteClient) -> BoxFuture<'static, Result<(), NetworkError>> + Send + Sync>;

type RouteTable = RwLock<HashMap<MessageTypeId, Route>>;

/// A live registry entry.
#[derive(Clone)]
pub struct Route {
    token: u64,
    definition: MessageDefinition,
    handler: SubscriptionHandler,
}

impl Route {
    /// Definition of the subscribed message type.
    pub fn definition(&self) -> &MessageDefinition {
        &self.definition
    }

    /// Invoke the handler with the remote client.
    pub fn invoke(&self, client: RemoteClient) -> BoxFuture<'static, Result<(), NetworkError>> {
        (self.handler)(client)
    }
}

/// Concurrent map of message type id to route.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    routes: Arc<RouteTable>,
    next_token: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route, rejecting a second subscription for a live id.
    pub fn insert(
        &self,
        id: MessageTypeId,
        definition: MessageDefinition,
        handler: SubscriptionHandler,
    ) -> Result<Subscription, NetworkError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut routes = self.routes.write();
            if routes.contains_key(&id) {
                return Err(NetworkError::DuplicateSubscription(id));
            }
            debug!("Subscribing '{}' as {id}", definition.name);
            routes.insert(
                id,
                Route {
                    token,
                    definition,
                    handler,
                },
            );
        }

        Ok(Subscription {
            id,
            token,
            routes: Arc::downgrade(&self.routes),
        })
    }

    /// Look up the route for an id.
    pub fn lookup(&self, id: MessageTypeId) -> Option<Route> {
        self.routes.read().get(&id).cloned()
    }

    /// Whether a live subscription exists for an id.
    pub fn contains(&self, id: MessageTypeId) -> bool {
        self.routes.read().contains_key(&id)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether the registry has no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Drop every route.
    pub fn clear(&self) {
        self.routes.write().clear();
    }
}

/// Scoped handle to a registry entry; dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    id: MessageTypeId,
    token: u64,
    routes: Weak<RouteTable>,
}

impl Subscription {
    /// The subscribed message type id.
    pub fn id(&self) -> MessageTypeId {
        self.id
    }

    /// Remove the entry now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn release(&mut self) {
        let Some(routes) = self.routes.upgrade() else {
            return;
        };
        let mut routes = routes.write();
        // Only remove the entry this handle created.
        if routes.get(&self.id).is_some_and(|route| route.token == self.token) {
            routes.remove(&self.id);
            debug!("Unsubscribed {}", self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
