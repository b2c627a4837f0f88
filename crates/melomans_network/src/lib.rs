//! Melomans Network: typed message routing over multicast and TCP.
//!
//! This crate lets processes on a LAN exchange typed messages. Every message
//! type maps to an 8-byte [`MessageTypeId`]; the router classifies inbound
//! bytes by that id and hands them to the matching subscription.
//!
//! # Architecture
//!
//! - **Transport**: one UDP multicast socket for broadcast traffic and one TCP
//!   listener for point-to-point deliveries.
//! - **Handshake**: a TCP dialer writes the type id; the listener answers `Ok`
//!   when a subscription exists, `AccessDenied` otherwise.
//! - **Tasks**: outbound work is a single-use [`NetworkTask`] with lifecycle
//!   hooks, cooperative cancellation and progress reports.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use melomans_network::{AccessGroup, Message, MessageDefinition, NetworkRouter};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Play { track: String }
//!
//! impl Message for Play {
//!     fn definition() -> MessageDefinition {
//!         MessageDefinition::new("play", 1, AccessGroup::ManipulatePlayer).with_fields(["track"])
//!     }
//! }
//!
//! # async fn example() -> Result<(), melomans_network::NetworkError> {
//! let mut router = NetworkRouter::with_defaults();
//! router.initialize().await?;
//!
//! let _sub = router.on_message::<Play, _, _>(|play, _client| async move {
//!     println!("playing {}", play.track);
//!     Ok(())
//! })?;
//!
//! router.publish(Play { track: "intro.flac".into() })?.run().await;
//! router.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod peer;
pub mod remote;
pub mod router;
pub mod subscription;
pub mod task;
pub mod transport;
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkSettings;
pub use error::NetworkError;
pub use message::{AccessGroup, DefinitionHasher, Message, MessageDefinition, MessageService, MessageTypeId};
pub use peer::{Meloman, Target};
pub use remote::{Origin, RemoteClient};
pub use router::NetworkRouter;
pub use subscription::{Subscription, SubscriptionRegistry};
pub use task::{
    BodyStream, NetworkTask, ProgressInfo, TaskCanceller, TaskFactory, TaskOutcome, TaskState,
};
