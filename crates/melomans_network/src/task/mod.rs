//! Network tasks: single-use, cancellable outbound deliveries.
//!
//! A [`NetworkTask`] carries one message to one target. Hooks are attached
//! through consuming builder methods, then [`NetworkTask::run`] consumes the
//! task and drives it through
//! `Created → Running → {Succeeded, Faulted, Cancelled} → Finalized`.
//!
//! Where the bytes go is decided by the task's [`Delivery`] strategy.

mod delivery;
mod factory;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::NetworkError;
use crate::message::{Message, MessageTypeId};
use crate::peer::Target;
use crate::wire;

pub use delivery::{AddressedDelivery, BroadcastDelivery, Delivery};
pub use factory::{PeerTasks, TaskFactory};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Running = 1,
    Succeeded = 2,
    Faulted = 3,
    Cancelled = 4,
    Finalized = 5,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Succeeded,
            3 => Self::Faulted,
            4 => Self::Cancelled,
            _ => Self::Finalized,
        }
    }

    /// Whether the run has produced its result.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Faulted | Self::Cancelled | Self::Finalized
        )
    }
}

/// Result of one run, mirroring the terminal hook that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Faulted,
    Cancelled,
}

/// Progress of a streamed body.
#[derive(Debug)]
pub struct ProgressInfo<M> {
    /// The message being delivered.
    pub message: Arc<M>,
    /// Body bytes written so far.
    pub bytes_sent: u64,
    /// Total body length, when the stream provider knows it.
    pub total_bytes: Option<u64>,
}

impl<M> Clone for ProgressInfo<M> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            bytes_sent: self.bytes_sent,
            total_bytes: self.total_bytes,
        }
    }
}

/// Raw bytes streamed after the message frame of an addressed delivery.
pub struct BodyStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    len: Option<u64>,
}

impl BodyStream {
    /// Wrap a reader of unknown length.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            len: None,
        }
    }

    /// Declare the total length for progress reports.
    pub fn with_len(mut self, len: u64) -> Self {
        self.len = Some(len);
        self
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream").field("len", &self.len).finish()
    }
}

type MessageHook<M> = Box<dyn FnOnce(&M) + Send>;
type ExceptionHook = Box<dyn FnOnce(NetworkError) + Send>;
type ReportHook<M> = Box<dyn FnMut(ProgressInfo<M>) + Send>;
type StreamProvider<M> = Box<dyn FnOnce(&M) -> Option<BodyStream> + Send>;

struct TaskHooks<M> {
    on_start: Option<MessageHook<M>>,
    on_success: Option<MessageHook<M>>,
    on_exception: Option<ExceptionHook>,
    on_cancelled: Option<MessageHook<M>>,
    on_finally: Option<MessageHook<M>>,
    on_report: Option<ReportHook<M>>,
    stream: Option<StreamProvider<M>>,
}

impl<M> Default for TaskHooks<M> {
    fn default() -> Self {
        Self {
            on_start: None,
            on_success: None,
            on_exception: None,
            on_cancelled: None,
            on_finally: None,
            on_report: None,
            stream: None,
        }
    }
}

#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TaskState::Created as u8)))
    }

    fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Cancels a task from another task or thread while it runs.
#[derive(Debug, Clone)]
pub struct TaskCanceller {
    token: CancellationToken,
    state: SharedState,
}

impl TaskCanceller {
    /// Request cooperative cancellation. No effect once the run has finished.
    pub fn cancel(&self) {
        if !self.state.get().is_terminal() {
            self.token.cancel();
        }
    }

    /// Current lifecycle state of the task.
    pub fn state(&self) -> TaskState {
        self.state.get()
    }
}

/// One delivery attempt of one message to one target.
pub struct NetworkTask<M: Message> {
    id: Uuid,
    target: Target,
    type_id: MessageTypeId,
    message: Arc<M>,
    delivery: Delivery,
    hooks: TaskHooks<M>,
    cancel: CancellationToken,
    state: SharedState,
}

impl<M: Message> NetworkTask<M> {
    /// Create a task in the `Created` state.
    pub fn new(target: Target, type_id: MessageTypeId, message: Arc<M>, delivery: Delivery) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            type_id,
            message,
            delivery,
            hooks: TaskHooks::default(),
            cancel: CancellationToken::new(),
            state: SharedState::new(),
        }
    }

    /// Unique id of this task, used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Where the message is going.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Routing key written ahead of the message.
    pub fn type_id(&self) -> MessageTypeId {
        self.type_id
    }

    /// The message carried by this task.
    pub fn message(&self) -> &Arc<M> {
        &self.message
    }

    /// The delivery strategy.
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Whether cancellation has been requested.
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cooperative cancellation before the task runs.
    pub fn cancel(&self) {
        if !self.state.get().is_terminal() {
            self.cancel.cancel();
        }
    }

    /// A handle that can cancel this task while [`run`](Self::run) is in progress.
    pub fn canceller(&self) -> TaskCanceller {
        TaskCanceller {
            token: self.cancel.clone(),
            state: self.state.clone(),
        }
    }

    // -- Hooks --------------------------------------------------------------

    /// Called before delivery starts.
    pub fn on_start(mut self, hook: impl FnOnce(&M) + Send + 'static) -> Self {
        self.hooks.on_start = Some(Box::new(hook));
        self
    }

    /// Called when delivery completed.
    pub fn on_success(mut self, hook: impl FnOnce(&M) + Send + 'static) -> Self {
        self.hooks.on_success = Some(Box::new(hook));
        self
    }

    /// Called with the failure when delivery faulted.
    pub fn on_exception(mut self, hook: impl FnOnce(NetworkError) + Send + 'static) -> Self {
        self.hooks.on_exception = Some(Box::new(hook));
        self
    }

    /// Called when cancellation was observed.
    pub fn on_cancelled(mut self, hook: impl FnOnce(&M) + Send + 'static) -> Self {
        self.hooks.on_cancelled = Some(Box::new(hook));
        self
    }

    /// Called after the terminal hook, on every path.
    pub fn on_finally(mut self, hook: impl FnOnce(&M) + Send + 'static) -> Self {
        self.hooks.on_finally = Some(Box::new(hook));
        self
    }

    /// Called after each streamed body chunk.
    pub fn on_report(mut self, hook: impl FnMut(ProgressInfo<M>) + Send + 'static) -> Self {
        self.hooks.on_report = Some(Box::new(hook));
        self
    }

    /// Supplies raw bytes to stream after the message frame.
    ///
    /// Only addressed deliveries consult the provider, and only after the peer
    /// answered `Ok`; a datagram carries the frame alone.
    pub fn with_stream(
        mut self,
        provider: impl FnOnce(&M) -> Option<BodyStream> + Send + 'static,
    ) -> Self {
        self.hooks.stream = Some(Box::new(provider));
        self
    }

    // -- Run ----------------------------------------------------------------

    /// Execute the delivery, routing every result to the hooks.
    ///
    /// Never returns an error: the outcome says which terminal hook fired.
    pub async fn run(self) -> TaskOutcome {
        let NetworkTask {
            id,
            target,
            type_id,
            message,
            delivery,
            hooks,
            cancel,
            state,
        } = self;
        let TaskHooks {
            on_start,
            on_success,
            on_exception,
            on_cancelled,
            on_finally,
            mut on_report,
            stream,
        } = hooks;

        state.set(TaskState::Running);
        debug!("Task {id}: delivering {type_id} to {target}");

        if let Some(hook) = on_start {
            hook(&message);
        }

        let result = execute(
            type_id,
            &message,
            &delivery,
            &cancel,
            stream,
            &mut on_report,
        )
        .await;

        let outcome = match result {
            Ok(()) => {
                state.set(TaskState::Succeeded);
                debug!("Task {id}: delivered to {target}");
                if let Some(hook) = on_success {
                    hook(&message);
                }
                TaskOutcome::Succeeded
            }
            Err(NetworkError::Cancelled) => {
                state.set(TaskState::Cancelled);
                debug!("Task {id}: cancelled");
                if let Some(hook) = on_cancelled {
                    hook(&message);
                }
                TaskOutcome::Cancelled
            }
            Err(e) => {
                state.set(TaskState::Faulted);
                warn!("Task {id}: delivery to {target} failed: {e}");
                if let Some(hook) = on_exception {
                    hook(e);
                }
                TaskOutcome::Faulted
            }
        };

        if let Some(hook) = on_finally {
            hook(&message);
        }
        drop(on_report);
        drop(cancel);
        state.set(TaskState::Finalized);
        outcome
    }
}

async fn execute<M: Message>(
    type_id: MessageTypeId,
    message: &Arc<M>,
    delivery: &Delivery,
    cancel: &CancellationToken,
    stream: Option<StreamProvider<M>>,
    on_report: &mut Option<ReportHook<M>>,
) -> Result<(), NetworkError> {
    if cancel.is_cancelled() {
        return Err(NetworkError::Cancelled);
    }

    let frame = wire::encode_frame(message.as_ref())?;
    let body = stream.map(|provider| {
        let provide: delivery::BodyProvider<'_> = Box::new(move || provider(message.as_ref()));
        provide
    });

    let mut progress = |bytes_sent: u64, total_bytes: Option<u64>| {
        if let Some(report) = on_report.as_mut() {
            report(ProgressInfo {
                message: Arc::clone(message),
                bytes_sent,
                total_bytes,
            });
        }
    };

    delivery
        .deliver(delivery::Outbound {
            type_id,
            frame: &frame,
            body,
            cancel,
            progress: &mut progress,
        })
        .await
}

impl<M: Message> fmt::Debug for NetworkTask<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkTask")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("type_id", &self.type_id)
            .field("state", &self.state.get())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
