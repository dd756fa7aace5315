//! Minimal message-loop actor runtime.
//!
//! Each actor owns its state and processes one message at a time, so no
//! per-task field needs synchronization. Handles are cheap clones over the
//! actor's mailbox. There is no restart machinery: a task execution actor is
//! a single-shot lifecycle, and `on_stop` is the place to finalize.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of an actor.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` to stop
    /// with a fault. Either way `on_stop` runs before the actor exits.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called once before the first message.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to exit, on every path.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context handed to actors during message handling.
pub struct ActorContext {
    pub actor_id: String,
    pub shutdown: watch::Receiver<bool>,
    pub messages_processed: u64,
}

impl ActorContext {
    fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            shutdown,
            messages_processed: 0,
        }
    }
}

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// The actor cannot make further progress and must terminate.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// The actor has already stopped.
    #[error("actor stopped")]
    ActorStopped,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

// Manual impl: handles are cloneable even when the message type is not.
impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish_non_exhaustive()
    }
}

impl<M: Message> ActorHandle<M> {
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }

    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Type-erased reference to a spawned actor's task.
pub struct ActorRef {
    pub actor_id: String,
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop after its current message.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately, skipping `on_stop`.
    pub fn abort(&self) {
        self.task_handle.abort();
    }
}

/// Spawns an actor onto the runtime and returns its handle and reference.
pub fn spawn_actor<A: Actor>(actor: A, mailbox_size: usize) -> (ActorHandle<A::Message>, ActorRef) {
    let actor_id = format!("{}_{}", actor.name(), next_actor_seq());
    let (tx, rx) = mpsc::channel(mailbox_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_id = actor_id.clone();
    let task_handle = tokio::spawn(async move {
        run_actor_loop(actor, rx, shutdown_rx, loop_id).await;
    });

    let actor_ref = ActorRef {
        actor_id: actor_id.clone(),
        task_handle,
        shutdown_tx,
    };

    (ActorHandle { tx, actor_id }, actor_ref)
}

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "actor failed to start");
        actor.on_stop(&mut ctx).await;
        return;
    }

    debug!(actor_id = %actor_id, "actor started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(actor_id = %actor_id, "actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        ctx.messages_processed += 1;
                        match actor.handle(msg, &mut ctx).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(actor_id = %actor_id, "actor requested stop");
                                break;
                            }
                            Err(e) => {
                                error!(actor_id = %actor_id, error = %e, "actor fault");
                                break;
                            }
                        }
                    }
                    None => {
                        debug!(actor_id = %actor_id, "actor mailbox closed");
                        break;
                    }
                }
            }
        }
    }

    actor.on_stop(&mut ctx).await;

    debug!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "actor stopped"
    );
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = rand_jitter(delay * self.jitter);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Simple jitter using a basic LCG (for no external deps).
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

static ACTOR_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

fn next_actor_seq() -> u64 {
    ACTOR_SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
}
