//! Per-user inbound message coalescing.
//!
//! Rapid consecutive messages from one user are buffered until the user has
//! been quiet for the configured period, then handed to the [`TurnHandler`]
//! as a single [`Turn`]. Every new message restarts the user's timer.
//!
//! Each user's buffer carries a generation counter. A timer only flushes if
//! its generation is still current when it fires, so a timer that was aborted
//! too late to stop it never flushes a partial or stale buffer.

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::{Attachment, InboundMessage, UserId};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;

/// One logical user turn: every message from a burst, combined.
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_id: UserId,
    /// Message texts joined with `\n` in arrival order.
    pub text: String,
    /// Attachments from all messages, in arrival order.
    pub attachments: Vec<Attachment>,
    /// The raw messages, oldest first. Never empty.
    pub messages: Vec<InboundMessage>,
}

impl Turn {
    /// Combine buffered messages into one turn.
    pub fn combine(user_id: UserId, messages: Vec<InboundMessage>) -> Self {
        let text = messages
            .iter()
            .map(|message| message.content.prompt_text())
            .collect::<Vec<_>>()
            .join("\n");
        let attachments = messages
            .iter()
            .flat_map(|message| message.content.attachments().iter().cloned())
            .collect();

        Self {
            user_id,
            text,
            attachments,
            messages,
        }
    }

    /// The message replies should be addressed to (the latest one).
    pub fn reply_target(&self) -> Option<&InboundMessage> {
        self.messages.last()
    }
}

/// Consumer of coalesced turns.
pub trait TurnHandler: Send + Sync + 'static {
    /// Process one combined turn. Errors are logged by the coalescer; any
    /// user-facing reaction belongs to the handler.
    fn handle(&self, turn: Turn) -> impl Future<Output = Result<()>> + Send;
}

/// Buffered state for one user.
#[derive(Default)]
struct PendingBuffer {
    queued: Vec<InboundMessage>,
    /// Bumped on every submit; a timer flushes only if it still matches.
    generation: u64,
    pending_flush: Option<AbortHandle>,
}

type Buffers = Arc<Mutex<HashMap<UserId, PendingBuffer>>>;

/// Debounces inbound messages per user and dispatches combined turns.
pub struct Coalescer<H: TurnHandler> {
    handler: Arc<H>,
    runtime_config: Arc<RuntimeConfig>,
    buffers: Buffers,
    turns: TaskTracker,
}

impl<H: TurnHandler> Coalescer<H> {
    pub fn new(handler: Arc<H>, runtime_config: Arc<RuntimeConfig>) -> Self {
        Self {
            handler,
            runtime_config,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            turns: TaskTracker::new(),
        }
    }

    /// Queue a message and restart the user's quiet-period timer.
    ///
    /// Returns as soon as the message is buffered. Turns already flushed for
    /// this user keep running.
    pub async fn submit(&self, user_id: UserId, message: InboundMessage) {
        let quiet_period = self.runtime_config.coalesce.load().quiet_period();
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.entry(user_id.clone()).or_default();

        buffer.queued.push(message);
        buffer.generation = buffer.generation.wrapping_add(1);
        if let Some(stale) = buffer.pending_flush.take() {
            stale.abort();
        }

        let generation = buffer.generation;
        let queued = buffer.queued.len();
        let user_key = user_id.clone();
        let buffers_handle = self.buffers.clone();
        let handler = self.handler.clone();
        let turns = self.turns.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            let turn = {
                let mut buffers = buffers_handle.lock().await;
                take_turn(&mut buffers, &user_id, Some(generation))
            };
            if let Some(turn) = turn {
                spawn_turn(&turns, handler, turn);
            }
        });
        buffer.pending_flush = Some(timer.abort_handle());

        tracing::debug!(
            user_id = %user_key,
            queued,
            quiet_period_ms = quiet_period.as_millis() as u64,
            "message buffered"
        );
    }

    /// Whether a flush is currently scheduled for `user_id`.
    pub async fn is_pending(&self, user_id: &str) -> bool {
        self.buffers
            .lock()
            .await
            .get(user_id)
            .is_some_and(|buffer| buffer.pending_flush.is_some())
    }

    /// Flush every buffered user immediately and wait for all turns to finish.
    ///
    /// Pending timers are cancelled. Messages submitted after this call are
    /// still accepted and flushed normally.
    pub async fn shutdown(&self) {
        let turns: Vec<Turn> = {
            let mut buffers = self.buffers.lock().await;
            let user_ids: Vec<UserId> = buffers.keys().cloned().collect();
            user_ids
                .iter()
                .filter_map(|user_id| take_turn(&mut buffers, user_id, None))
                .collect()
        };

        if !turns.is_empty() {
            tracing::info!(count = turns.len(), "flushing buffered turns on shutdown");
        }
        for turn in turns {
            spawn_turn(&self.turns, self.handler.clone(), turn);
        }

        self.turns.close();
        self.turns.wait().await;
        self.turns.reopen();
    }
}

/// Take the user's queued messages as a turn.
///
/// With `Some(generation)`, only succeeds if that timer is still the current
/// one. With `None`, flushes unconditionally and cancels any pending timer.
fn take_turn(
    buffers: &mut HashMap<UserId, PendingBuffer>,
    user_id: &str,
    generation: Option<u64>,
) -> Option<Turn> {
    let buffer = buffers.get_mut(user_id)?;

    match generation {
        Some(generation) if generation != buffer.generation => {
            tracing::trace!(user_id, generation, "stale flush ignored");
            return None;
        }
        Some(_) => {
            buffer.pending_flush = None;
        }
        None => {
            if let Some(timer) = buffer.pending_flush.take() {
                timer.abort();
            }
        }
    }

    if buffer.queued.is_empty() {
        return None;
    }

    let messages = std::mem::take(&mut buffer.queued);
    Some(Turn::combine(user_id.to_string(), messages))
}

/// Run the handler for one turn on its own task.
fn spawn_turn<H: TurnHandler>(turns: &TaskTracker, handler: Arc<H>, turn: Turn) {
    let user_id = turn.user_id.clone();
    let message_count = turn.messages.len();
    tracing::debug!(%user_id, message_count, "dispatching coalesced turn");

    turns.spawn(async move {
        if let Err(error) = handler.handle(turn).await {
            tracing::error!(%error, %user_id, "turn handler failed");
        }
    });
}
