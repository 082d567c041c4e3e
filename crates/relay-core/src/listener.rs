//! The broadcast listener.
//!
//! One task per relay drains the pub/sub stream. Each notification is only
//! a change signal: the entity's full state is re-read from its hash,
//! stamped with the relay's receipt time, and fanned out to every session.

use relay_protocol::Frame;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sessions::SessionSet;
use crate::snapshot::{now_ms, SnapshotReader};
use crate::store::{Notification, PubSub, StoreError};

/// Listener errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The store connection failed underneath the listener.
    #[error("Listener store failure: {0}")]
    Store(#[from] StoreError),

    /// The listener task panicked.
    #[error("Listener task panicked: {0}")]
    Panicked(String),
}

/// Observable listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// No listener task exists.
    Stopped,
    /// The task is draining notifications.
    Running,
    /// The task ended on its own after a fatal store error.
    Failed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ListenerState::Stopped => "stopped",
            ListenerState::Running => "running",
            ListenerState::Failed => "failed",
        })
    }
}

/// Everything the listener task needs.
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub(crate) pubsub: Arc<dyn PubSub>,
    pub(crate) reader: SnapshotReader,
    pub(crate) sessions: Arc<SessionSet>,
    pub(crate) timestamp_field: String,
}

/// A running listener task.
pub(crate) struct ListenerHandle {
    token: CancellationToken,
    task: JoinHandle<Result<(), ListenerError>>,
}

impl ListenerHandle {
    /// Spawn the listener task.
    pub(crate) fn spawn(ctx: ListenerContext) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(run(ctx, token.clone()));
        info!("Broadcast listener started");
        Self { token, task }
    }

    /// Whether the task has already exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task and wait for it to exit.
    ///
    /// Returns the task's own outcome, so a listener that had already
    /// failed reports its error here.
    pub(crate) async fn stop(self) -> Result<(), ListenerError> {
        self.token.cancel();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ListenerError::Panicked(e.to_string())),
        }
    }
}

/// What became of one notification.
enum Resolved {
    Broadcast(Frame),
    Skipped(&'static str),
}

async fn run(ctx: ListenerContext, token: CancellationToken) -> Result<(), ListenerError> {
    debug!("Broadcast listener running");

    loop {
        let received = tokio::select! {
            biased;
            () = token.cancelled() => break,
            received = ctx.pubsub.next_message() => received,
        };

        let notification = match received {
            Ok(notification) => notification,
            Err(e) if e.is_fatal() => return Err(fail(e)),
            Err(e) => {
                warn!(error = %e, "Failed to receive notification");
                continue;
            }
        };

        crate::metrics::record_notification();
        let received_at = now_ms();

        let resolved = tokio::select! {
            biased;
            () = token.cancelled() => break,
            resolved = resolve(&ctx, &notification, received_at) => resolved,
        };

        match resolved {
            Ok(Resolved::Broadcast(frame)) => {
                if let Err(e) = ctx.sessions.broadcast(&frame) {
                    warn!(channel = %notification.channel, error = %e, "Failed to encode update");
                    crate::metrics::record_skipped("encode");
                }
            }
            Ok(Resolved::Skipped(reason)) => crate::metrics::record_skipped(reason),
            Err(e) if e.is_fatal() => return Err(fail(e)),
            Err(e) => {
                warn!(channel = %notification.channel, error = %e, "Failed to resolve notification");
                crate::metrics::record_skipped("read_error");
            }
        }
    }

    info!("Broadcast listener cancelled");
    Ok(())
}

/// Turn a notification into the frame to broadcast.
async fn resolve(
    ctx: &ListenerContext,
    notification: &Notification,
    received_at: i64,
) -> Result<Resolved, StoreError> {
    let Some(id) = ctx.reader.keys().entity_id(&notification.channel) else {
        warn!(channel = %notification.channel, "Notification on unknown channel");
        return Ok(Resolved::Skipped("unknown_channel"));
    };

    let Some(snapshot) = ctx.reader.read_one(&id).await? else {
        debug!(entity = %id, "Notification for entity without record");
        return Ok(Resolved::Skipped("missing_record"));
    };

    if let Some(sent_at) = snapshot.source_timestamp(&ctx.timestamp_field) {
        crate::metrics::record_source_latency(received_at.saturating_sub(sent_at));
    }

    let record = snapshot.stamp(received_at, &ctx.timestamp_field);
    Ok(Resolved::Broadcast(Frame::update(
        notification.channel.clone(),
        record,
    )))
}

fn fail(e: StoreError) -> ListenerError {
    error!(error = %e, "Broadcast listener lost the store connection");
    crate::metrics::record_listener_failure();
    ListenerError::Store(e)
}
