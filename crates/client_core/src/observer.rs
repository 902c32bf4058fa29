use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use shared::{
    domain::{ConversationId, SessionId},
    protocol::SessionView,
};
use tokio::{
    sync::{oneshot, watch, Notify},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::{Backoff, CallSessionClient, RealtimeSubscription};

/// Live snapshots of one call. Yields the current view first, then the
/// latest view after every change. Slow consumers only see the newest
/// snapshot. Dropping the stream stops the background worker.
pub struct SessionStream {
    inner: WatchStream<SessionView>,
    worker: JoinHandle<()>,
}

impl Stream for SessionStream {
    type Item = SessionView;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

pub(crate) fn spawn_observer(
    client: Arc<CallSessionClient>,
    initial: SessionView,
) -> SessionStream {
    let session_id = initial.session_id();
    let conversation_id = initial.session.conversation_id;
    let (snapshots, rx) = watch::channel(initial);
    let worker = tokio::spawn(async move {
        observe(client, session_id, conversation_id, snapshots).await;
    });
    SessionStream {
        inner: WatchStream::new(rx),
        worker,
    }
}

async fn observe(
    client: Arc<CallSessionClient>,
    session_id: SessionId,
    conversation_id: ConversationId,
    snapshots: watch::Sender<SessionView>,
) {
    let mut backoff = client.settings.backoff();
    loop {
        let subscription = match client
            .realtime
            .subscribe(conversation_id, client.user_id)
            .await
        {
            Ok(subscription) => {
                backoff.reset();
                subscription
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(
                    %session_id,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "observer: subscribe failed"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        debug!(%session_id, "observer: subscribed");

        // The first full read runs after the subscription is live so no change is lost.
        let dirty = Arc::new(Notify::new());
        dirty.notify_one();
        let (closed_tx, mut closed_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_events(
            subscription,
            session_id,
            dirty.clone(),
            closed_tx,
        ));

        loop {
            tokio::select! {
                _ = dirty.notified() => {
                    recompute(&client, session_id, &snapshots, &dirty).await;
                }
                _ = &mut closed_rx => {
                    info!(%session_id, "observer: realtime channel dropped, resubscribing");
                    break;
                }
            }
        }
        pump.abort();
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

/// Turns matching change events into recompute requests. Notify keeps at
/// most one pending permit, so bursts collapse into a single follow-up read.
async fn pump_events(
    mut subscription: RealtimeSubscription,
    session_id: SessionId,
    dirty: Arc<Notify>,
    closed: oneshot::Sender<()>,
) {
    while let Some(event) = subscription.recv().await {
        if event.session_id() == session_id {
            dirty.notify_one();
        }
    }
    let _ = closed.send(());
}

async fn recompute(
    client: &CallSessionClient,
    session_id: SessionId,
    snapshots: &watch::Sender<SessionView>,
    dirty: &Notify,
) {
    match client.fetch_view(session_id).await {
        Ok(view) => {
            client.enforce_media_policy(&view).await;
            snapshots.send_if_modified(|current| {
                if *current == view {
                    false
                } else {
                    *current = view;
                    true
                }
            });
        }
        Err(err) if err.is_retryable() => {
            warn!(%session_id, error = %err, "observer: recompute failed, will retry");
            tokio::time::sleep(client.settings.backoff_cap).await;
            dirty.notify_one();
        }
        Err(err) => {
            // Purged sessions stop resolving; the last snapshot stands.
            debug!(%session_id, error = %err, "observer: recompute skipped");
        }
    }
}
