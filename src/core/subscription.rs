//! Owned forward request subscription.
//!
//! A node adapter creates the pair with [`ForwardSubscription::channel`],
//! keeps the [`SubscriptionFeed`] in its pump task and hands the
//! [`ForwardSubscription`] to the supervisor. Dropping the subscription
//! cancels its token, which tells the pump to stop; events that were already
//! queued are dropped with it and reject themselves.

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::forward::ForwardRequest;

/// Default queue depth between an adapter pump and the supervisor.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 64;

/// Consumer side of a forward request stream.
#[derive(Debug)]
pub struct ForwardSubscription {
    events: mpsc::Receiver<Result<ForwardRequest>>,
    cancel: CancellationToken,
}

/// Producer side, held by the node adapter.
#[derive(Debug, Clone)]
pub struct SubscriptionFeed {
    events: mpsc::Sender<Result<ForwardRequest>>,
    cancel: CancellationToken,
}

impl ForwardSubscription {
    pub fn channel(buffer: usize) -> (SubscriptionFeed, ForwardSubscription) {
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        (
            SubscriptionFeed {
                events: tx,
                cancel: cancel.clone(),
            },
            ForwardSubscription { events: rx, cancel },
        )
    }

    /// Waits for the next forward request.
    ///
    /// `None` means the stream ended; `Some(Err(_))` is a stream error.
    /// Both end the subscription.
    pub async fn next(&mut self) -> Option<Result<ForwardRequest>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.events.recv().await
    }

    /// Cancels the stream; equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for ForwardSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }
}

impl SubscriptionFeed {
    /// Queues a request. Returns `false` once the subscription is gone, in
    /// which case the request rejects itself on drop.
    pub async fn deliver(&self, request: ForwardRequest) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.events.send(Ok(request)).await.is_ok()
    }

    /// Reports a stream level error to the consumer.
    pub async fn fail(&self, error: anyhow::Error) {
        let _ = self.events.send(Err(error)).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the consumer dropped or closed the subscription.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
