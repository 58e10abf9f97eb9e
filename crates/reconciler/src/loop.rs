//! Serial event loop.
//!
//! Events are drained from a channel and handled one at a time, each to
//! completion, in arrival order.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::reconciler::Reconciler;
use crate::types::{Event, Handled};

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 64;

/// Feeds events from a channel into a [`Reconciler`].
pub struct EventLoop {
    reconciler: Reconciler,
    events: mpsc::Receiver<Event>,
    sink: Option<mpsc::Sender<Handled>>,
}

impl EventLoop {
    /// Create a loop and the sender feeding it.
    #[must_use]
    pub fn new(reconciler: Reconciler, capacity: usize) -> (mpsc::Sender<Event>, Self) {
        let (tx, events) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                reconciler,
                events,
                sink: None,
            },
        )
    }

    /// Forward every outcome to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: mpsc::Sender<Handled>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run until every sender is dropped, then hand the reconciler back.
    pub async fn run(mut self) -> Reconciler {
        let mut handled = 0usize;
        while let Some(event) = self.events.recv().await {
            debug!(event = event.kind(), "event received");
            let outcome = self.reconciler.handle(event).await;
            handled += 1;

            let receiver_gone = match &self.sink {
                Some(sink) => sink.send(outcome).await.is_err(),
                None => false,
            };
            if receiver_gone {
                warn!("outcome receiver dropped, no longer forwarding");
                self.sink = None;
            }
        }
        info!(handled, status = %self.reconciler.status(), "event channel closed");
        self.reconciler
    }
}
