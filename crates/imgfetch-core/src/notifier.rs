//! Download started/stopped notifications
//!
//! Scoped to one manager. Observers subscribe to a broadcast channel and
//! unsubscribe by dropping their receiver. Sends never block and are
//! dropped when nobody listens.

use imgfetch_types::{DownloadEvent, OperationState};
use tokio::sync::broadcast;
use url::Url;
use uuid::Uuid;

/// Broadcast side of the started/stopped events.
///
/// Only the manager publishes; outside code can observe but not emit.
///
/// ```compile_fail
/// use imgfetch_core::EventNotifier;
/// use imgfetch_core::types::DownloadEvent;
///
/// let notifier = EventNotifier::new(4);
/// notifier.emit(DownloadEvent::DownloadStarted {
///     id: uuid::Uuid::nil(),
///     url: String::new(),
/// });
/// ```
#[derive(Debug, Clone)]
pub struct EventNotifier {
    event_tx: broadcast::Sender<DownloadEvent>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    /// Register an observer
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    pub(crate) fn emit(&self, event: DownloadEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn started(&self, id: Uuid, url: &Url) {
        self.emit(DownloadEvent::DownloadStarted {
            id,
            url: url.to_string(),
        });
    }

    pub(crate) fn stopped(&self, id: Uuid, url: &Url, state: OperationState) {
        self.emit(DownloadEvent::DownloadStopped {
            id,
            url: url.to_string(),
            state,
        });
    }
}
