//! Download Manager - coordinates all image downloads
//!
//! This is the top-level coordinator that:
//! - Snapshots default headers into every submitted request
//! - Keeps pending operations in FIFO or LIFO order
//! - Admits operations while a concurrency slot is free
//! - Broadcasts started/stopped events
//!
//! All admission decisions happen under a single lock. Byte transfer for
//! each admitted operation runs on its own tokio task.

use crate::decode::ImageDecoder;
use crate::error::DownloadError;
use crate::http::{Credentials, HttpClient};
use crate::notifier::EventNotifier;
use crate::operation::{
    Completion, DownloadOperation, DownloadRequest, OperationEvent,
};
use crate::queue::PendingQueue;
use imgfetch_types::{
    DownloadEvent, DownloadOptions, DownloadProgress, DownloaderConfig, ExecutionOrder, HeaderSet,
    OperationState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Stream of events for one subscriber of an operation
pub type OperationEvents = UnboundedReceiverStream<OperationEvent>;

/// Mutable state shared by every admission decision
struct ManagerState {
    config: DownloaderConfig,
    credentials: Option<Credentials>,
    suspended: bool,
    pending: PendingQueue,
    executing: HashMap<Uuid, Arc<DownloadOperation>>,
    /// Non-terminal operations by URL, for request coalescing
    by_url: HashMap<String, Arc<DownloadOperation>>,
}

struct Shared {
    client: Arc<dyn HttpClient>,
    decoder: Option<Arc<dyn ImageDecoder>>,
    runtime: Handle,
    notifier: EventNotifier,
    state: Mutex<ManagerState>,
}

/// Download manager that coordinates all downloads
///
/// Cheap to clone; clones share the same queue and configuration.
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DownloadManager")
            .field("config", &state.config)
            .field("suspended", &state.suspended)
            .field("pending", &state.pending.len())
            .field("executing", &state.executing.len())
            .finish()
    }
}

impl DownloadManager {
    /// Create a manager with the default configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(client: Arc<dyn HttpClient>) -> Result<Self, DownloadError> {
        Self::with_config(client, DownloaderConfig::default())
    }

    /// Create a manager with the given configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(
        client: Arc<dyn HttpClient>,
        config: DownloaderConfig,
    ) -> Result<Self, DownloadError> {
        Self::with_decoder(client, config, None)
    }

    /// Create a manager whose operations decode their final payload.
    pub fn with_decoder(
        client: Arc<dyn HttpClient>,
        config: DownloaderConfig,
        decoder: Option<Arc<dyn ImageDecoder>>,
    ) -> Result<Self, DownloadError> {
        let runtime = Handle::try_current()
            .map_err(|e| DownloadError::Config(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::with_runtime(runtime, client, config, decoder))
    }

    /// Create a manager that spawns its fetch tasks on `runtime`
    pub fn with_runtime(
        runtime: Handle,
        client: Arc<dyn HttpClient>,
        mut config: DownloaderConfig,
        decoder: Option<Arc<dyn ImageDecoder>>,
    ) -> Self {
        config.max_concurrent_downloads = config.max_concurrent_downloads.max(1);
        let notifier = EventNotifier::new(config.event_capacity);

        info!(
            "Download manager ready (max concurrent: {}, order: {:?}, coalescing: {})",
            config.max_concurrent_downloads, config.execution_order, config.coalesce_requests
        );

        Self {
            shared: Arc::new(Shared {
                client,
                decoder,
                runtime,
                notifier,
                state: Mutex::new(ManagerState {
                    config,
                    credentials: None,
                    suspended: false,
                    pending: PendingQueue::new(),
                    executing: HashMap::new(),
                    by_url: HashMap::new(),
                }),
            }),
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Snapshot of the current configuration
    pub fn config(&self) -> DownloaderConfig {
        self.shared.state.lock().config.clone()
    }

    /// Set a default header for future requests. `None` or an empty value
    /// removes the field.
    pub fn set_header(&self, field: &str, value: Option<&str>) {
        self.shared.state.lock().config.headers.set(field, value);
    }

    /// Value of a default header (case-insensitive)
    pub fn header(&self, field: &str) -> Option<String> {
        self.shared
            .state
            .lock()
            .config
            .headers
            .get(field)
            .map(str::to_string)
    }

    pub fn headers(&self) -> HeaderSet {
        self.shared.state.lock().config.headers.clone()
    }

    /// Basic-auth credentials for future requests
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        self.shared.state.lock().credentials = credentials;
    }

    /// Change the concurrency limit (clamped to at least 1). Raising it
    /// admits queued operations right away; lowering it never preempts.
    pub fn set_max_concurrent_downloads(&self, max: usize) {
        {
            let mut state = self.shared.state.lock();
            state.config.max_concurrent_downloads = max.max(1);
            debug!("Max concurrent downloads set to {}", state.config.max_concurrent_downloads);
        }
        self.shared.admit();
    }

    pub fn set_execution_order(&self, order: ExecutionOrder) {
        self.shared.state.lock().config.execution_order = order;
        self.shared.admit();
    }

    pub fn set_coalesce_requests(&self, enabled: bool) {
        self.shared.state.lock().config.coalesce_requests = enabled;
    }

    /// While suspended nothing new is admitted. Running operations continue.
    pub fn set_suspended(&self, suspended: bool) {
        self.shared.state.lock().suspended = suspended;
        if !suspended {
            self.shared.admit();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.state.lock().suspended
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Number of operations currently executing
    pub fn current_download_count(&self) -> usize {
        self.shared.state.lock().executing.len()
    }

    /// Number of operations waiting for a slot
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Register an observer for started/stopped events
    pub fn subscribe_events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.shared.notifier.subscribe()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Fetch `url`, reporting through the given callbacks.
    ///
    /// Returns immediately with a token that cancels the operation. Only an
    /// empty or malformed URL fails here; every other outcome arrives through
    /// `on_completed`.
    pub fn download_image<P, C>(
        &self,
        url: &str,
        options: DownloadOptions,
        on_progress: P,
        on_completed: C,
    ) -> Result<CancelToken, DownloadError>
    where
        P: FnMut(DownloadProgress) + Send + 'static,
        C: FnMut(Completion) + Send + 'static,
    {
        self.submit(url, options, |op| op.add_callbacks(on_progress, on_completed))
            .map(|(token, _)| token)
    }

    /// Channel-based variant of [`download_image`](Self::download_image).
    ///
    /// The stream yields progress and completion events and ends after the
    /// final completion, or without one if the operation is cancelled.
    pub fn download_image_stream(
        &self,
        url: &str,
        options: DownloadOptions,
    ) -> Result<(CancelToken, OperationEvents), DownloadError> {
        let (token, rx) = self.submit(url, options, |op| op.subscribe())?;
        Ok((token, UnboundedReceiverStream::new(rx)))
    }

    fn submit<T>(
        &self,
        url: &str,
        options: DownloadOptions,
        attach: impl FnOnce(&DownloadOperation) -> T,
    ) -> Result<(CancelToken, T), DownloadError> {
        let url = parse_url(url)?;

        let (operation, attached) = {
            let mut state = self.shared.state.lock();

            let existing = state
                .by_url
                .get(url.as_str())
                .filter(|op| state.config.coalesce_requests && !op.state().is_terminal())
                .cloned();
            if let Some(existing) = existing {
                drop(state);
                // Outside the lock: a subscriber attached to an operation that
                // just finished is notified immediately
                debug!("Coalescing {} into download {}", url, existing.id());
                let attached = attach(&existing);
                return Ok((self.token_for(existing), attached));
            }

            let mut request = DownloadRequest::new(url, state.config.headers.clone(), options);
            request.credentials = state.credentials.clone();
            let operation = DownloadOperation::new(request);
            let attached = attach(&operation);

            debug!(
                "Queued download {} for {} ({})",
                operation.id(),
                operation.url(),
                options
            );
            if state.config.coalesce_requests {
                state
                    .by_url
                    .insert(operation.url().to_string(), operation.clone());
            }
            let order = state.config.execution_order;
            state.pending.push(operation.clone(), order);
            (operation, attached)
        };

        self.shared.admit();
        Ok((self.token_for(operation), attached))
    }

    fn token_for(&self, operation: Arc<DownloadOperation>) -> CancelToken {
        CancelToken {
            operation,
            manager: Arc::downgrade(&self.shared),
        }
    }

    /// Cancel every queued and executing operation
    pub fn cancel_all(&self) {
        let operations: Vec<Arc<DownloadOperation>> = {
            let mut state = self.shared.state.lock();
            let mut all = state.pending.drain();
            all.extend(state.executing.values().cloned());
            all
        };

        info!("Cancelling {} downloads", operations.len());
        for operation in operations {
            if operation.cancel() {
                self.shared.release(&operation);
            }
        }
    }
}

fn parse_url(url: &str) -> Result<Url, DownloadError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::InvalidRequest("empty URL".to_string()));
    }
    let parsed = Url::parse(trimmed)?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(DownloadError::InvalidRequest(format!(
            "unsupported URL: {}",
            trimmed
        ))),
    }
}

impl Shared {
    /// Start queued operations while slots are free
    fn admit(self: &Arc<Self>) {
        let mut state = self.state.lock();

        while !state.suspended && state.executing.len() < state.config.max_concurrent_downloads {
            let Some(operation) = state.pending.pop() else {
                break;
            };
            // Cancelled while queued
            if !operation.mark_executing() {
                continue;
            }

            info!("Starting download {}: {}", operation.id(), operation.url());
            state.executing.insert(operation.id(), operation.clone());
            self.notifier.started(operation.id(), operation.url());
            self.spawn(operation);
        }
    }

    fn spawn(self: &Arc<Self>, operation: Arc<DownloadOperation>) {
        let client = self.client.clone();
        let decoder = self.decoder.clone();
        let manager = Arc::downgrade(self);

        self.runtime.spawn(async move {
            let state = operation.clone().start(client, decoder).await;
            if let Some(manager) = manager.upgrade() {
                manager.finished(&operation, state);
            }
        });
    }

    /// Fetch task ended
    fn finished(self: &Arc<Self>, operation: &Arc<DownloadOperation>, state: OperationState) {
        self.release(operation);
        debug!("Download {} ended as {}", operation.id(), state);
    }

    /// Drop every reference the manager holds to a terminal operation,
    /// free its slot and admit the next one
    fn release(self: &Arc<Self>, operation: &Arc<DownloadOperation>) {
        {
            let mut state = self.state.lock();
            state.pending.remove(operation.id());

            let url = operation.url().as_str();
            if state
                .by_url
                .get(url)
                .is_some_and(|op| op.id() == operation.id())
            {
                state.by_url.remove(url);
            }

            if state.executing.remove(&operation.id()).is_some() {
                let final_state = operation.state();
                if final_state == OperationState::Failed {
                    warn!("Download {} stopped with failure", operation.id());
                }
                self.notifier
                    .stopped(operation.id(), operation.url(), final_state);
            }
        }
        self.admit();
    }
}

// ============================================================================
// Cancellation token
// ============================================================================

/// Handle to a submitted operation
///
/// Cancelling is idempotent and safe in every state. Tokens for a coalesced
/// submission share the operation, so cancelling one cancels delivery for
/// every subscriber.
#[derive(Clone)]
pub struct CancelToken {
    operation: Arc<DownloadOperation>,
    manager: Weak<Shared>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("operation", &self.operation)
            .finish()
    }
}

impl CancelToken {
    pub fn cancel(&self) {
        if self.operation.cancel() {
            if let Some(manager) = self.manager.upgrade() {
                manager.release(&self.operation);
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.operation.id()
    }

    pub fn url(&self) -> &Url {
        self.operation.url()
    }

    pub fn state(&self) -> OperationState {
        self.operation.state()
    }

    pub fn progress(&self) -> DownloadProgress {
        self.operation.progress()
    }

    pub fn operation(&self) -> &Arc<DownloadOperation> {
        &self.operation
    }

    /// Attach another consumer to the same operation
    pub fn add_callbacks<P, C>(&self, on_progress: P, on_completed: C)
    where
        P: FnMut(DownloadProgress) + Send + 'static,
        C: FnMut(Completion) + Send + 'static,
    {
        self.operation.add_callbacks(on_progress, on_completed);
    }

    pub fn subscribe(&self) -> OperationEvents {
        UnboundedReceiverStream::new(self.operation.subscribe())
    }
}
