//! Download operation - the unit of work for one logical fetch
//!
//! An operation owns its subscribers and moves through
//! `Queued -> Executing -> {Completed | Failed | Cancelled}`. It drives the
//! HTTP client, accumulates the body and reports through every subscriber.
//!
//! Delivery rules:
//! - callbacks of one operation run sequentially, in chunk order
//! - exactly one terminal outcome is ever recorded
//! - once `cancel()` returns, no subscriber is invoked again

use crate::decode::{DecodedImage, ImageDecoder};
use crate::error::DownloadError;
use crate::http::{CacheDirective, Credentials, HttpClient, HttpRequest};
use bytes::Bytes;
use futures::StreamExt;
use imgfetch_types::{DownloadOptions, DownloadProgress, HeaderSet, OperationState, Priority};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Upper bound on the buffer preallocated from a content-length header
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Growth of a progressive buffer between two partial decode attempts
const PARTIAL_DECODE_STEP: usize = 256 * 1024;

thread_local! {
    /// Number of subscriber calls in progress on this thread
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as inside a subscriber call
struct DeliveryScope;

impl DeliveryScope {
    fn enter() -> Self {
        DELIVERING.with(|d| d.set(d.get() + 1));
        DeliveryScope
    }

    fn active() -> bool {
        DELIVERING.with(|d| d.get() > 0)
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

pub type ProgressCallback = Box<dyn FnMut(DownloadProgress) + Send>;
pub type CompletedCallback = Box<dyn FnMut(Completion) + Send>;

// ============================================================================
// Request
// ============================================================================

/// Everything needed to issue one fetch, snapshotted at submission time
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    pub headers: HeaderSet,
    pub options: DownloadOptions,
    pub credentials: Option<Credentials>,
}

impl DownloadRequest {
    pub fn new(url: Url, headers: HeaderSet, options: DownloadOptions) -> Self {
        Self {
            url,
            headers,
            options,
            credentials: None,
        }
    }

    pub fn priority(&self) -> Priority {
        self.options.priority()
    }

    pub fn cache_directive(&self) -> CacheDirective {
        if self.options.contains(DownloadOptions::USE_HTTP_CACHE) {
            CacheDirective::Default
        } else {
            CacheDirective::Bypass
        }
    }

    /// A cached response should complete empty instead of with its bytes
    fn ignores_cached_response(&self) -> bool {
        self.options
            .contains(DownloadOptions::USE_HTTP_CACHE | DownloadOptions::IGNORE_CACHED_RESPONSE)
    }

    pub fn to_http_request(&self) -> HttpRequest {
        HttpRequest {
            url: self.url.clone(),
            headers: self.headers.clone(),
            cache: self.cache_directive(),
            credentials: self.credentials.clone(),
        }
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Arguments of one completion call
#[derive(Debug, Clone)]
pub struct Completion {
    pub image: Option<Arc<DecodedImage>>,
    pub data: Option<Bytes>,
    pub error: Option<DownloadError>,
    /// `false` only for progressive partial deliveries
    pub finished: bool,
}

impl Completion {
    fn partial(data: Bytes, image: Option<Arc<DecodedImage>>) -> Self {
        Self {
            image,
            data: Some(data),
            error: None,
            finished: false,
        }
    }

    fn done(data: Bytes, image: Option<Arc<DecodedImage>>) -> Self {
        Self {
            image,
            data: Some(data),
            error: None,
            finished: true,
        }
    }

    /// Served from cache with cached responses ignored: nothing new to render
    fn not_modified() -> Self {
        Self {
            image: None,
            data: None,
            error: None,
            finished: true,
        }
    }

    fn failed(error: DownloadError) -> Self {
        Self {
            image: None,
            data: None,
            error: Some(error),
            finished: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.finished && self.error.is_none()
    }
}

/// Event delivered to channel subscribers
#[derive(Debug, Clone)]
pub enum OperationEvent {
    Progress(DownloadProgress),
    Completed(Completion),
}

enum Subscriber {
    Callbacks {
        progress: ProgressCallback,
        completed: CompletedCallback,
    },
    Channel(mpsc::UnboundedSender<OperationEvent>),
}

impl Subscriber {
    fn progress(&mut self, progress: DownloadProgress) {
        match self {
            Subscriber::Callbacks { progress: cb, .. } => cb(progress),
            Subscriber::Channel(tx) => {
                let _ = tx.send(OperationEvent::Progress(progress));
            }
        }
    }

    fn complete(&mut self, completion: Completion) {
        match self {
            Subscriber::Callbacks { completed, .. } => completed(completion),
            Subscriber::Channel(tx) => {
                let _ = tx.send(OperationEvent::Completed(completion));
            }
        }
    }
}

// ============================================================================
// Operation
// ============================================================================

struct OperationInner {
    state: OperationState,
    subscribers: Vec<Arc<Mutex<Subscriber>>>,
    received: u64,
    expected: Option<u64>,
    /// Terminal completion, replayed to late subscribers
    outcome: Option<Completion>,
}

/// One fetch moving through the operation state machine
pub struct DownloadOperation {
    id: Uuid,
    request: DownloadRequest,
    inner: Mutex<OperationInner>,
    /// Held while subscribers are being invoked. Reentrant so a callback may
    /// cancel its own operation.
    delivery: ReentrantMutex<()>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl std::fmt::Debug for DownloadOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOperation")
            .field("id", &self.id)
            .field("url", &self.request.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl DownloadOperation {
    /// Create an operation in the `Queued` state with no subscribers
    pub fn new(request: DownloadRequest) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            request,
            inner: Mutex::new(OperationInner {
                state: OperationState::Queued,
                subscribers: Vec::new(),
                received: 0,
                expected: None,
                outcome: None,
            }),
            delivery: ReentrantMutex::new(()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn options(&self) -> DownloadOptions {
        self.request.options
    }

    pub fn priority(&self) -> Priority {
        self.request.priority()
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == OperationState::Cancelled
    }

    pub fn progress(&self) -> DownloadProgress {
        let inner = self.inner.lock();
        DownloadProgress {
            received: inner.received,
            expected: inner.expected,
        }
    }

    /// Terminal completion, once there is one
    pub fn outcome(&self) -> Option<Completion> {
        self.inner.lock().outcome.clone()
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    /// Attach a progress/completion callback pair.
    ///
    /// Subscribers attached after the operation finished are called once,
    /// immediately, with the terminal outcome.
    pub fn add_callbacks<P, C>(&self, on_progress: P, on_completed: C)
    where
        P: FnMut(DownloadProgress) + Send + 'static,
        C: FnMut(Completion) + Send + 'static,
    {
        self.attach(Subscriber::Callbacks {
            progress: Box::new(on_progress),
            completed: Box::new(on_completed),
        });
    }

    /// Attach a channel subscriber. The channel closes after the terminal
    /// event, or without one when the operation is cancelled.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OperationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(Subscriber::Channel(tx));
        rx
    }

    fn attach(&self, mut subscriber: Subscriber) {
        let outcome = {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                inner.subscribers.push(Arc::new(Mutex::new(subscriber)));
                return;
            }
            inner
                .outcome
                .clone()
                .unwrap_or_else(|| Completion::failed(DownloadError::Cancelled))
        };
        subscriber.complete(outcome);
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// `Queued -> Executing`. Fails if the operation was cancelled first.
    pub(crate) fn mark_executing(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != OperationState::Queued {
            return false;
        }
        inner.state = OperationState::Executing;
        true
    }

    /// Cancel the operation. Idempotent; returns `true` only for the call
    /// that performed the transition.
    ///
    /// Aborts an in-flight transfer. When this returns, no subscriber
    /// callback will run again. Called from inside another operation's
    /// callback it does not wait for a delivery already running on a different
    /// thread; that delivery stops before its next subscriber.
    pub fn cancel(&self) -> bool {
        let subscribers = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = OperationState::Cancelled;
            inner.outcome = Some(Completion::failed(DownloadError::Cancelled));
            std::mem::take(&mut inner.subscribers)
        };
        self.cancel.cancel();

        // Wait out a delivery already in progress on another thread. From
        // inside a callback only try: two callbacks cancelling each other's
        // operations would otherwise wait on each other forever.
        let _gate = if DeliveryScope::active() {
            self.delivery.try_lock()
        } else {
            Some(self.delivery.lock())
        };
        drop(subscribers);

        info!("Cancelled download {} ({})", self.id, self.request.url);
        true
    }

    /// Record the terminal outcome and notify every subscriber once.
    /// Loses silently if another terminal transition won the race.
    fn finish(&self, state: OperationState, completion: Completion) -> bool {
        debug_assert!(state.is_terminal());

        let _gate = self.delivery.lock();
        let subscribers = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = state;
            inner.outcome = Some(completion.clone());
            std::mem::take(&mut inner.subscribers)
        };

        let _scope = DeliveryScope::enter();
        for subscriber in subscribers {
            subscriber.lock().complete(completion.clone());
        }
        true
    }

    /// Deliver a non-terminal event while the operation is still executing
    fn emit(&self, event: OperationEvent) {
        let _gate = self.delivery.lock();
        let subscribers = {
            let inner = self.inner.lock();
            if inner.state != OperationState::Executing {
                return;
            }
            inner.subscribers.clone()
        };

        let _scope = DeliveryScope::enter();
        for subscriber in subscribers {
            // A callback may have cancelled the operation
            if self.inner.lock().state != OperationState::Executing {
                return;
            }
            let mut subscriber = subscriber.lock();
            match &event {
                OperationEvent::Progress(progress) => subscriber.progress(*progress),
                OperationEvent::Completed(completion) => subscriber.complete(completion.clone()),
            }
        }
    }

    fn set_expected(&self, expected: Option<u64>) -> DownloadProgress {
        let mut inner = self.inner.lock();
        inner.expected = expected;
        DownloadProgress {
            received: inner.received,
            expected: inner.expected,
        }
    }

    fn record_chunk(&self, len: usize) -> DownloadProgress {
        let mut inner = self.inner.lock();
        inner.received += len as u64;
        DownloadProgress {
            received: inner.received,
            expected: inner.expected,
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run the fetch to a terminal state and return that state.
    ///
    /// Moves a `Queued` operation to `Executing` first. Running an operation
    /// twice is a no-op that just reports the current state.
    pub async fn start(
        self: Arc<Self>,
        client: Arc<dyn HttpClient>,
        decoder: Option<Arc<dyn ImageDecoder>>,
    ) -> OperationState {
        if self.started.swap(true, Ordering::AcqRel) {
            return self.state();
        }
        self.mark_executing();
        if self.state() != OperationState::Executing {
            return self.state();
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("Download {} aborted in flight", self.id);
            }
            _ = self.fetch(client.as_ref(), decoder) => {}
        }

        self.state()
    }

    async fn fetch(&self, client: &dyn HttpClient, decoder: Option<Arc<dyn ImageDecoder>>) {
        let url = &self.request.url;
        debug!("Download {}: requesting {}", self.id, url);

        let response = match client.get(&self.request.to_http_request()).await {
            Ok(response) => response,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        if !response.is_success() {
            self.fail(DownloadError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            });
            return;
        }

        // A 304 carries no body, so there is nothing to hand over either way
        let not_modified = response.status == 304;
        if response.from_cache && (not_modified || self.request.ignores_cached_response()) {
            info!("Download {}: served from cache, skipping payload", self.id);
            self.finish(OperationState::Completed, Completion::not_modified());
            return;
        }

        let progressive = self
            .request
            .options
            .contains(DownloadOptions::PROGRESSIVE_DOWNLOAD);
        let initial = self.set_expected(response.content_length);
        self.emit(OperationEvent::Progress(initial));

        let capacity = response.content_length.unwrap_or(0).min(MAX_PREALLOCATION);
        let mut buffer: Vec<u8> = Vec::with_capacity(capacity as usize);
        let mut body = response.body;
        let mut decoded_len = 0;
        let mut partial_image: Option<Arc<DecodedImage>> = None;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            if chunk.is_empty() {
                continue;
            }

            buffer.extend_from_slice(&chunk);
            let progress = self.record_chunk(chunk.len());
            self.emit(OperationEvent::Progress(progress));

            if progressive {
                let partial = Bytes::copy_from_slice(&buffer);
                if let Some(decoder) = &decoder {
                    // Best-effort: truncated payloads rarely decode
                    if partial.len() - decoded_len >= PARTIAL_DECODE_STEP {
                        decoded_len = partial.len();
                        if let Ok(image) = decode_blocking(decoder, partial.clone()).await {
                            partial_image = Some(Arc::new(image));
                        }
                    }
                }
                self.emit(OperationEvent::Completed(Completion::partial(
                    partial,
                    partial_image.clone(),
                )));
            }
        }

        let data = Bytes::from(buffer);
        let image = match &decoder {
            Some(decoder) => match decode_blocking(decoder, data.clone()).await {
                Ok(image) => Some(Arc::new(image)),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            },
            None => None,
        };

        let len = data.len();
        if self.finish(OperationState::Completed, Completion::done(data, image)) {
            info!("Download {} completed ({} bytes)", self.id, len);
        }
    }

    fn fail(&self, error: DownloadError) {
        warn!("Download {} failed: {}", self.id, error);
        self.finish(OperationState::Failed, Completion::failed(error));
    }
}

/// Run the decoder on the blocking pool
async fn decode_blocking(
    decoder: &Arc<dyn ImageDecoder>,
    data: Bytes,
) -> Result<DecodedImage, DownloadError> {
    let decoder = decoder.clone();
    tokio::task::spawn_blocking(move || decoder.decode(&data))
        .await
        .map_err(|e| DownloadError::Decode(format!("decoder task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use async_trait::async_trait;
    use futures::stream;

    /// Serves a fixed body in the given chunks
    struct StaticClient {
        status: u16,
        chunks: Vec<&'static [u8]>,
        content_length: Option<u64>,
        from_cache: bool,
    }

    impl StaticClient {
        fn ok(chunks: Vec<&'static [u8]>) -> Self {
            let len = chunks.iter().map(|c| c.len() as u64).sum();
            Self {
                status: 200,
                chunks,
                content_length: Some(len),
                from_cache: false,
            }
        }
    }

    #[async_trait]
    impl HttpClient for StaticClient {
        async fn get(&self, _request: &HttpRequest) -> Result<HttpResponse, DownloadError> {
            let chunks: Vec<Result<Bytes, DownloadError>> = self
                .chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(*c)))
                .collect();
            Ok(HttpResponse {
                status: self.status,
                headers: HeaderSet::new(),
                content_length: self.content_length,
                from_cache: self.from_cache,
                body: stream::iter(chunks).boxed(),
            })
        }
    }

    fn chunks(parts: &[&'static str]) -> Vec<&'static [u8]> {
        parts.iter().map(|p| p.as_bytes()).collect()
    }

    fn operation(options: DownloadOptions) -> Arc<DownloadOperation> {
        let url = Url::parse("https://example.com/photo.jpg").unwrap();
        DownloadOperation::new(DownloadRequest::new(url, HeaderSet::new(), options))
    }

    type Recorded<T> = Arc<Mutex<Vec<T>>>;

    fn recorder(op: &DownloadOperation) -> (Recorded<DownloadProgress>, Recorded<Completion>) {
        let progress = Arc::new(Mutex::new(Vec::new()));
        let completions = Arc::new(Mutex::new(Vec::new()));
        let (p, c) = (progress.clone(), completions.clone());
        op.add_callbacks(move |e| p.lock().push(e), move |e| c.lock().push(e));
        (progress, completions)
    }

    #[test]
    fn test_cache_directive_follows_options() {
        let op = operation(DownloadOptions::empty());
        assert_eq!(op.request().cache_directive(), CacheDirective::Bypass);

        let op = operation(DownloadOptions::USE_HTTP_CACHE);
        assert_eq!(op.request().cache_directive(), CacheDirective::Default);
        assert!(!op.request().ignores_cached_response());

        let op = operation(DownloadOptions::IGNORE_CACHED_RESPONSE);
        assert!(!op.request().ignores_cached_response());
    }

    #[tokio::test]
    async fn test_single_completion_without_progressive() {
        let op = operation(DownloadOptions::empty());
        let (progress, completions) = recorder(&op);
        let client = Arc::new(StaticClient::ok(chunks(&["abc", "def", "gh"])));

        let state = op.clone().start(client, None).await;

        assert_eq!(state, OperationState::Completed);
        let completions = completions.lock();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].finished);
        assert_eq!(completions[0].data.as_deref(), Some(&b"abcdefgh"[..]));

        // initial head report plus one per chunk
        let progress = progress.lock();
        assert_eq!(progress.len(), 4);
        assert_eq!(progress[0].received, 0);
        assert_eq!(progress[3].received, 8);
        assert_eq!(progress[3].expected, Some(8));
    }

    #[tokio::test]
    async fn test_progressive_delivers_growing_buffers() {
        let op = operation(DownloadOptions::PROGRESSIVE_DOWNLOAD);
        let (_, completions) = recorder(&op);
        let client = Arc::new(StaticClient::ok(chunks(&["ab", "cd", "ef"])));

        op.clone().start(client, None).await;

        let completions = completions.lock();
        assert_eq!(completions.len(), 4);
        let lengths: Vec<usize> = completions
            .iter()
            .map(|c| c.data.as_ref().map(|d| d.len()).unwrap_or(0))
            .collect();
        assert_eq!(lengths, vec![2, 4, 6, 6]);
        assert!(completions[..3].iter().all(|c| !c.finished));
        assert!(completions[3].finished);
    }

    #[tokio::test]
    async fn test_http_status_failure() {
        let op = operation(DownloadOptions::empty());
        let (_, completions) = recorder(&op);
        let client = Arc::new(StaticClient {
            status: 404,
            chunks: chunks(&["not found"]),
            content_length: None,
            from_cache: false,
        });

        assert_eq!(op.clone().start(client, None).await, OperationState::Failed);

        let completions = completions.lock();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].finished);
        assert!(completions[0].data.is_none());
        assert!(matches!(
            completions[0].error,
            Some(DownloadError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_cached_response_ignored() {
        let op = operation(DownloadOptions::USE_HTTP_CACHE | DownloadOptions::IGNORE_CACHED_RESPONSE);
        let (progress, completions) = recorder(&op);
        let client = Arc::new(StaticClient {
            status: 200,
            chunks: chunks(&["cached bytes"]),
            content_length: Some(12),
            from_cache: true,
        });

        assert_eq!(op.clone().start(client, None).await, OperationState::Completed);

        let completions = completions.lock();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].finished);
        assert!(completions[0].data.is_none());
        assert!(completions[0].error.is_none());
        assert!(progress.lock().is_empty());
    }

    #[tokio::test]
    async fn test_not_modified_completes_without_payload() {
        let op = operation(DownloadOptions::USE_HTTP_CACHE);
        let (_, completions) = recorder(&op);
        let client = Arc::new(StaticClient {
            status: 304,
            chunks: Vec::new(),
            content_length: None,
            from_cache: true,
        });

        assert_eq!(op.clone().start(client, None).await, OperationState::Completed);

        let completions = completions.lock();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].finished);
        assert!(completions[0].data.is_none());
        assert!(completions[0].error.is_none());
    }

    #[tokio::test]
    async fn test_cached_body_is_delivered_when_not_ignored() {
        let op = operation(DownloadOptions::USE_HTTP_CACHE);
        let (_, completions) = recorder(&op);
        let client = Arc::new(StaticClient {
            status: 200,
            chunks: chunks(&["cached bytes"]),
            content_length: Some(12),
            from_cache: true,
        });

        op.clone().start(client, None).await;
        assert_eq!(
            completions.lock()[0].data.as_deref(),
            Some(&b"cached bytes"[..])
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start_suppresses_everything() {
        let op = operation(DownloadOptions::empty());
        let (progress, completions) = recorder(&op);

        assert!(op.cancel());
        assert!(!op.cancel());

        let client = Arc::new(StaticClient::ok(chunks(&["abc"])));
        assert_eq!(op.clone().start(client, None).await, OperationState::Cancelled);
        assert!(progress.lock().is_empty());
        assert!(completions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_from_inside_callback() {
        let op = operation(DownloadOptions::PROGRESSIVE_DOWNLOAD);
        let completions = Arc::new(Mutex::new(Vec::new()));
        let sink = completions.clone();
        let handle = Arc::downgrade(&op);
        op.add_callbacks(
            |_| {},
            move |c: Completion| {
                sink.lock().push(c);
                if let Some(op) = handle.upgrade() {
                    op.cancel();
                }
            },
        );

        let client = Arc::new(StaticClient::ok(chunks(&["ab", "cd", "ef"])));
        assert_eq!(op.clone().start(client, None).await, OperationState::Cancelled);
        assert_eq!(completions.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_terminal_outcome() {
        let op = operation(DownloadOptions::empty());
        let client = Arc::new(StaticClient::ok(chunks(&["pixels"])));
        op.clone().start(client, None).await;

        let (progress, completions) = recorder(&op);
        assert!(progress.lock().is_empty());
        let completions = completions.lock();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].data.as_deref(), Some(&b"pixels"[..]));

        let cancelled = operation(DownloadOptions::empty());
        cancelled.cancel();
        let mut rx = cancelled.subscribe();
        match rx.recv().await {
            Some(OperationEvent::Completed(c)) => {
                assert_eq!(c.error, Some(DownloadError::Cancelled))
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_subscriber_closes_after_completion() {
        let op = operation(DownloadOptions::empty());
        let mut rx = op.subscribe();
        let client = Arc::new(StaticClient::ok(chunks(&["a", "b"])));
        op.clone().start(client, None).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
        assert!(matches!(events.last(), Some(OperationEvent::Completed(c)) if c.finished));
    }

    /// Records which thread each decode ran on
    #[derive(Default)]
    struct CountingDecoder {
        calls: Mutex<Vec<(usize, std::thread::ThreadId)>>,
    }

    impl ImageDecoder for CountingDecoder {
        fn decode(&self, data: &[u8]) -> Result<DecodedImage, DownloadError> {
            self.calls
                .lock()
                .push((data.len(), std::thread::current().id()));
            Ok(DecodedImage {
                format: None,
                image: image::DynamicImage::new_rgb8(1, 1),
            })
        }
    }

    static BLOCK: [u8; 200 * 1024] = [0; 200 * 1024];

    #[tokio::test]
    async fn test_decoding_runs_off_the_runtime_thread() {
        let op = operation(DownloadOptions::empty());
        let (_, completions) = recorder(&op);
        let decoder = Arc::new(CountingDecoder::default());
        let client = Arc::new(StaticClient::ok(chunks(&["abc", "def"])));

        op.clone().start(client, Some(decoder.clone())).await;

        let calls = decoder.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 6);
        assert_ne!(calls[0].1, std::thread::current().id());
        assert!(completions.lock()[0].image.is_some());
    }

    #[tokio::test]
    async fn test_partial_decodes_are_throttled() {
        let op = operation(DownloadOptions::PROGRESSIVE_DOWNLOAD);
        let (_, completions) = recorder(&op);
        let decoder = Arc::new(CountingDecoder::default());
        let client = Arc::new(StaticClient::ok(vec![&BLOCK[..], &BLOCK[..], &BLOCK[..]]));

        op.clone().start(client, Some(decoder.clone())).await;

        // One partial attempt once the buffer passed the step, then the final
        let lengths: Vec<usize> = decoder.calls.lock().iter().map(|(len, _)| *len).collect();
        assert_eq!(lengths, vec![400 * 1024, 600 * 1024]);

        let completions = completions.lock();
        assert_eq!(completions.len(), 4);
        assert!(completions[0].image.is_none());
        assert!(completions[1].image.is_some());
        assert!(completions[2].image.is_some());
        assert!(completions[3].finished);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let op = operation(DownloadOptions::empty());
        let (_, completions) = recorder(&op);
        let client: Arc<dyn HttpClient> = Arc::new(StaticClient::ok(chunks(&["x"])));

        op.clone().start(client.clone(), None).await;
        op.clone().start(client, None).await;
        assert_eq!(completions.lock().len(), 1);
    }
}
