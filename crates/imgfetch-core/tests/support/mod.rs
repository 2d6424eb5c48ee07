//! Scripted HTTP client for driving the manager from tests
//!
//! Every request the manager issues shows up on a channel together with the
//! sender for its body, so a test decides when chunks arrive and when the
//! transfer ends.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use imgfetch_core::types::{DownloadEvent, DownloadProgress, HeaderSet, OperationState};
use imgfetch_core::{
    CancelToken, Completion, DownloadError, HttpClient, HttpRequest, HttpResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A request the manager has issued and is now streaming
pub struct ServedRequest {
    pub request: HttpRequest,
    body: Option<mpsc::UnboundedSender<Result<Bytes, DownloadError>>>,
}

impl ServedRequest {
    pub fn url(&self) -> &str {
        self.request.url.as_str()
    }

    pub fn path(&self) -> &str {
        self.request.url.path()
    }

    /// Push a chunk. Ignored once the operation dropped its stream.
    pub fn send(&self, chunk: &'static [u8]) {
        if let Some(body) = &self.body {
            let _ = body.send(Ok(Bytes::from_static(chunk)));
        }
    }

    pub fn fail(&mut self, error: DownloadError) {
        if let Some(body) = self.body.take() {
            let _ = body.send(Err(error));
        }
    }

    /// End the body stream
    pub fn finish(&mut self) {
        self.body = None;
    }

    pub fn respond(mut self, chunk: &'static [u8]) {
        self.send(chunk);
        self.finish();
    }
}

pub struct ScriptedClient {
    requests: mpsc::UnboundedSender<ServedRequest>,
    content_length: Option<u64>,
    from_cache: bool,
}

impl ScriptedClient {
    pub fn new() -> (Arc<Self>, Requests) {
        Self::with_head(None, false)
    }

    pub fn with_head(content_length: Option<u64>, from_cache: bool) -> (Arc<Self>, Requests) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                requests: tx,
                content_length,
                from_cache,
            }),
            Requests { rx },
        )
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, DownloadError> {
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        self.requests
            .send(ServedRequest {
                request: request.clone(),
                body: Some(body_tx),
            })
            .map_err(|_| DownloadError::Transport("test harness gone".to_string()))?;

        Ok(HttpResponse {
            status: 200,
            headers: HeaderSet::new(),
            content_length: self.content_length,
            from_cache: self.from_cache,
            body: UnboundedReceiverStream::new(body_rx).boxed(),
        })
    }
}

/// Receiving end of the issued requests
pub struct Requests {
    rx: mpsc::UnboundedReceiver<ServedRequest>,
}

impl Requests {
    pub async fn next(&mut self) -> ServedRequest {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("client dropped")
    }

    /// Assert nothing else gets requested for a little while
    pub async fn assert_idle(&mut self) {
        settle().await;
        if let Ok(request) = self.rx.try_recv() {
            panic!("unexpected request for {}", request.url());
        }
    }
}

/// Let every spawned fetch task run until it waits on I/O again.
///
/// The manager spawns onto the test's current-thread runtime, so yielding
/// hands each ready task a turn without relying on wall-clock time.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Wait for the fetch task of `token`'s operation to exit
pub async fn task_exited(token: &CancelToken) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while Arc::strong_count(token.operation()) > 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("fetch task still running");
}

/// Wait for the `DownloadStopped` of `id`, returning how many
/// `DownloadStarted` events it had and its final state
pub async fn stopped(
    events: &mut broadcast::Receiver<DownloadEvent>,
    id: Uuid,
) -> (usize, OperationState) {
    let mut started = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for DownloadStopped")
            .expect("event channel closed");
        match event {
            DownloadEvent::DownloadStarted { id: got, .. } if got == id => started += 1,
            DownloadEvent::DownloadStopped { id: got, state, .. } if got == id => {
                return (started, state)
            }
            _ => {}
        }
    }
}

/// Everything delivered to one subscriber
#[derive(Debug)]
pub enum Delivery {
    Progress(DownloadProgress),
    Completed(Completion),
}

pub struct Recorder {
    rx: mpsc::UnboundedReceiver<Delivery>,
    pub seen: Vec<Delivery>,
}

pub type ProgressFn = Box<dyn FnMut(DownloadProgress) + Send>;
pub type CompletedFn = Box<dyn FnMut(Completion) + Send>;

/// Callback pair that forwards into a recorder
pub fn recorder() -> (ProgressFn, CompletedFn, Recorder) {
    let (tx, rx) = mpsc::unbounded_channel();
    let progress_tx = tx.clone();
    (
        Box::new(move |p| {
            let _ = progress_tx.send(Delivery::Progress(p));
        }),
        Box::new(move |c| {
            let _ = tx.send(Delivery::Completed(c));
        }),
        Recorder {
            rx,
            seen: Vec::new(),
        },
    )
}

impl Recorder {
    /// Pull in whatever has been delivered so far
    pub fn drain(&mut self) {
        while let Ok(delivery) = self.rx.try_recv() {
            self.seen.push(delivery);
        }
    }

    /// Wait for the next completion call
    pub async fn completion(&mut self) -> Completion {
        loop {
            let delivery = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for completion")
                .expect("subscriber dropped without completing");
            if let Delivery::Completed(c) = &delivery {
                let c = c.clone();
                self.seen.push(delivery);
                return c;
            }
            self.seen.push(delivery);
        }
    }

    /// Wait for the next progress call
    pub async fn progress(&mut self) -> DownloadProgress {
        loop {
            let delivery = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for progress")
                .expect("subscriber dropped");
            if let Delivery::Progress(p) = delivery {
                self.seen.push(delivery);
                return p;
            }
            self.seen.push(delivery);
        }
    }

    pub fn completions(&self) -> Vec<&Completion> {
        self.seen
            .iter()
            .filter_map(|d| match d {
                Delivery::Completed(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn progress_count(&self) -> usize {
        self.seen
            .iter()
            .filter(|d| matches!(d, Delivery::Progress(_)))
            .count()
    }
}
