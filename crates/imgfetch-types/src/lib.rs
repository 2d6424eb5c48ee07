//! Shared types for imgfetch
//!
//! This crate contains the plain data structures shared between the
//! download engine and the CLI: request options, queue configuration,
//! operation states and the events the engine broadcasts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Request Types
// ============================================================================

/// Per-request download flags
///
/// Immutable once a request has been submitted to the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadOptions(u8);

impl DownloadOptions {
    /// Admit after every normal-priority request
    pub const LOW_PRIORITY: Self = Self(1 << 0);
    /// Deliver the partial buffer through the completion callback per chunk
    pub const PROGRESSIVE_DOWNLOAD: Self = Self(1 << 1);
    /// Let the HTTP layer use its response cache. Without it every
    /// request bypasses the cache.
    pub const USE_HTTP_CACHE: Self = Self(1 << 2);
    /// Complete with an empty payload when the response came from cache
    /// (only meaningful together with `USE_HTTP_CACHE`)
    pub const IGNORE_CACHED_RESPONSE: Self = Self(1 << 3);

    const ALL: u8 = 0b1111;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Priority class this request is admitted in
    pub fn priority(&self) -> Priority {
        if self.contains(Self::LOW_PRIORITY) {
            Priority::Low
        } else {
            Priority::Normal
        }
    }
}

impl BitOr for DownloadOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DownloadOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl FromStr for DownloadOptions {
    type Err = String;

    /// Parse a single flag name, e.g. `progressive` or `use-cache`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "low-priority" | "low" => Ok(Self::LOW_PRIORITY),
            "progressive" | "progressive-download" => Ok(Self::PROGRESSIVE_DOWNLOAD),
            "use-cache" | "use-http-cache" => Ok(Self::USE_HTTP_CACHE),
            "ignore-cached" | "ignore-cached-response" => Ok(Self::IGNORE_CACHED_RESPONSE),
            other => Err(format!("Unknown download option: {}", other)),
        }
    }
}

impl fmt::Display for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::LOW_PRIORITY, "low-priority"),
            (Self::PROGRESSIVE_DOWNLOAD, "progressive"),
            (Self::USE_HTTP_CACHE, "use-cache"),
            (Self::IGNORE_CACHED_RESPONSE, "ignore-cached"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();

        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Admission priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Low,
}

/// Case-insensitive HTTP header map
///
/// Keys compare case-insensitively but keep the spelling they were last set
/// with. Setting an empty value removes the field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct HeaderSet {
    /// lowercase name -> (original name, value)
    fields: BTreeMap<String, (String, String)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or remove a field. `None` and empty values remove it.
    pub fn set(&mut self, field: &str, value: Option<&str>) {
        let key = field.trim().to_ascii_lowercase();
        if key.is_empty() {
            return;
        }
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => {
                self.fields
                    .insert(key, (field.trim().to_string(), value.to_string()));
            }
            None => {
                self.fields.remove(&key);
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .get(&field.trim().to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate `(name, value)` pairs in lowercase-name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Overlay `other` onto this set; fields in `other` win
    pub fn merge(&mut self, other: &HeaderSet) {
        for (name, value) in other.iter() {
            self.set(name, Some(value));
        }
    }
}

impl From<BTreeMap<String, String>> for HeaderSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        let mut set = HeaderSet::new();
        for (name, value) in &map {
            set.set(name, Some(value));
        }
        set
    }
}

impl From<HeaderSet> for BTreeMap<String, String> {
    fn from(set: HeaderSet) -> Self {
        set.fields.into_values().collect()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut set = HeaderSet::new();
        for (name, value) in iter {
            set.set(name, Some(value));
        }
        set
    }
}

// ============================================================================
// Operation Types
// ============================================================================

/// Lifecycle of a single download operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationState::Queued => "queued",
            OperationState::Executing => "executing",
            OperationState::Completed => "completed",
            OperationState::Failed => "failed",
            OperationState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Byte counters reported on every received chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub received: u64,
    /// `None` until headers arrive, or when the response has no length
    pub expected: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<f64> {
        match self.expected {
            Some(total) if total > 0 => Some((self.received as f64 / total as f64) * 100.0),
            _ => None,
        }
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Queue discipline for admitting pending operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    /// Admit in submission order
    #[default]
    Fifo,
    /// Admit the most recently submitted operation first
    Lifo,
}

impl FromStr for ExecutionOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fifo" | "queue" => Ok(ExecutionOrder::Fifo),
            "lifo" | "stack" => Ok(ExecutionOrder::Lifo),
            other => Err(format!("Unknown execution order: {}", other)),
        }
    }
}

/// Download manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Upper bound on operations in the executing state (at least 1)
    pub max_concurrent_downloads: usize,
    pub execution_order: ExecutionOrder,
    /// Headers merged into every request at submission time
    pub headers: HeaderSet,
    /// Share one in-flight fetch between submissions of the same URL
    pub coalesce_requests: bool,
    /// Buffer size of the started/stopped event channel
    pub event_capacity: usize,
}

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 6;
pub const DEFAULT_ACCEPT_HEADER: &str = "image/webp,image/*;q=0.8";

impl Default for DownloaderConfig {
    fn default() -> Self {
        let mut headers = HeaderSet::new();
        headers.set("Accept", Some(DEFAULT_ACCEPT_HEADER));

        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            execution_order: ExecutionOrder::Fifo,
            headers,
            coalesce_requests: false,
            event_capacity: 256,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Informational events broadcast by a download manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    /// Sent on admission, before any callback of the operation fires
    DownloadStarted { id: Uuid, url: String },
    /// Sent after the operation reached a terminal state
    DownloadStopped {
        id: Uuid,
        url: String,
        state: OperationState,
    },
}

impl DownloadEvent {
    pub fn id(&self) -> Uuid {
        match self {
            DownloadEvent::DownloadStarted { id, .. } | DownloadEvent::DownloadStopped { id, .. } => {
                *id
            }
        }
    }
}
