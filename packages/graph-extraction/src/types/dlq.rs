//! Dead letter queue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::document::Window;

/// How a failed extraction should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, network blip, rate limit
    Transient,
    /// Model output did not validate against the schema
    SchemaInvalid,
    /// Can never succeed (e.g. window over the token limit)
    NonRetryable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::SchemaInvalid => "schema_invalid",
            FailureKind::NonRetryable => "non_retryable",
        }
    }
}

/// Lifecycle of a dead-lettered window.
///
/// `New → Pending → {Succeeded | Retrying(1) → Retrying(2) → Retrying(3) → PermanentlyFailed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DlqState {
    New,
    Pending,
    Retrying { attempt: u32 },
    Succeeded,
    PermanentlyFailed,
}

impl DlqState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DlqState::Succeeded | DlqState::PermanentlyFailed)
    }
}

/// One failed attempt, kept for forensics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub failure: FailureKind,
    pub error: String,
}

/// A window whose Tier C extraction failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Cache key of the window: hash of text plus extractor version
    pub content_hash: String,

    /// The window itself, so a retry can run without the source document
    pub window: Window,

    pub extractor_version: String,

    /// Latest error message
    pub error: String,
    pub failure: FailureKind,

    /// Number of retries attempted so far (never exceeds the policy maximum)
    pub retry_count: u32,
    pub state: DlqState,

    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,

    /// When the next retry becomes due
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Every failure seen for this entry, oldest first
    #[serde(default)]
    pub history: Vec<FailureRecord>,

    /// When a worker claimed the entry for its current retry
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Windows of other documents with the same text that failed while this
    /// entry was queued; a recovery produces facts for each of them
    #[serde(default)]
    pub waiting: Vec<Window>,
}

impl DlqEntry {
    /// Create a fresh entry for a first failure.
    pub fn new(
        window: Window,
        extractor_version: impl Into<String>,
        content_hash: impl Into<String>,
        failure: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let error = error.into();
        Self {
            content_hash: content_hash.into(),
            window,
            extractor_version: extractor_version.into(),
            history: vec![FailureRecord {
                at: now,
                failure,
                error: error.clone(),
            }],
            error,
            failure,
            retry_count: 0,
            state: DlqState::New,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: None,
            claimed_at: None,
            waiting: Vec::new(),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.window.doc_id
    }

    pub fn window_id(&self) -> Uuid {
        self.window.window_id
    }

    /// The dead-lettered window followed by every window waiting on it.
    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        std::iter::once(&self.window).chain(&self.waiting)
    }

    /// Attach another window with the same content. Returns false if the
    /// window, or another window of the same document, is already attached.
    pub fn add_waiting(&mut self, window: Window) -> bool {
        if self
            .windows()
            .any(|w| w.window_id == window.window_id || w.doc_id == window.doc_id)
        {
            return false;
        }
        self.waiting.push(window);
        true
    }

    /// Record another failed attempt.
    pub fn record_failure(&mut self, failure: FailureKind, error: impl Into<String>) {
        let now = Utc::now();
        let error = error.into();
        self.history.push(FailureRecord {
            at: now,
            failure,
            error: error.clone(),
        });
        self.error = error;
        self.failure = failure;
        self.last_failed_at = now;
    }
}
