//! Upstream document and window records.
//!
//! Both are produced by the ingestion/chunking subsystem and are read-only to
//! the extraction core.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Kind of source a document was normalized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Config,
    Markdown,
    Html,
    Pdf,
    Table,
    Text,
}

/// An ingested source unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: Uuid,
    pub source_type: SourceType,

    /// SHA-256 of the normalized document content
    pub content_hash: String,

    /// Retention policy tag assigned upstream, if any
    #[serde(default)]
    pub retention_policy: Option<String>,
}

impl Document {
    /// Create a document record from its normalized content.
    pub fn new(source_type: SourceType, content: &str) -> Self {
        Self {
            doc_id: Uuid::new_v4(),
            source_type,
            content_hash: hash_content(content),
            retention_policy: None,
        }
    }

    /// Use a specific document id.
    pub fn with_id(mut self, doc_id: Uuid) -> Self {
        self.doc_id = doc_id;
        self
    }

    /// Set the retention policy.
    pub fn with_retention_policy(mut self, policy: impl Into<String>) -> Self {
        self.retention_policy = Some(policy.into());
        self
    }
}

/// Half-open byte range `[start, end)` in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `other` lies entirely inside this span.
    pub fn contains(&self, other: &Span) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Shift a window-relative span into document coordinates.
    pub fn offset(&self, by: usize) -> Span {
        Span::new(self.start + by, self.end + by)
    }
}

/// A bounded span of document text dispatched as one extraction unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub window_id: Uuid,
    pub doc_id: Uuid,
    pub text: String,
    pub token_count: usize,

    /// Location of `text` inside the source document
    pub span: Span,

    /// Section heading the window was cut from
    #[serde(default)]
    pub section: Option<String>,
}

impl Window {
    /// Create a window starting at `start` in the document.
    ///
    /// The token count is estimated; use [`Window::with_token_count`] when the
    /// chunker supplies an exact count.
    pub fn new(doc_id: Uuid, text: impl Into<String>, start: usize) -> Self {
        let text = text.into();
        let span = Span::new(start, start + text.len());
        Self {
            window_id: Uuid::new_v4(),
            doc_id,
            token_count: estimate_tokens(&text),
            text,
            span,
            section: None,
        }
    }

    /// Set the chunker-provided token count.
    pub fn with_token_count(mut self, token_count: usize) -> Self {
        self.token_count = token_count;
        self
    }

    /// Set the section heading.
    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Cut a sub-window out of this window.
    ///
    /// `relative` is a byte range into `self.text`; it is clamped to char
    /// boundaries inside the text.
    pub fn sub_window(&self, relative: Span) -> Window {
        let start = floor_char_boundary(&self.text, relative.start.min(self.text.len()));
        let end = floor_char_boundary(&self.text, relative.end.min(self.text.len())).max(start);
        let text = self.text[start..end].to_string();
        Window {
            window_id: Uuid::new_v4(),
            doc_id: self.doc_id,
            token_count: estimate_tokens(&text),
            text,
            span: Span::new(self.span.start + start, self.span.start + end),
            section: self.section.clone(),
        }
    }

    /// SHA-256 of the window text alone.
    pub fn content_hash(&self) -> String {
        hash_content(&self.text)
    }
}

/// SHA-256 hex digest of text content.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rough token estimate: one token per four bytes, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Split text into sentence spans (byte ranges relative to `text`).
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace, or at a blank
/// line. Dots inside hostnames, versions and URLs do not split. Leading and
/// trailing whitespace is excluded from each span.
pub fn sentence_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    let push = |from: usize, to: usize, spans: &mut Vec<Span>| {
        let piece = &text[from..to];
        let lead = piece.len() - piece.trim_start().len();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            spans.push(Span::new(from + lead, from + lead + trimmed.len()));
        }
    };

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let terminal = matches!(b, b'.' | b'!' | b'?')
            && bytes.get(i + 1).map_or(true, |next| next.is_ascii_whitespace());
        let paragraph = b == b'\n' && bytes.get(i + 1) == Some(&b'\n');
        if terminal {
            push(start, i + 1, &mut spans);
            start = i + 1;
        } else if paragraph {
            push(start, i, &mut spans);
            start = i + 1;
        }
        i += 1;
    }
    push(start, text.len(), &mut spans);
    spans
}
