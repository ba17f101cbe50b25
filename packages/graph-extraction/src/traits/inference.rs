//! Pluggable text-generation capability used by Tier C.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::InferenceError;
use crate::types::document::{Span, Window};

/// One window submitted for inference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceItem {
    pub window_id: Uuid,
    pub doc_id: Uuid,
    pub section: Option<String>,
    pub span: Span,
    pub text: String,
}

impl From<&Window> for InferenceItem {
    fn from(window: &Window) -> Self {
        Self {
            window_id: window.window_id,
            doc_id: window.doc_id,
            section: window.section.clone(),
            span: window.span,
            text: window.text.clone(),
        }
    }
}

/// A batch of windows plus the fixed output schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRequest {
    pub items: Vec<InferenceItem>,

    /// JSON schema every reply must satisfy
    pub schema: serde_json::Value,

    /// Always 0.0 for deterministic decoding
    pub temperature: f32,
}

/// Raw model output for one item.
pub type InferenceReply = std::result::Result<String, InferenceError>;

/// Text-generation capability.
///
/// Implementations wrap a specific provider and must return exactly one reply
/// per request item, in request order. A batch-level `Err` fails every item.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer_batch(
        &self,
        request: &InferenceRequest,
    ) -> std::result::Result<Vec<InferenceReply>, InferenceError>;
}

#[async_trait]
impl<T: InferenceClient + ?Sized> InferenceClient for Arc<T> {
    async fn infer_batch(
        &self,
        request: &InferenceRequest,
    ) -> std::result::Result<Vec<InferenceReply>, InferenceError> {
        (**self).infer_batch(request).await
    }
}
