//! Reference implementations of the model-facing ports.
//!
//! - [`LexiconNlp`] - Regex and phrase-lexicon syntactic capability
//! - [`RateLimitedInference`] - Rate limiting for any inference client
//! - `OpenAiInference` - OpenAI-compatible inference (requires `openai` feature)

pub mod lexicon;
pub mod rate_limited;

#[cfg(feature = "openai")]
mod openai;

pub use lexicon::LexiconNlp;
pub use rate_limited::{InferenceClientExt, RateLimitedInference};

#[cfg(feature = "openai")]
pub use openai::OpenAiInference;
