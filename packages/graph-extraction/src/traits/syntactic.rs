//! Pluggable natural-language capability used by Tier B.
//!
//! The capability does span-level entity tagging and a shallow dependency
//! analysis that links relation verbs to their subject and object. Turning
//! that analysis into graph facts (and deciding what to escalate) is Tier B's
//! job, not the capability's.

use std::sync::Arc;

use crate::types::document::Span;
use crate::types::fact::NodeKind;

/// A tagged entity mention. `span` is relative to the analyzed text.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySpan {
    pub kind: NodeKind,
    pub text: String,
    pub span: Span,

    /// Tagger confidence in `[0, 1]`
    pub score: f64,
}

/// A relation verb with its syntactic arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// Lowercase verb lemma, possibly multi-word ("depend on", "talk to")
    pub verb: String,
    pub span: Span,

    /// Index into [`Analysis::entities`]
    pub subject: Option<usize>,

    /// Index into [`Analysis::entities`]
    pub object: Option<usize>,
}

/// Output of one analysis call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub entities: Vec<EntitySpan>,
    pub clauses: Vec<Clause>,
}

/// Entity tagging + relation-verb analysis over plain text.
pub trait SyntacticExtractor: Send + Sync {
    fn analyze(&self, text: &str) -> Analysis;

    /// Short name recorded as the extraction method.
    fn name(&self) -> &str {
        "syntactic"
    }
}

impl<T: SyntacticExtractor + ?Sized> SyntacticExtractor for Arc<T> {
    fn analyze(&self, text: &str) -> Analysis {
        (**self).analyze(text)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
