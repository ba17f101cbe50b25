//! Tier B: syntactic extraction over the spans Tier A left unresolved.
//!
//! Each unresolved span is split into sentences and handed to the injected
//! [`SyntacticExtractor`]. Clauses whose verb and argument kinds match a
//! pattern become relationships; sentences the patterns cannot explain are
//! flagged for Tier C.

use tracing::debug;

use crate::pipeline::patterns;
use crate::traits::syntactic::SyntacticExtractor;
use crate::types::config::EscalationConfig;
use crate::types::document::{estimate_tokens, sentence_spans, Span, Window};
use crate::types::fact::{
    Confidence, ExtractedEntity, ExtractedRelationship, Fact, NodeKey, Provenance, Tier,
};

/// Why a sentence was escalated.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationReason {
    /// Two entities joined by a relation verb no pattern binds
    UnboundVerb(String),

    /// Many entities, few of them explained by bound relations
    Dense { density: f32, coverage: f32 },
}

/// A sentence flagged for Tier C. `span` is relative to the window text.
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub span: Span,
    pub reason: EscalationReason,
}

/// Tier B result for one window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyntacticOutput {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
    pub escalations: Vec<Escalation>,
}

impl SyntacticOutput {
    pub fn escalates(&self) -> bool {
        !self.escalations.is_empty()
    }

    pub fn into_facts(self) -> Vec<Fact> {
        self.entities
            .into_iter()
            .map(Fact::from)
            .chain(self.relationships.into_iter().map(Fact::from))
            .collect()
    }
}

/// Runs a syntactic capability and applies the relation patterns.
pub struct SyntacticTier<N> {
    nlp: N,
    config: EscalationConfig,
    extractor_version: String,
}

impl<N: SyntacticExtractor> SyntacticTier<N> {
    pub fn new(nlp: N, config: EscalationConfig, extractor_version: impl Into<String>) -> Self {
        Self {
            nlp,
            config,
            extractor_version: extractor_version.into(),
        }
    }

    pub fn nlp(&self) -> &N {
        &self.nlp
    }

    /// Extract from the given window-relative spans.
    pub fn extract(&self, window: &Window, spans: &[Span]) -> SyntacticOutput {
        let mut output = SyntacticOutput::default();
        for span in spans {
            let end = span.end.min(window.text.len());
            let Some(text) = window.text.get(span.start..end) else {
                continue;
            };
            for sentence in sentence_spans(text) {
                let absolute = sentence.offset(span.start);
                self.sentence(window, absolute, &mut output);
            }
        }

        debug!(
            window_id = %window.window_id,
            entities = output.entities.len(),
            relationships = output.relationships.len(),
            escalations = output.escalations.len(),
            "tier B extraction complete"
        );
        output
    }

    fn provenance(&self, window: &Window, relative: Span, method: String) -> Provenance {
        Provenance {
            doc_id: window.doc_id,
            window_id: window.window_id,
            span: relative.offset(window.span.start),
            section: window.section.clone(),
            tier: Tier::B,
            extractor_version: self.extractor_version.clone(),
            method,
        }
    }

    fn sentence(&self, window: &Window, sentence: Span, output: &mut SyntacticOutput) {
        let text = &window.text[sentence.start..sentence.end];
        let analysis = self.nlp.analyze(text);

        let keys: Vec<Option<NodeKey>> = analysis
            .entities
            .iter()
            .map(|e| NodeKey::parse(e.kind, &e.text).ok())
            .collect();

        for (entity, key) in analysis.entities.iter().zip(&keys) {
            let Some(key) = key else {
                continue;
            };
            let provenance = self.provenance(window, entity.span.offset(sentence.start), self.nlp.name().to_string());
            output.entities.push(ExtractedEntity::new(
                key.clone(),
                Confidence::clamped(entity.score),
                provenance,
            ));
        }

        let mut covered = vec![false; analysis.entities.len()];
        let mut unbound: Option<String> = None;

        for clause in &analysis.clauses {
            let (Some(s), Some(o)) = (clause.subject, clause.object) else {
                continue;
            };
            let (Some(Some(subject)), Some(Some(object))) = (keys.get(s), keys.get(o)) else {
                continue;
            };

            match patterns::bind(&clause.verb, subject.kind, object.kind) {
                Some(pattern) => {
                    let score = analysis.entities[s].score.min(analysis.entities[o].score);
                    let confidence = Confidence::clamped(pattern.specificity.weight() * score);
                    let method = format!("{}:{}", self.nlp.name(), clause.verb);
                    let range = Span::new(
                        analysis.entities[s].span.start.min(clause.span.start),
                        analysis.entities[o].span.end.max(clause.span.end),
                    );
                    let provenance = self.provenance(window, range.offset(sentence.start), method);
                    if let Ok(rel) =
                        ExtractedRelationship::new(pattern.kind, subject.clone(), object.clone(), confidence, provenance)
                    {
                        output.relationships.push(rel);
                        covered[s] = true;
                        covered[o] = true;
                    }
                }
                None => {
                    unbound.get_or_insert_with(|| clause.verb.clone());
                }
            }
        }

        if let Some(verb) = unbound {
            output.escalations.push(Escalation {
                span: sentence,
                reason: EscalationReason::UnboundVerb(verb),
            });
            return;
        }

        let mentions = keys.iter().filter(|k| k.is_some()).count();
        if mentions < 2 {
            return;
        }
        let tokens = estimate_tokens(text).max(1);
        let density = mentions as f32 * 100.0 / tokens as f32;
        let coverage = covered.iter().filter(|c| **c).count() as f32 / mentions as f32;
        if density > self.config.density_threshold && coverage < self.config.min_coverage {
            output.escalations.push(Escalation {
                span: sentence,
                reason: EscalationReason::Dense { density, coverage },
            });
        }
    }
}
