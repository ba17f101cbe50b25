//! Lexicon-driven syntactic capability.
//!
//! A small reference implementation of [`SyntacticExtractor`]: entity spans
//! come from regexes and a service dictionary, relation verbs from a phrase
//! lexicon, and each verb takes the nearest entity before it as subject and
//! the nearest entity after it (in the same sentence) as object.
//!
//! Good enough for tests and local runs; production deployments inject a
//! real NLP model behind the same trait.

use std::collections::HashMap;

use regex::Regex;

use crate::traits::syntactic::{Analysis, Clause, EntitySpan, SyntacticExtractor};
use crate::types::config::DeterministicConfig;
use crate::types::document::{sentence_spans, Span};
use crate::types::fact::NodeKind;

/// Verb lemmas and their surface forms.
const VERB_LEXICON: &[(&str, &[&str])] = &[
    ("depend on", &["depends on", "depend on", "depending on", "depended on", "is dependent on"]),
    ("run on", &["runs on", "run on", "running on", "ran on", "is hosted on", "hosted on"]),
    ("deploy to", &["deployed to", "deploys to", "deploy to"]),
    ("resolve to", &["resolves to", "resolve to", "resolved to"]),
    ("route to", &["routes traffic to", "routes to", "route to", "routed to", "routing to"]),
    ("proxy to", &["proxies requests to", "proxies to", "proxy to", "proxied to"]),
    ("expose", &["exposes", "expose", "exposed"]),
    ("listen on", &["listens on", "listen on", "listening on"]),
    ("bind", &["binds to", "bound to", "binds", "bind"]),
    ("call", &["calls", "call", "called", "invokes"]),
    ("connect to", &["connects to", "connect to", "connected to", "connecting to"]),
    ("use", &["uses", "use"]),
    ("require", &["requires", "require"]),
    ("need", &["needs", "need"]),
    ("point to", &["points to", "point to", "points at", "pointed at"]),
    ("reach", &["reaches", "reach"]),
    // Recognized relation verbs with no pattern binding.
    ("talk to", &["talks to", "talk to", "talking to"]),
    ("forward to", &["forwards to", "forward to", "forwarded to"]),
    ("sync with", &["syncs with", "sync with", "synchronizes with"]),
    ("replicate to", &["replicates to", "replicate to", "replicated to"]),
    ("send to", &["sends data to", "sends to", "send to"]),
    ("communicate with", &["communicates with", "communicate with"]),
];

struct Tagger {
    kind: NodeKind,
    pattern: Regex,
    /// Capture group holding the entity text (0 = whole match)
    group: usize,
    score: f64,
}

/// Dictionary + regex tagger with a verb-phrase lexicon.
pub struct LexiconNlp {
    taggers: Vec<Tagger>,
    verbs: Regex,
    lemmas: HashMap<String, &'static str>,
}

impl LexiconNlp {
    /// Build with the default service dictionary.
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_config(&DeterministicConfig::default())
    }

    /// Build with the services listed in `config`.
    pub fn with_config(config: &DeterministicConfig) -> Result<Self, regex::Error> {
        let mut taggers = vec![
            Tagger {
                kind: NodeKind::Endpoint,
                pattern: Regex::new(r#"\b(?:https?|grpc|tcp|wss?)://[^\s"'<>;,()\]]+[^\s"'<>;,()\].]"#)?,
                group: 0,
                score: 0.95,
            },
            Tagger {
                kind: NodeKind::Ip,
                pattern: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b")?,
                group: 0,
                score: 0.95,
            },
            Tagger {
                kind: NodeKind::Port,
                pattern: Regex::new(r"(?i)\bport\s+(\d{1,5})\b")?,
                group: 1,
                score: 0.9,
            },
            Tagger {
                kind: NodeKind::Proxy,
                pattern: Regex::new(r"(?i)\b([a-z][a-z0-9-]*)\s+(?:proxy|load balancer|gateway)\b")?,
                group: 1,
                score: 0.7,
            },
        ];

        let mut names: Vec<&str> = config.known_services.iter().map(String::as_str).collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        if !names.is_empty() {
            let alternation = names.iter().map(|n| regex::escape(n)).collect::<Vec<_>>().join("|");
            taggers.push(Tagger {
                kind: NodeKind::Service,
                pattern: Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))?,
                group: 0,
                score: 0.9,
            });
        }

        taggers.push(Tagger {
            kind: NodeKind::Service,
            pattern: Regex::new(r"(?i)\b([a-z][a-z0-9-]*)\s+(?:service|worker)\b")?,
            group: 1,
            score: 0.6,
        });
        taggers.push(Tagger {
            kind: NodeKind::Host,
            pattern: Regex::new(r"(?i)\b[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9-]+)*\.[a-z]{2,}\b")?,
            group: 0,
            score: 0.7,
        });

        let mut surfaces: Vec<(&str, &'static str)> = VERB_LEXICON
            .iter()
            .flat_map(|(lemma, forms)| forms.iter().map(move |form| (*form, *lemma)))
            .collect();
        surfaces.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let alternation = surfaces
            .iter()
            .map(|(form, _)| regex::escape(form).replace(' ', r"\s+"))
            .collect::<Vec<_>>()
            .join("|");
        let verbs = Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))?;
        let lemmas = surfaces
            .into_iter()
            .map(|(form, lemma)| (form.to_string(), lemma))
            .collect();

        Ok(Self { taggers, verbs, lemmas })
    }

    fn tag(&self, text: &str) -> Vec<EntitySpan> {
        let mut entities: Vec<EntitySpan> = Vec::new();
        for tagger in &self.taggers {
            for caps in tagger.pattern.captures_iter(text) {
                let Some(m) = caps.get(tagger.group) else {
                    continue;
                };
                let span = Span::new(m.start(), m.end());
                let whole = caps.get(0).map_or(span, |w| Span::new(w.start(), w.end()));
                if entities
                    .iter()
                    .any(|e| whole.start < e.span.end && e.span.start < whole.end)
                {
                    continue;
                }
                if tagger.kind == NodeKind::Host && m.as_str().parse::<std::net::IpAddr>().is_ok() {
                    continue;
                }
                entities.push(EntitySpan {
                    kind: tagger.kind,
                    text: m.as_str().to_string(),
                    span,
                    score: tagger.score,
                });
            }
        }
        entities.sort_by_key(|e| e.span.start);
        entities
    }

    fn lemma(&self, surface: &str) -> Option<&'static str> {
        let normalized = surface.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        self.lemmas.get(&normalized).copied()
    }
}

impl SyntacticExtractor for LexiconNlp {
    fn analyze(&self, text: &str) -> Analysis {
        let entities = self.tag(text);
        let sentences = sentence_spans(text);
        let sentence_of = |pos: usize| sentences.iter().position(|s| pos >= s.start && pos < s.end);

        let mut clauses = Vec::new();
        for m in self.verbs.find_iter(text) {
            let Some(verb) = self.lemma(m.as_str()) else {
                continue;
            };
            let span = Span::new(m.start(), m.end());
            if entities.iter().any(|e| span.start < e.span.end && e.span.start < span.end) {
                continue;
            }
            let sentence = sentence_of(span.start);

            let subject = entities
                .iter()
                .enumerate()
                .filter(|(_, e)| e.span.end <= span.start && sentence_of(e.span.start) == sentence)
                .last()
                .map(|(i, _)| i);
            let object = entities
                .iter()
                .enumerate()
                .find(|(_, e)| e.span.start >= span.end && sentence_of(e.span.start) == sentence)
                .map(|(i, _)| i);

            clauses.push(Clause {
                verb: verb.to_string(),
                span,
                subject,
                object,
            });
        }

        Analysis { entities, clauses }
    }

    fn name(&self) -> &str {
        "lexicon"
    }
}
