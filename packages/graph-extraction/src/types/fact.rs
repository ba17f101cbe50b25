//! Extracted facts and the closed graph vocabulary they are written with.
//!
//! Node labels and relationship types never come from free text: model or
//! pattern output is parsed into [`NodeKind`] / [`RelKind`] and every storage
//! backend dispatches on those enums through static lookup tables.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchemaError;
use crate::types::document::Span;

/// Which extraction strategy produced a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Deterministic pattern/dictionary matching
    A,
    /// Syntactic NLP matching
    B,
    /// Generative-model inference
    C,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::A, Tier::B, Tier::C];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node labels the graph accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    Service,
    Host,
    Ip,
    Proxy,
    Endpoint,
    Port,
    Document,
}

struct NodeRule {
    kind: NodeKind,
    label: &'static str,
    key_property: &'static str,
    aliases: &'static [&'static str],
}

// Indexed by discriminant.
const NODE_RULES: [NodeRule; 7] = [
    NodeRule {
        kind: NodeKind::Service,
        label: "Service",
        key_property: "name",
        aliases: &["service", "app", "application", "database", "db"],
    },
    NodeRule {
        kind: NodeKind::Host,
        label: "Host",
        key_property: "hostname",
        aliases: &["host", "hostname", "server", "machine"],
    },
    NodeRule {
        kind: NodeKind::Ip,
        label: "IP",
        key_property: "address",
        aliases: &["ip", "ip_address", "ipaddress", "address"],
    },
    NodeRule {
        kind: NodeKind::Proxy,
        label: "Proxy",
        key_property: "name",
        aliases: &["proxy", "load_balancer", "loadbalancer", "gateway"],
    },
    NodeRule {
        kind: NodeKind::Endpoint,
        label: "Endpoint",
        key_property: "url",
        aliases: &["endpoint", "url", "route"],
    },
    NodeRule {
        kind: NodeKind::Port,
        label: "Port",
        key_property: "number",
        aliases: &["port"],
    },
    NodeRule {
        kind: NodeKind::Document,
        label: "Document",
        key_property: "docId",
        aliases: &["document", "doc"],
    },
];

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Service,
        NodeKind::Host,
        NodeKind::Ip,
        NodeKind::Proxy,
        NodeKind::Endpoint,
        NodeKind::Port,
        NodeKind::Document,
    ];

    fn rule(&self) -> &'static NodeRule {
        &NODE_RULES[*self as usize]
    }

    /// Graph label.
    pub fn label(&self) -> &'static str {
        self.rule().label
    }

    /// Property holding the natural key on the stored node.
    pub fn key_property(&self) -> &'static str {
        self.rule().key_property
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for NodeKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        NODE_RULES
            .iter()
            .find(|rule| rule.label.eq_ignore_ascii_case(&needle) || rule.aliases.contains(&needle.as_str()))
            .map(|rule| rule.kind)
            .ok_or_else(|| SchemaError::UnknownEntityType(s.to_string()))
    }
}

/// Relationship types the graph accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelKind {
    DependsOn,
    BindsPort,
    RunsOn,
    ResolvesTo,
    RoutesTo,
    Exposes,
    Calls,
    ConnectsTo,
    MentionedIn,
}

struct RelRule {
    kind: RelKind,
    rel_type: &'static str,
    allowed: &'static [(NodeKind, NodeKind)],
}

use NodeKind as N;

// Indexed by discriminant.
const REL_RULES: [RelRule; 9] = [
    RelRule {
        kind: RelKind::DependsOn,
        rel_type: "DEPENDS_ON",
        allowed: &[(N::Service, N::Service), (N::Proxy, N::Service)],
    },
    RelRule {
        kind: RelKind::BindsPort,
        rel_type: "BINDS_PORT",
        allowed: &[(N::Service, N::Port), (N::Proxy, N::Port)],
    },
    RelRule {
        kind: RelKind::RunsOn,
        rel_type: "RUNS_ON",
        allowed: &[(N::Service, N::Host), (N::Proxy, N::Host)],
    },
    RelRule {
        kind: RelKind::ResolvesTo,
        rel_type: "RESOLVES_TO",
        allowed: &[(N::Host, N::Ip)],
    },
    RelRule {
        kind: RelKind::RoutesTo,
        rel_type: "ROUTES_TO",
        allowed: &[
            (N::Proxy, N::Service),
            (N::Proxy, N::Endpoint),
            (N::Proxy, N::Host),
            (N::Service, N::Service),
            (N::Service, N::Endpoint),
        ],
    },
    RelRule {
        kind: RelKind::Exposes,
        rel_type: "EXPOSES",
        allowed: &[(N::Service, N::Endpoint), (N::Proxy, N::Endpoint)],
    },
    RelRule {
        kind: RelKind::Calls,
        rel_type: "CALLS",
        allowed: &[(N::Service, N::Service), (N::Service, N::Endpoint)],
    },
    RelRule {
        kind: RelKind::ConnectsTo,
        rel_type: "CONNECTS_TO",
        allowed: &[
            (N::Service, N::Service),
            (N::Service, N::Host),
            (N::Service, N::Ip),
            (N::Service, N::Endpoint),
            (N::Host, N::Host),
            (N::Proxy, N::Service),
        ],
    },
    RelRule {
        kind: RelKind::MentionedIn,
        rel_type: "MENTIONED_IN",
        allowed: &[
            (N::Service, N::Document),
            (N::Host, N::Document),
            (N::Ip, N::Document),
            (N::Proxy, N::Document),
            (N::Endpoint, N::Document),
            (N::Port, N::Document),
        ],
    },
];

impl RelKind {
    pub const ALL: [RelKind; 9] = [
        RelKind::DependsOn,
        RelKind::BindsPort,
        RelKind::RunsOn,
        RelKind::ResolvesTo,
        RelKind::RoutesTo,
        RelKind::Exposes,
        RelKind::Calls,
        RelKind::ConnectsTo,
        RelKind::MentionedIn,
    ];

    fn rule(&self) -> &'static RelRule {
        &REL_RULES[*self as usize]
    }

    /// Graph relationship type.
    pub fn rel_type(&self) -> &'static str {
        self.rule().rel_type
    }

    /// Whether this relationship may connect the two node kinds.
    pub fn allows(&self, subject: NodeKind, object: NodeKind) -> bool {
        self.rule().allowed.contains(&(subject, object))
    }
}

impl fmt::Display for RelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rel_type())
    }
}

impl FromStr for RelKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle: String = s
            .trim()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        REL_RULES
            .iter()
            .find(|rule| rule.rel_type == needle)
            .map(|rule| rule.kind)
            .ok_or_else(|| SchemaError::UnknownRelationType(s.to_string()))
    }
}

/// Natural key of a node: its kind plus a canonical key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub kind: NodeKind,
    pub value: String,
}

impl NodeKey {
    /// Parse and canonicalize a raw key value for `kind`.
    pub fn parse(kind: NodeKind, raw: &str) -> Result<Self, SchemaError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SchemaError::EmptyName(kind.label().to_string()));
        }
        let invalid = || SchemaError::InvalidKey {
            kind: kind.label().to_string(),
            value: raw.to_string(),
        };

        let value = match kind {
            NodeKind::Service | NodeKind::Proxy => normalize_name(trimmed),
            NodeKind::Host => {
                let host = trimmed.trim_end_matches('.').to_ascii_lowercase();
                if host.is_empty()
                    || !host
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
                {
                    return Err(invalid());
                }
                host
            }
            NodeKind::Ip => trimmed.parse::<IpAddr>().map_err(|_| invalid())?.to_string(),
            NodeKind::Port => match trimmed.parse::<u16>() {
                Ok(0) | Err(_) => return Err(invalid()),
                Ok(port) => port.to_string(),
            },
            NodeKind::Document => trimmed.parse::<Uuid>().map_err(|_| invalid())?.to_string(),
            NodeKind::Endpoint => canonical_endpoint(trimmed).ok_or_else(invalid)?,
        };

        Ok(Self { kind, value })
    }

    pub fn service(name: &str) -> Self {
        Self {
            kind: NodeKind::Service,
            value: normalize_name(name),
        }
    }

    pub fn proxy(name: &str) -> Self {
        Self {
            kind: NodeKind::Proxy,
            value: normalize_name(name),
        }
    }

    pub fn port(port: u16) -> Self {
        Self {
            kind: NodeKind::Port,
            value: port.to_string(),
        }
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self {
            kind: NodeKind::Ip,
            value: addr.to_string(),
        }
    }

    pub fn document(doc_id: Uuid) -> Self {
        Self {
            kind: NodeKind::Document,
            value: doc_id.to_string(),
        }
    }

    /// Composite endpoint key `scheme://host:port/path`.
    pub fn endpoint(scheme: &str, host: &str, port: u16, path: &str) -> Self {
        let path = if path.is_empty() { "/" } else { path };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self {
            kind: NodeKind::Endpoint,
            value: format!(
                "{}://{}:{}{}",
                scheme.to_ascii_lowercase(),
                host.to_ascii_lowercase(),
                port,
                path
            ),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.label(), self.value)
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

fn canonical_endpoint(raw: &str) -> Option<String> {
    let parsed = if raw.contains("://") {
        url::Url::parse(raw).ok()?
    } else {
        url::Url::parse(&format!("http://{}", raw)).ok()?
    };
    let host = parsed.host_str()?;
    let port = parsed.port_or_known_default()?;
    Some(NodeKey::endpoint(parsed.scheme(), host, port, parsed.path()).value)
}

/// Extraction confidence, always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    /// Deterministic matches.
    pub const CERTAIN: Confidence = Confidence(1.0);

    /// Returns `None` for values outside `[0, 1]` or non-finite values.
    pub fn new(value: f64) -> Option<Self> {
        (value.is_finite() && (0.0..=1.0).contains(&value)).then_some(Self(value))
    }

    /// Clamp any value into range; NaN maps to zero.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = SchemaError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Confidence::new(value).ok_or(SchemaError::ConfidenceOutOfRange(value))
    }
}

impl From<Confidence> for f64 {
    fn from(confidence: Confidence) -> Self {
        confidence.0
    }
}

/// Where a fact came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub doc_id: Uuid,
    pub window_id: Uuid,

    /// Location in document coordinates
    pub span: Span,

    #[serde(default)]
    pub section: Option<String>,

    pub tier: Tier,
    pub extractor_version: String,

    /// Matcher or pattern name, e.g. `config:depends_on` or `inference`
    pub method: String,
}

/// A typed node candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub key: NodeKey,

    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,

    pub confidence: Confidence,
    pub provenance: Provenance,
}

impl ExtractedEntity {
    pub fn new(key: NodeKey, confidence: Confidence, provenance: Provenance) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
            confidence,
            provenance,
        }
    }

    /// Add a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// A subject–predicate–object fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub kind: RelKind,
    pub subject: NodeKey,
    pub object: NodeKey,

    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,

    pub confidence: Confidence,
    pub provenance: Provenance,

    /// When the relationship started holding, if the source says so.
    ///
    /// The writer stamps the first commit time when absent.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl ExtractedRelationship {
    /// Build a relationship, rejecting node kinds the relation does not connect.
    pub fn new(
        kind: RelKind,
        subject: NodeKey,
        object: NodeKey,
        confidence: Confidence,
        provenance: Provenance,
    ) -> Result<Self, SchemaError> {
        if !kind.allows(subject.kind, object.kind) {
            return Err(SchemaError::DisallowedRelation {
                relation: kind.rel_type().to_string(),
                subject: subject.kind.label().to_string(),
                object: object.kind.label().to_string(),
            });
        }
        Ok(Self {
            kind,
            subject,
            object,
            properties: BTreeMap::new(),
            confidence,
            provenance,
            since: None,
        })
    }

    /// Add a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Identity of a fact in the graph (natural key for nodes, type plus
/// endpoints for edges).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FactKey {
    Node(NodeKey),
    Edge {
        kind: RelKind,
        subject: NodeKey,
        object: NodeKey,
    },
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactKey::Node(key) => write!(f, "({})", key),
            FactKey::Edge {
                kind,
                subject,
                object,
            } => write!(f, "({})-[{}]->({})", subject, kind, object),
        }
    }
}

/// Either kind of extracted fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fact", rename_all = "snake_case")]
pub enum Fact {
    Entity(ExtractedEntity),
    Relationship(ExtractedRelationship),
}

impl Fact {
    pub fn key(&self) -> FactKey {
        match self {
            Fact::Entity(entity) => FactKey::Node(entity.key.clone()),
            Fact::Relationship(rel) => FactKey::Edge {
                kind: rel.kind,
                subject: rel.subject.clone(),
                object: rel.object.clone(),
            },
        }
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            Fact::Entity(entity) => entity.confidence,
            Fact::Relationship(rel) => rel.confidence,
        }
    }

    pub fn provenance(&self) -> &Provenance {
        match self {
            Fact::Entity(entity) => &entity.provenance,
            Fact::Relationship(rel) => &rel.provenance,
        }
    }

    pub fn tier(&self) -> Tier {
        self.provenance().tier
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self, Fact::Relationship(_))
    }
}

impl From<ExtractedEntity> for Fact {
    fn from(entity: ExtractedEntity) -> Self {
        Fact::Entity(entity)
    }
}

impl From<ExtractedRelationship> for Fact {
    fn from(rel: ExtractedRelationship) -> Self {
        Fact::Relationship(rel)
    }
}

/// All facts extracted from one document, deduplicated by [`FactKey`].
#[derive(Debug, Clone, Default)]
pub struct FactSet {
    pub doc_id: Uuid,
    pub extractor_version: String,

    /// Windows that failed and were handed to the dead letter queue
    pub failed_windows: usize,

    facts: IndexMap<FactKey, Fact>,
}

impl FactSet {
    pub fn new(doc_id: Uuid, extractor_version: impl Into<String>) -> Self {
        Self {
            doc_id,
            extractor_version: extractor_version.into(),
            failed_windows: 0,
            facts: IndexMap::new(),
        }
    }

    /// Rebuild a fact set from a flat list (e.g. a stored snapshot).
    pub fn from_facts(
        doc_id: Uuid,
        extractor_version: impl Into<String>,
        facts: impl IntoIterator<Item = Fact>,
    ) -> Self {
        let mut set = Self::new(doc_id, extractor_version);
        set.extend(facts);
        set
    }

    /// Insert a fact, keeping the stronger one on key collision.
    ///
    /// Higher confidence wins; on equal confidence the earlier tier is kept.
    /// Returns `true` when the set changed.
    pub fn insert(&mut self, fact: impl Into<Fact>) -> bool {
        let fact = fact.into();
        let key = fact.key();
        match self.facts.get(&key) {
            Some(existing)
                if existing.confidence() > fact.confidence()
                    || (existing.confidence() == fact.confidence() && existing.tier() <= fact.tier()) =>
            {
                false
            }
            _ => {
                self.facts.insert(key, fact);
                true
            }
        }
    }

    pub fn extend(&mut self, facts: impl IntoIterator<Item = Fact>) {
        for fact in facts {
            self.insert(fact);
        }
    }

    pub fn get(&self, key: &FactKey) -> Option<&Fact> {
        self.facts.get(key)
    }

    pub fn contains(&self, key: &FactKey) -> bool {
        self.facts.contains_key(key)
    }

    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.facts.values()
    }

    pub fn into_facts(self) -> Vec<Fact> {
        self.facts.into_values().collect()
    }

    pub fn entities(&self) -> impl Iterator<Item = &ExtractedEntity> {
        self.facts.values().filter_map(|fact| match fact {
            Fact::Entity(entity) => Some(entity),
            Fact::Relationship(_) => None,
        })
    }

    pub fn relationships(&self) -> impl Iterator<Item = &ExtractedRelationship> {
        self.facts.values().filter_map(|fact| match fact {
            Fact::Relationship(rel) => Some(rel),
            Fact::Entity(_) => None,
        })
    }

    pub fn count_by_tier(&self, tier: Tier) -> usize {
        self.facts.values().filter(|fact| fact.tier() == tier).count()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}
