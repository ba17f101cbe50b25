//! Fixed output schema for Tier C and validation of model replies.
//!
//! Every inference reply must deserialize into [`InferenceOutput`] and then
//! pass [`validate`], which checks the reply against the node/relationship
//! vocabulary and against the window it claims to describe. A reply that
//! fails either step is never turned into facts.
//!
//! Validated output is stored as a [`NormalizedExtraction`]: natural keys and
//! confidences only, no provenance. Provenance is attached per window when the
//! result is used, so one cached result can serve identical text in any
//! document.

use std::collections::{BTreeMap, HashMap};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SchemaError;
use crate::types::document::{Span, Window};
use crate::types::fact::{
    Confidence, ExtractedEntity, ExtractedRelationship, Fact, NodeKey, NodeKind, Provenance,
    RelKind, Tier,
};

/// Property the model uses to report its own confidence.
const CONFIDENCE_PROPERTY: &str = "confidence";

/// Method recorded in Tier C provenance.
pub const INFERENCE_METHOD: &str = "inference";

/// Top-level reply the model must produce for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InferenceOutput {
    pub entities: Vec<EntityOutput>,
    #[serde(default)]
    pub relations: Vec<RelationOutput>,
    pub provenance: ProvenanceOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntityOutput {
    /// Node type, e.g. `Service` or `Host`
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RelationOutput {
    /// Relationship type, e.g. `DEPENDS_ON`
    #[serde(rename = "type")]
    pub relation_type: String,
    /// Name of a declared entity
    pub src: String,
    /// Name of a declared entity
    pub dst: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProvenanceOutput {
    pub doc_id: String,
    #[serde(default)]
    pub section: Option<String>,
    /// `[start, end]` byte offsets in the source document
    pub span: [usize; 2],
}

/// JSON schema sent with every inference request.
pub fn output_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(InferenceOutput)).unwrap_or(Value::Null)
}

/// Parse raw model text, tolerating a surrounding markdown code fence.
pub fn parse_reply(raw: &str) -> Result<InferenceOutput, SchemaError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(body.trim())?)
}

/// A validated entity without provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntity {
    pub key: NodeKey,
    pub confidence: Confidence,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// A validated relationship without provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRelation {
    pub kind: RelKind,
    pub subject: NodeKey,
    pub object: NodeKey,
    pub confidence: Confidence,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Validated, provenance-free Tier C result. This is what the cache holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedExtraction {
    pub entities: Vec<NormalizedEntity>,
    pub relations: Vec<NormalizedRelation>,
}

impl NormalizedExtraction {
    pub fn len(&self) -> usize {
        self.entities.len() + self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }

    /// Materialize facts for `window`, attaching Tier C provenance.
    pub fn to_facts(&self, window: &Window, extractor_version: &str) -> Vec<Fact> {
        let provenance = Provenance {
            doc_id: window.doc_id,
            window_id: window.window_id,
            span: window.span,
            section: window.section.clone(),
            tier: Tier::C,
            extractor_version: extractor_version.to_string(),
            method: INFERENCE_METHOD.to_string(),
        };

        let entities = self.entities.iter().map(|e| {
            let mut entity = ExtractedEntity::new(e.key.clone(), e.confidence, provenance.clone());
            entity.properties = e.properties.clone();
            Fact::from(entity)
        });

        // Kinds were checked in `validate`; a cached value that no longer
        // satisfies the vocabulary is dropped rather than written.
        let relations = self.relations.iter().filter_map(|r| {
            ExtractedRelationship::new(
                r.kind,
                r.subject.clone(),
                r.object.clone(),
                r.confidence,
                provenance.clone(),
            )
            .ok()
            .map(|mut rel| {
                rel.properties = r.properties.clone();
                Fact::from(rel)
            })
        });

        entities.chain(relations).collect()
    }
}

/// Check a parsed reply against the vocabulary and the submitted window.
pub fn validate(
    output: InferenceOutput,
    window: &Window,
    default_confidence: f64,
) -> Result<NormalizedExtraction, SchemaError> {
    check_provenance(&output.provenance, window)?;

    let mut declared: HashMap<String, NodeKey> = HashMap::new();
    let mut entities = Vec::with_capacity(output.entities.len());

    for entity in output.entities {
        let kind: NodeKind = entity.entity_type.parse()?;
        if entity.name.trim().is_empty() {
            return Err(SchemaError::EmptyName(kind.label().to_string()));
        }
        let key = NodeKey::parse(kind, &entity.name)?;
        let (confidence, properties) = split_confidence(entity.properties, default_confidence)?;

        declared.insert(lookup_name(&entity.name), key.clone());
        declared.entry(lookup_name(&key.value)).or_insert_with(|| key.clone());
        entities.push(NormalizedEntity {
            key,
            confidence,
            properties,
        });
    }

    let mut relations = Vec::with_capacity(output.relations.len());
    for relation in output.relations {
        let kind: RelKind = relation.relation_type.parse()?;
        let resolve = |name: &str| {
            if name.trim().is_empty() {
                return Err(SchemaError::EmptyName(kind.rel_type().to_string()));
            }
            declared
                .get(&lookup_name(name))
                .cloned()
                .ok_or_else(|| SchemaError::DanglingEndpoint(name.to_string()))
        };
        let subject = resolve(&relation.src)?;
        let object = resolve(&relation.dst)?;
        if !kind.allows(subject.kind, object.kind) {
            return Err(SchemaError::DisallowedRelation {
                relation: kind.rel_type().to_string(),
                subject: subject.kind.label().to_string(),
                object: object.kind.label().to_string(),
            });
        }
        let (confidence, properties) = split_confidence(relation.properties, default_confidence)?;
        relations.push(NormalizedRelation {
            kind,
            subject,
            object,
            confidence,
            properties,
        });
    }

    Ok(NormalizedExtraction {
        entities,
        relations,
    })
}

fn lookup_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn check_provenance(provenance: &ProvenanceOutput, window: &Window) -> Result<(), SchemaError> {
    let doc_id: Uuid = provenance
        .doc_id
        .trim()
        .parse()
        .map_err(|_| SchemaError::ProvenanceMismatch(format!("doc_id {:?} is not a uuid", provenance.doc_id)))?;
    if doc_id != window.doc_id {
        return Err(SchemaError::ProvenanceMismatch(format!(
            "doc_id {} does not match window document {}",
            doc_id, window.doc_id
        )));
    }

    let [start, end] = provenance.span;
    if start > end || !window.span.contains(&Span::new(start, end)) {
        return Err(SchemaError::ProvenanceMismatch(format!(
            "span [{}, {}] outside window [{}, {}]",
            start, end, window.span.start, window.span.end
        )));
    }
    Ok(())
}

fn split_confidence(
    mut properties: BTreeMap<String, Value>,
    default_confidence: f64,
) -> Result<(Confidence, BTreeMap<String, Value>), SchemaError> {
    let confidence = match properties.remove(CONFIDENCE_PROPERTY) {
        None | Some(Value::Null) => Confidence::clamped(default_confidence),
        Some(value) => Confidence::try_from(value.as_f64().unwrap_or(f64::NAN))?,
    };
    Ok((confidence, properties))
}
