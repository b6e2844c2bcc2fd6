use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::SectionKind;

/// A related domain entity the author wants tests grounded in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub summary: String,
}

/// Static domain facts supplied by the surrounding product
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainContext {
    #[serde(default)]
    pub population_category: Option<String>,
    #[serde(default)]
    pub advisor_category: Option<String>,
    #[serde(default)]
    pub related_entities: Vec<EntitySummary>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
}

/// What the generation pipeline knows about the section being worked on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionMetadata {
    pub section_id: String,
    pub section_name: String,
    pub kind: SectionKind,
    pub position: u32,
    pub content: String,
    pub content_hash: String,
    pub existing_tests: usize,
    pub has_style_effects: bool,
}

/// Domain context merged with section metadata; consumed by generation and refinement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedContext {
    pub population_category: String,
    pub advisor_category: String,
    pub related_entities: Vec<EntitySummary>,
    pub facts: BTreeMap<String, String>,
    pub section: SectionMetadata,
    pub focus_hints: Vec<String>,
}
