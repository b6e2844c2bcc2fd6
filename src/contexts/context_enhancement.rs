use std::collections::HashSet;

use crate::data::{DomainContext, EnrichedContext, EntitySummary, Section, SectionKind, SectionMetadata};

use super::content_index::hash_content;
use super::variable_analyzer::has_style_effects;

const DEFAULT_CATEGORY: &str = "general";

/// Collects what the pipeline needs to know about one section
pub fn section_metadata(section: &Section) -> SectionMetadata {
    SectionMetadata {
        section_id: section.id.clone(),
        section_name: section.display_name().to_string(),
        kind: section.kind,
        position: section.position,
        content: section.content.clone(),
        content_hash: hash_content(&section.content),
        existing_tests: section.tests.len(),
        has_style_effects: has_style_effects(section.kind, &section.content),
    }
}

/// Merges static domain facts with per-section metadata.
///
/// Pure: the same inputs always give the same context. Missing categories
/// default to "general"; related entities are de-duplicated by name, and
/// the ones the section mentions are listed first.
pub fn enhance(base: &DomainContext, section: &SectionMetadata) -> EnrichedContext {
    let content = section.content.to_lowercase();
    let mut seen = HashSet::new();
    let unique: Vec<&EntitySummary> = base
        .related_entities
        .iter()
        .filter(|e| !e.name.trim().is_empty() && seen.insert(e.name.trim().to_lowercase()))
        .collect();
    let (mentioned, others): (Vec<&EntitySummary>, Vec<&EntitySummary>) = unique
        .into_iter()
        .partition(|e| content.contains(&e.name.trim().to_lowercase()));

    EnrichedContext {
        population_category: category_or_default(base.population_category.as_deref()),
        advisor_category: category_or_default(base.advisor_category.as_deref()),
        related_entities: mentioned.into_iter().chain(others).cloned().collect(),
        facts: base.facts.clone(),
        section: section.clone(),
        focus_hints: focus_hints(section),
    }
}

fn category_or_default(category: Option<&str>) -> String {
    match category.map(str::trim) {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => DEFAULT_CATEGORY.to_string(),
    }
}

fn focus_hints(section: &SectionMetadata) -> Vec<String> {
    let mut hints = Vec::new();
    if section.kind == SectionKind::Script {
        hints.push("exercise every branch of the script".to_string());
    }
    if section.content.contains("{{#if") {
        hints.push("cover both sides of each conditional block".to_string());
    }
    if section.has_style_effects {
        hints.push("verify style effects with matchType \"styles\"".to_string());
    }
    if section.existing_tests > 0 {
        hints.push(format!(
            "complement the {} existing test(s) instead of repeating them",
            section.existing_tests
        ));
    }
    hints
}
