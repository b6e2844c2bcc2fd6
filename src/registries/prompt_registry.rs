use std::fs;
use std::path::PathBuf;

use crate::errors::PopulateError;

pub const GENERATE_TESTS: &str = "generate_tests";
pub const REFINE_TEST: &str = "refine_test";

const DEFAULT_GENERATE_TESTS: &str = r#"You write test cases for a dynamic content section.

The section is a {{input.sectionKind}} snippet. Markup snippets interpolate
variables with double-brace tags and may contain #if/else blocks; script
snippets use let, if/else, while, output(...), print(...) and style.prop = ...
assignments.

Domain: population category "{{input.context.populationCategory}}", advisor
category "{{input.context.advisorCategory}}". Ground variable values in this
domain and in the related entities and facts given in the request.

Use the variable analysis: bind every listed variable, respect the inferred
categories, and include cases at or next to the listed boundary values.
Focus: {{input.context.focusHints?}}
Requested number of tests (choose 3 to 6 if empty): {{input.count?}}

Reply with JSON only: an array of objects with the fields
  name (string), description (string), variables (object),
  expected (string), matchType ("exact" | "contains" | "regex" | "styles"),
  expectedStyles (object of css property to value, only for "styles").
Prefer "exact" when the output is fully determined. Regex patterns are
searched, so anchor them with ^ and $ when the whole output must match."#;

const DEFAULT_REFINE_TEST: &str = r#"A test case for a {{input.sectionKind}} snippet is failing.
Propose a corrected version that keeps the test's intent.

Domain: population category "{{input.context.populationCategory}}", advisor
category "{{input.context.advisorCategory}}".

The request contains the original test case, the actual output, the captured
styles and any error. Decide whether the expected value or the variable
bindings are wrong and fix that. Keep the name and description. Only change
matchType if the original one can never pass, for example a regex that does
not compile.

Reply with JSON only: a single object with the fields
  variables (object), expected (string), matchType, expectedStyles (optional)."#;

/// Source of system prompt templates by name
pub trait PromptRegistry: Send + Sync {
    fn get_prompt(&self, name: &str) -> Result<String, PopulateError>;
}

/// File-based implementation of PromptRegistry.
/// Loads `system_prompt` from `{prompts_dir}/{name}.yml`, falling back to
/// the built-in prompts when no file exists.
#[derive(Clone, Debug)]
pub struct FilePromptRegistry {
    prompts_dir: Option<PathBuf>,
}

impl FilePromptRegistry {
    /// # Arguments
    /// * `prompts_dir` - Optional directory with prompt overrides (defaults to "prompts")
    pub fn new(prompts_dir: Option<PathBuf>) -> Self {
        Self {
            prompts_dir: Some(prompts_dir.unwrap_or_else(|| PathBuf::from("prompts"))),
        }
    }

    /// Built-in prompts only, ignoring the filesystem
    pub fn builtin() -> Self {
        Self { prompts_dir: None }
    }
}

impl PromptRegistry for FilePromptRegistry {
    fn get_prompt(&self, name: &str) -> Result<String, PopulateError> {
        if let Some(dir) = &self.prompts_dir {
            let path = dir.join(format!("{}.yml", name));
            if path.exists() {
                let content = fs::read_to_string(&path).map_err(|e| {
                    PopulateError::InvalidTemplate(format!(
                        "Failed to read prompt {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                return extract_system_prompt(&content);
            }
        }

        match name {
            GENERATE_TESTS => Ok(DEFAULT_GENERATE_TESTS.to_string()),
            REFINE_TEST => Ok(DEFAULT_REFINE_TEST.to_string()),
            other => Err(PopulateError::PromptNotFound(other.to_string())),
        }
    }
}

/// Extracts the system_prompt field from a YAML prompt file
fn extract_system_prompt(yaml_content: &str) -> Result<String, PopulateError> {
    use yaml_rust::YamlLoader;

    let docs = YamlLoader::load_from_str(yaml_content)
        .map_err(|e| PopulateError::InvalidTemplate(format!("Invalid YAML: {}", e)))?;

    let doc = docs
        .first()
        .ok_or_else(|| PopulateError::InvalidTemplate("Empty YAML document".to_string()))?;

    doc["system_prompt"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PopulateError::InvalidTemplate("No system_prompt field found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_system_prompt() {
        let yaml = r#"
name: generate_tests
system_prompt: |
  Write tests for {{input.sectionContent}}.
  Reply with JSON.
"#;
        let prompt = extract_system_prompt(yaml).unwrap();
        assert!(prompt.contains("{{input.sectionContent}}"));
    }

    #[test]
    fn test_extract_system_prompt_missing() {
        assert!(extract_system_prompt("name: x\n").is_err());
    }

    #[test]
    fn test_builtin_prompts() {
        let registry = FilePromptRegistry::builtin();
        assert!(registry.get_prompt(GENERATE_TESTS).unwrap().contains("matchType"));
        assert!(registry.get_prompt(REFINE_TEST).is_ok());
        assert_eq!(
            registry.get_prompt("summarize"),
            Err(PopulateError::PromptNotFound("summarize".to_string()))
        );
    }

    #[test]
    fn test_builtin_prompts_populate_from_requests() {
        use crate::contexts::prompt_template::populate;
        use crate::contexts::{enhance, section_metadata};
        use crate::data::{AITestRequest, DomainContext, RequestMode, Section, SectionKind};

        let section = Section::new("s1", SectionKind::Markup, "Hello, {{name}}");
        let mut request = AITestRequest {
            section_id: "s1".to_string(),
            section_kind: SectionKind::Markup,
            section_content: section.content.clone(),
            analysis: Default::default(),
            context: enhance(&DomainContext::default(), &section_metadata(&section)),
            count: None,
            mode: RequestMode::Generate,
        };
        let registry = FilePromptRegistry::builtin();
        let prompt = populate(&registry.get_prompt(GENERATE_TESTS).unwrap(), &request).unwrap();
        assert!(prompt.contains("population category \"general\""));
        assert!(prompt.contains("a markup snippet"));

        request.mode = RequestMode::Refine {
            original: crate::data::TestCase::new(
                "t",
                serde_json::Map::new(),
                "x",
                crate::data::MatchType::Exact,
            ),
            actual: Some("y".to_string()),
            actual_styles: None,
            error: None,
        };
        assert!(populate(&registry.get_prompt(REFINE_TEST).unwrap(), &request).is_ok());
    }

    #[test]
    fn test_file_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("refine_test.yml"),
            "system_prompt: Fix {{input.sectionId}}\n",
        )
        .unwrap();
        let registry = FilePromptRegistry::new(Some(dir.path().to_path_buf()));
        assert_eq!(registry.get_prompt(REFINE_TEST).unwrap(), "Fix {{input.sectionId}}");
        assert!(registry.get_prompt(GENERATE_TESTS).unwrap().contains("JSON only"));
    }
}
