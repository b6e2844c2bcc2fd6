use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Best-effort type of a variable, inferred from how the content uses it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableCategory {
    Numeric,
    String,
    Boolean,
    Object,
    List,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableInfo {
    pub name: String,
    pub category: VariableCategory,
    /// Source lines where the variable is used, for prompting
    #[serde(default)]
    pub usages: Vec<String>,
    /// Literals the variable is compared against; good edge-case inputs
    #[serde(default)]
    pub boundary_values: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub variables: Vec<VariableInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl AnalysisResult {
    pub fn variable(&self, name: &str) -> Option<&VariableInfo> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }
}
