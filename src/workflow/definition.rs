use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{CatalogReference, OutputSpec};
use crate::error::{EngineError, Result};

/// A DAG of process invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Assigned at submission when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub process: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, StepInput>,
    /// Explicit ordering. Dependencies implied by `from` inputs are added
    /// whether or not they are listed here.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A failed optional step does not fail the run.
    #[serde(default)]
    pub optional: bool,
    /// Publish one output of this step to the catalog.
    #[serde(default)]
    pub output: Option<OutputSpec>,
}

/// Where a step input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepInput {
    Literal(Value),
    Catalog(CatalogReference),
    /// Output of another step, substituted once that step has succeeded.
    From(StepOutputRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepOutputRef {
    pub step: String,
    pub output: String,
}

impl WorkflowStep {
    pub fn new(id: &str, process: &str) -> Self {
        Self {
            id: id.to_string(),
            process: process.to_string(),
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
            optional: false,
            output: None,
        }
    }

    pub fn literal(mut self, name: &str, value: Value) -> Self {
        self.inputs
            .insert(name.to_string(), StepInput::Literal(value));
        self
    }

    pub fn catalog(mut self, name: &str, reference: CatalogReference) -> Self {
        self.inputs
            .insert(name.to_string(), StepInput::Catalog(reference));
        self
    }

    pub fn from_step(mut self, name: &str, step: &str, output: &str) -> Self {
        self.inputs.insert(
            name.to_string(),
            StepInput::From(StepOutputRef {
                step: step.to_string(),
                output: output.to_string(),
            }),
        );
        self
    }

    pub fn after(mut self, step: &str) -> Self {
        self.depends_on.push(step.to_string());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Every step this one must wait for: `depends_on` plus `from` targets,
    /// deduplicated, in first-seen order.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        let implied = self.inputs.values().filter_map(|input| match input {
            StepInput::From(r) => Some(r.step.as_str()),
            _ => None,
        });
        for dep in self.depends_on.iter().map(String::as_str).chain(implied) {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        deps
    }
}

impl WorkflowDefinition {
    pub fn new(steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: None,
            title: None,
            steps,
        }
    }

    /// Loads a definition from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            Some("toml") => Ok(toml::from_str(&contents)?),
            _ => Err(EngineError::Validation(format!(
                "unsupported workflow file {} (expected .json or .toml)",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn dependencies_merge_explicit_and_implied() {
        let step = WorkflowStep::new("clip", "clip")
            .after("load")
            .from_step("features", "buffer", "result")
            .from_step("mask", "load", "result");
        assert_eq!(step.dependencies(), vec!["load", "buffer"]);
    }

    #[test]
    fn load_toml_definition() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
title = "buffer then count"

[[steps]]
id = "buffer"
process = "buffer"
inputs.features = {{ catalog = {{ collection = {{ id = "parcels" }} }} }}
inputs.distance = {{ literal = 25.0 }}

[[steps]]
id = "count"
process = "count-features"
optional = true
inputs.features = {{ from = {{ step = "buffer", output = "result" }} }}
"#
        )
        .unwrap();

        let def = WorkflowDefinition::load(file.path()).unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(
            def.steps[0].inputs["distance"],
            StepInput::Literal(json!(25.0))
        );
        assert_eq!(
            def.steps[0].inputs["features"],
            StepInput::Catalog(CatalogReference::collection("parcels"))
        );
        assert!(def.steps[1].optional);
        assert_eq!(def.steps[1].dependencies(), vec!["buffer"]);
    }

    #[test]
    fn load_json_definition() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"steps": [{{"id": "a", "process": "noop", "depends_on": []}}]}}"#
        )
        .unwrap();
        let def = WorkflowDefinition::load(file.path()).unwrap();
        assert_eq!(def.steps[0].id, "a");
        assert!(def.id.is_none());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            WorkflowDefinition::load(file.path()),
            Err(EngineError::Validation(_))
        ));
    }
}
