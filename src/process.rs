//! Process descriptors and the registry they are looked up from.
//!
//! A [`Process`] is immutable once registered and shared as `Arc<Process>`
//! between the engine, the coordinator and every job that runs it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Named parameter values passed to and returned from a tier.
pub type Parameters = BTreeMap<String, Value>;

/// The execution substrates a process may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    InProcess,
    Database,
    Subprocess,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::InProcess => write!(f, "in-process"),
            TierKind::Database => write!(f, "database"),
            TierKind::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// Workload classification used to size admission capacity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Light,
    #[default]
    Standard,
    Heavy,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Light => write!(f, "light"),
            ResourceClass::Standard => write!(f, "standard"),
            ResourceClass::Heavy => write!(f, "heavy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Geometry,
    FeatureCollection,
    Any,
}

impl ParameterType {
    /// Shallow structural check of a literal against the declared type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Number => value.is_number(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Geometry => value
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| {
                    (t == "GeometryCollection" && value.get("geometries").is_some())
                        || value.get("coordinates").is_some()
                }),
            ParameterType::FeatureCollection => {
                value.is_array()
                    || value.get("type").and_then(Value::as_str) == Some("FeatureCollection")
            }
            ParameterType::Any => true,
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Integer => "integer",
            ParameterType::Boolean => "boolean",
            ParameterType::Geometry => "geometry",
            ParameterType::FeatureCollection => "feature_collection",
            ParameterType::Any => "any",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParameterType,
    pub direction: Direction,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ParameterSpec {
    pub fn input(name: &str, ty: ParameterType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            direction: Direction::Input,
            required: true,
        }
    }

    pub fn optional_input(name: &str, ty: ParameterType) -> Self {
        Self {
            required: false,
            ..Self::input(name, ty)
        }
    }

    pub fn output(name: &str, ty: ParameterType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            direction: Direction::Output,
            required: true,
        }
    }
}

/// Immutable descriptor of a registered operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub tier_preferences: Vec<TierKind>,
    #[serde(default)]
    pub resource_class: ResourceClass,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Identical inputs always produce identical outputs.
    #[serde(default)]
    pub deterministic: bool,
    /// Database extensions the database tier must have installed.
    #[serde(default)]
    pub required_extensions: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Process {
    pub fn new(id: &str, tier_preferences: Vec<TierKind>) -> Self {
        Self {
            id: id.to_string(),
            title: id.to_string(),
            version: default_version(),
            tier_preferences,
            resource_class: ResourceClass::default(),
            parameters: Vec::new(),
            deterministic: false,
            required_extensions: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_class(mut self, class: ResourceClass) -> Self {
        self.resource_class = class;
        self
    }

    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }

    pub fn requiring_extension(mut self, extension: &str) -> Self {
        self.required_extensions.push(extension.to_string());
        self
    }

    pub fn inputs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters
            .iter()
            .filter(|p| p.direction == Direction::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters
            .iter()
            .filter(|p| p.direction == Direction::Output)
    }

    pub fn input(&self, name: &str) -> Option<&ParameterSpec> {
        self.inputs().find(|p| p.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs().any(|p| p.name == name)
    }

    /// Checks a descriptor before it is admitted to a registry.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::Validation("process id must not be empty".into()));
        }
        if self.tier_preferences.is_empty() {
            return Err(EngineError::Validation(format!(
                "process {} declares no tier preferences",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for p in &self.parameters {
            if !seen.insert((p.name.as_str(), p.direction == Direction::Input)) {
                return Err(EngineError::Validation(format!(
                    "process {} declares parameter {} twice",
                    self.id, p.name
                )));
            }
        }
        Ok(())
    }
}

/// Source of process descriptors. Discovery and loading live elsewhere.
pub trait ProcessRegistry: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<Process>>;
    fn list(&self) -> Vec<Arc<Process>>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    processes: RwLock<BTreeMap<String, Arc<Process>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor. Re-registering an id is rejected so that
    /// descriptors stay read-only once jobs may reference them.
    pub fn register(&self, process: Process) -> Result<Arc<Process>> {
        process.validate()?;
        let mut processes = self.processes.write();
        if processes.contains_key(&process.id) {
            return Err(EngineError::Validation(format!(
                "process {} is already registered",
                process.id
            )));
        }
        let process = Arc::new(process);
        processes.insert(process.id.clone(), Arc::clone(&process));
        Ok(process)
    }
}

impl ProcessRegistry for InMemoryRegistry {
    fn get(&self, id: &str) -> Option<Arc<Process>> {
        self.processes.read().get(id).cloned()
    }

    fn list(&self) -> Vec<Arc<Process>> {
        self.processes.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buffer() -> Process {
        Process::new("buffer", vec![TierKind::Database, TierKind::InProcess])
            .with_parameter(ParameterSpec::input("features", ParameterType::FeatureCollection))
            .with_parameter(ParameterSpec::input("distance", ParameterType::Number))
            .with_parameter(ParameterSpec::output("result", ParameterType::FeatureCollection))
    }

    #[test]
    fn parameter_type_checks() {
        assert!(ParameterType::Number.accepts(&json!(2.5)));
        assert!(!ParameterType::Integer.accepts(&json!(2.5)));
        assert!(ParameterType::Integer.accepts(&json!(7)));
        assert!(ParameterType::Geometry.accepts(&json!({"type": "Point", "coordinates": [1, 2]})));
        assert!(!ParameterType::Geometry.accepts(&json!({"type": "Point"})));
        assert!(ParameterType::FeatureCollection.accepts(&json!({"type": "FeatureCollection", "features": []})));
        assert!(ParameterType::FeatureCollection.accepts(&json!([])));
        assert!(!ParameterType::FeatureCollection.accepts(&json!("roads")));
    }

    #[test]
    fn inputs_and_outputs_are_split_by_direction() {
        let p = buffer();
        assert_eq!(p.inputs().count(), 2);
        assert!(p.has_output("result"));
        assert!(!p.has_output("distance"));
        assert!(p.input("distance").is_some());
    }

    #[test]
    fn registry_rejects_duplicates() {
        let registry = InMemoryRegistry::new();
        registry.register(buffer()).unwrap();
        assert!(registry.register(buffer()).is_err());
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get("buffer").unwrap().tier_preferences.len(), 2);
    }

    #[test]
    fn validate_requires_tier_preferences() {
        let p = Process::new("clip", vec![]);
        assert!(matches!(p.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn tier_kind_serde_and_display() {
        let json = serde_json::to_string(&TierKind::InProcess).unwrap();
        assert_eq!(json, r#""in_process""#);
        assert_eq!(TierKind::Subprocess.to_string(), "subprocess");
    }
}
