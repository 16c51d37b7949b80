//! Processes shipped with the binary.
//!
//! The numeric work is deliberately small; these exist so the engine can be
//! exercised end to end without a database or external commands.

use serde_json::{Value, json};

use crate::catalog::{feature_collection, geometry_bounds, records_from_value};
use crate::error::{Result, TierError};
use crate::process::{
    InMemoryRegistry, ParameterSpec, ParameterType, Parameters, Process, ResourceClass, TierKind,
};
use crate::tier::InProcessTier;

pub const COUNT_FEATURES: &str = "count-features";
pub const COLLECTION_EXTENT: &str = "collection-extent";
pub const FILTER_FEATURES: &str = "filter-features";

/// Registry holding every built-in descriptor.
pub fn registry() -> Result<InMemoryRegistry> {
    let registry = InMemoryRegistry::new();
    for process in processes() {
        registry.register(process)?;
    }
    Ok(registry)
}

pub fn processes() -> Vec<Process> {
    vec![
        Process::new(COUNT_FEATURES, vec![TierKind::Database, TierKind::InProcess])
            .with_title("Count features")
            .with_class(ResourceClass::Light)
            .requiring_extension("postgis")
            .deterministic()
            .with_parameter(ParameterSpec::input("features", ParameterType::FeatureCollection))
            .with_parameter(ParameterSpec::output("count", ParameterType::Integer)),
        Process::new(COLLECTION_EXTENT, vec![TierKind::Database, TierKind::InProcess])
            .with_title("Bounding box of a collection")
            .requiring_extension("postgis")
            .deterministic()
            .with_parameter(ParameterSpec::input("features", ParameterType::FeatureCollection))
            .with_parameter(ParameterSpec::output("bbox", ParameterType::Any)),
        Process::new(
            FILTER_FEATURES,
            vec![TierKind::Subprocess, TierKind::InProcess],
        )
        .with_title("Filter features by property")
        .deterministic()
        .with_parameter(ParameterSpec::input("features", ParameterType::FeatureCollection))
        .with_parameter(ParameterSpec::input("property", ParameterType::String))
        .with_parameter(ParameterSpec::optional_input("equals", ParameterType::Any))
        .with_parameter(ParameterSpec::output("result", ParameterType::FeatureCollection)),
    ]
}

/// In-process implementations of the built-ins.
pub fn in_process_tier() -> InProcessTier {
    InProcessTier::new()
        .with_operation(COUNT_FEATURES, count_features)
        .with_operation(COLLECTION_EXTENT, collection_extent)
        .with_operation(FILTER_FEATURES, filter_features)
}

fn features(params: &Parameters) -> std::result::Result<Vec<Value>, TierError> {
    params
        .get("features")
        .map(records_from_value)
        .ok_or_else(|| TierError::Execution("missing input features".into()))
}

fn count_features(params: &Parameters) -> std::result::Result<Parameters, TierError> {
    let count = features(params)?.len();
    Ok(Parameters::from([("count".to_string(), json!(count))]))
}

fn collection_extent(params: &Parameters) -> std::result::Result<Parameters, TierError> {
    let bbox = features(params)?
        .iter()
        .filter_map(|f| f.get("geometry").and_then(geometry_bounds))
        .reduce(|[a0, a1, a2, a3], [b0, b1, b2, b3]| {
            [a0.min(b0), a1.min(b1), a2.max(b2), a3.max(b3)]
        });
    Ok(Parameters::from([(
        "bbox".to_string(),
        bbox.map_or(Value::Null, |b| json!(b)),
    )]))
}

/// Keeps features whose `properties.<property>` equals `equals`, or that have
/// the property at all when `equals` is absent.
fn filter_features(params: &Parameters) -> std::result::Result<Parameters, TierError> {
    let property = params
        .get("property")
        .and_then(Value::as_str)
        .ok_or_else(|| TierError::Execution("property must be a string".into()))?;
    let expected = params.get("equals");
    let kept = features(params)?
        .into_iter()
        .filter(|f| {
            let actual = f.get("properties").and_then(|p| p.get(property));
            match expected {
                Some(expected) => actual == Some(expected),
                None => actual.is_some_and(|v| !v.is_null()),
            }
        })
        .collect();
    Ok(Parameters::from([(
        "result".to_string(),
        feature_collection(kept),
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn sample() -> Value {
        json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"zone": "r1"}, "geometry": {"type": "Point", "coordinates": [2.0, 8.0]}},
                {"type": "Feature", "properties": {"zone": "c2"}, "geometry": {"type": "LineString", "coordinates": [[-1.0, 3.0], [4.0, 5.0]]}},
                {"type": "Feature", "properties": {"zone": null}, "geometry": null}
            ]
        })
    }

    #[test]
    fn registry_holds_every_builtin() {
        let registry = registry().unwrap();
        let ids: Vec<_> = registry.list().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec![COLLECTION_EXTENT, COUNT_FEATURES, FILTER_FEATURES]);
        let tier = in_process_tier();
        assert!(ids.iter().all(|id| tier.supports(id)));
    }

    #[test]
    fn counts_features() {
        let out = count_features(&params(&[("features", sample())])).unwrap();
        assert_eq!(out["count"], json!(3));
    }

    #[test]
    fn extent_covers_every_geometry() {
        let out = collection_extent(&params(&[("features", sample())])).unwrap();
        assert_eq!(out["bbox"], json!([-1.0, 3.0, 4.0, 8.0]));

        let empty = collection_extent(&params(&[("features", json!([]))])).unwrap();
        assert_eq!(empty["bbox"], Value::Null);
    }

    #[test]
    fn filters_by_property() {
        let out = filter_features(&params(&[
            ("features", sample()),
            ("property", json!("zone")),
            ("equals", json!("c2")),
        ]))
        .unwrap();
        assert_eq!(out["result"]["features"].as_array().unwrap().len(), 1);

        let present = filter_features(&params(&[
            ("features", sample()),
            ("property", json!("zone")),
        ]))
        .unwrap();
        assert_eq!(present["result"]["features"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_features_is_an_execution_error() {
        assert!(matches!(
            count_features(&Parameters::new()),
            Err(TierError::Execution(_))
        ));
    }
}
