use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record selection applied by the store when it can, by the binding otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// `[min_x, min_y, max_x, max_y]`; keeps records whose geometry bounds intersect it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    /// Keeps records whose `properties.<key>` equals the value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn is_empty(&self) -> bool {
        self.bbox.is_none() && self.properties.is_empty() && self.limit.is_none()
    }

    pub fn with_bbox(mut self, bbox: [f64; 4]) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Predicate part of the filter; `limit` is applied by the caller.
    pub fn matches(&self, record: &Value) -> bool {
        for (key, expected) in &self.properties {
            let actual = record.get("properties").and_then(|p| p.get(key));
            if actual != Some(expected) {
                return false;
            }
        }
        if let Some([min_x, min_y, max_x, max_y]) = self.bbox {
            let Some([x0, y0, x1, y1]) = record.get("geometry").and_then(geometry_bounds) else {
                return false;
            };
            if x1 < min_x || x0 > max_x || y1 < min_y || y0 > max_y {
                return false;
            }
        }
        true
    }
}

/// Bounding box of a GeoJSON geometry, walking nested coordinate arrays.
pub fn geometry_bounds(geometry: &Value) -> Option<[f64; 4]> {
    let mut bounds: Option<[f64; 4]> = None;
    if let Some(children) = geometry.get("geometries").and_then(Value::as_array) {
        for child in children {
            if let Some(b) = geometry_bounds(child) {
                extend(&mut bounds, b[0], b[1]);
                extend(&mut bounds, b[2], b[3]);
            }
        }
        return bounds;
    }
    walk_coordinates(geometry.get("coordinates")?, &mut bounds);
    bounds
}

fn walk_coordinates(value: &Value, bounds: &mut Option<[f64; 4]>) {
    let Some(items) = value.as_array() else {
        return;
    };
    match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        (Some(x), Some(y)) => extend(bounds, x, y),
        _ => items.iter().for_each(|item| walk_coordinates(item, bounds)),
    }
}

fn extend(bounds: &mut Option<[f64; 4]>, x: f64, y: f64) {
    match bounds {
        Some(b) => {
            b[0] = b[0].min(x);
            b[1] = b[1].min(y);
            b[2] = b[2].max(x);
            b[3] = b[3].max(y);
        }
        None => *bounds = Some([x, y, x, y]),
    }
}
