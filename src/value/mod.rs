mod field_path;
mod object_value;

pub use field_path::FieldPath;
pub use object_value::ObjectValue;

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::model::Timestamp;

/// A single document field value.
///
/// Closed union; pattern matching over it is exhaustive by construction.
/// `ServerTimestamp` is the latency-compensation placeholder a transform
/// mutation writes into the local view while the server's value is still
/// unknown; it carries the local write time and is never written to the
/// remote document cache.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(Timestamp),
    ServerTimestamp(Timestamp),
    Array(Vec<FieldValue>),
    Map(ObjectValue),
}

impl FieldValue {
    /// Builds a field value from a JSON literal. Convenient for callers (and
    /// tests) that assemble document data with `serde_json::json!`.
    pub fn from_json(value: &JsonValue) -> FieldValue {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Boolean(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Integer(i)
                } else {
                    FieldValue::Double(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => FieldValue::String(s.clone()),
            JsonValue::Array(values) => {
                FieldValue::Array(values.iter().map(FieldValue::from_json).collect())
            }
            JsonValue::Object(map) => {
                let fields = map
                    .iter()
                    .map(|(name, value)| (name.clone(), FieldValue::from_json(value)))
                    .collect::<BTreeMap<_, _>>();
                FieldValue::Map(ObjectValue::new(fields))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_json_literals() {
        let value = FieldValue::from_json(&json!({"name": "a", "count": 2, "tags": ["x"]}));
        let FieldValue::Map(object) = value else {
            panic!("expected map");
        };
        assert_eq!(
            object.field(&FieldPath::from_dot_separated("name").unwrap()),
            Some(&FieldValue::String("a".to_string()))
        );
        assert_eq!(
            object.field(&FieldPath::from_dot_separated("count").unwrap()),
            Some(&FieldValue::Integer(2))
        );
    }
}
