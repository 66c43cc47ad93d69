use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::value::{FieldPath, FieldValue};

/// An immutable map of field names to values: the data payload of a document.
///
/// `set`/`delete` return modified copies so documents stay value types.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ObjectValue {
    fields: BTreeMap<String, FieldValue>,
}

impl ObjectValue {
    pub fn new(fields: BTreeMap<String, FieldValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match FieldValue::from_json(value) {
            FieldValue::Map(object) => object,
            _ => Self::empty(),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        let mut current = self.fields.get(&path.segments()[0])?;
        for segment in &path.segments()[1..] {
            match current {
                FieldValue::Map(object) => current = object.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn set(&self, path: &FieldPath, value: FieldValue) -> ObjectValue {
        let mut fields = self.fields.clone();
        set_at_segments(&mut fields, path.segments(), value);
        ObjectValue::new(fields)
    }

    pub fn delete(&self, path: &FieldPath) -> ObjectValue {
        let mut fields = self.fields.clone();
        delete_at_segments(&mut fields, path.segments());
        ObjectValue::new(fields)
    }
}

fn set_at_segments(fields: &mut BTreeMap<String, FieldValue>, segments: &[String], value: FieldValue) {
    if segments.len() == 1 {
        fields.insert(segments[0].clone(), value);
        return;
    }

    let child = fields
        .entry(segments[0].clone())
        .or_insert_with(|| FieldValue::Map(ObjectValue::empty()));
    let mut child_fields = match child {
        FieldValue::Map(object) => object.fields.clone(),
        // Setting through a non-map value replaces it.
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child_fields, &segments[1..], value);
    *child = FieldValue::Map(ObjectValue::new(child_fields));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FieldValue>, segments: &[String]) {
    if segments.is_empty() {
        return;
    }
    if segments.len() == 1 {
        fields.remove(&segments[0]);
        return;
    }

    if let Some(FieldValue::Map(object)) = fields.get(&segments[0]).cloned() {
        let mut child_fields = object.fields().clone();
        delete_at_segments(&mut child_fields, &segments[1..]);
        fields.insert(segments[0].clone(), FieldValue::Map(ObjectValue::new(child_fields)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(dotted: &str) -> FieldPath {
        FieldPath::from_dot_separated(dotted).unwrap()
    }

    #[test]
    fn sets_nested_field() {
        let base = ObjectValue::from_json(&json!({"a": {"b": 1}}));
        let updated = base.set(&path("a.c"), FieldValue::Integer(2));
        assert_eq!(updated.field(&path("a.b")), Some(&FieldValue::Integer(1)));
        assert_eq!(updated.field(&path("a.c")), Some(&FieldValue::Integer(2)));
        // Original is untouched.
        assert_eq!(base.field(&path("a.c")), None);
    }

    #[test]
    fn deletes_nested_field() {
        let base = ObjectValue::from_json(&json!({"a": {"b": 1, "c": 2}}));
        let updated = base.delete(&path("a.b"));
        assert_eq!(updated.field(&path("a.b")), None);
        assert_eq!(updated.field(&path("a.c")), Some(&FieldValue::Integer(2)));
    }

    #[test]
    fn set_through_scalar_replaces_it() {
        let base = ObjectValue::from_json(&json!({"a": 1}));
        let updated = base.set(&path("a.b"), FieldValue::Integer(2));
        assert_eq!(updated.field(&path("a.b")), Some(&FieldValue::Integer(2)));
    }
}
