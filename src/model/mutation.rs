use crate::error::{internal_error, SyncResult};
use crate::model::{Document, DocumentKey, MaybeDocument, NoDocument, SnapshotVersion, Timestamp};
use crate::value::{FieldPath, FieldValue, ObjectValue};

/// Guard a mutation places on the document state it applies to.
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(should_exist) => {
                let exists = matches!(maybe_doc, Some(MaybeDocument::Document(_)));
                exists == *should_exist
            }
            Precondition::UpdateTime(version) => maybe_doc
                .and_then(MaybeDocument::as_document)
                .map(|doc| doc.version == *version)
                .unwrap_or(false),
        }
    }
}

/// A transform applied to a single field as part of a Transform mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FieldValue>),
    ArrayRemove(Vec<FieldValue>),
    NumericIncrement(FieldValue),
}

/// The server's response to a single mutation.
///
/// `version` is `None` for deletes (the enclosing batch result fills in the
/// commit version); `transform_results` accompanies Transform mutations.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: Option<SnapshotVersion>,
    pub transform_results: Option<Vec<FieldValue>>,
}

impl MutationResult {
    pub fn new(version: Option<SnapshotVersion>) -> Self {
        Self {
            version,
            transform_results: None,
        }
    }

    pub fn with_transform_results(
        version: Option<SnapshotVersion>,
        transform_results: Vec<FieldValue>,
    ) -> Self {
        Self {
            version,
            transform_results: Some(transform_results),
        }
    }
}

/// A pending write against a single document.
///
/// Applying a mutation whose precondition does not hold is a no-op against
/// that document, not an error. Transform mutations applied locally produce
/// placeholder values (a provisional server timestamp) that never reach the
/// remote document cache.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
    },
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        field_mask: Vec<FieldPath>,
        precondition: Precondition,
    },
    Transform {
        key: DocumentKey,
        transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
        }
    }

    pub fn patch(key: DocumentKey, data: ObjectValue, field_mask: Vec<FieldPath>) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
        }
    }

    pub fn transform(key: DocumentKey, transforms: Vec<FieldTransform>) -> Self {
        Mutation::Transform { key, transforms }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Delete { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. } => precondition.clone(),
            // Transforms can only amend an existing document.
            Mutation::Transform { .. } => Precondition::Exists(true),
        }
    }

    /// Applies this mutation to the local view of the document, producing the
    /// latency-compensated result shown before server acknowledgment.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        if !self.precondition().is_valid_for(maybe_doc.as_ref()) {
            return maybe_doc;
        }

        match self {
            Mutation::Set { key, value, .. } => {
                let version = post_mutation_version(maybe_doc.as_ref());
                Some(MaybeDocument::Document(Document::new(
                    key.clone(),
                    version,
                    value.clone(),
                    true,
                )))
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                let version = post_mutation_version(maybe_doc.as_ref());
                let base = base_data(maybe_doc.as_ref());
                let patched = patch_object(&base, data, field_mask);
                Some(MaybeDocument::Document(Document::new(
                    key.clone(),
                    version,
                    patched,
                    true,
                )))
            }
            Mutation::Transform { key, transforms } => {
                // Precondition::Exists(true) held, so this is a Document.
                let doc = maybe_doc
                    .as_ref()
                    .and_then(MaybeDocument::as_document)
                    .cloned()?;
                let mut data = doc.data;
                for transform in transforms {
                    let previous = data.field(&transform.field).cloned();
                    let new_value =
                        apply_local_transform(&transform.operation, previous, local_write_time);
                    data = data.set(&transform.field, new_value);
                }
                Some(MaybeDocument::Document(Document::new(
                    key.clone(),
                    doc.version,
                    data,
                    true,
                )))
            }
            Mutation::Delete { key, .. } => Some(MaybeDocument::NoDocument(NoDocument::new(
                key.clone(),
                SnapshotVersion::MIN,
            ))),
        }
    }

    /// Applies an acknowledged mutation to the server-confirmed document,
    /// using the per-mutation result the server returned.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<MaybeDocument>,
        mutation_result: &MutationResult,
    ) -> SyncResult<MaybeDocument> {
        match self {
            Mutation::Set { key, value, .. } => {
                let version = mutation_result
                    .version
                    .unwrap_or_else(|| post_mutation_version(maybe_doc.as_ref()));
                Ok(MaybeDocument::Document(Document::new(
                    key.clone(),
                    version,
                    value.clone(),
                    false,
                )))
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                if !self.precondition().is_valid_for(maybe_doc.as_ref()) {
                    // The server committed the write against state we have
                    // not caught up to; keep what we have.
                    return maybe_doc.ok_or_else(|| {
                        internal_error("Patch result for unknown document with no local state")
                    });
                }
                let version = mutation_result
                    .version
                    .unwrap_or_else(|| post_mutation_version(maybe_doc.as_ref()));
                let base = base_data(maybe_doc.as_ref());
                let patched = patch_object(&base, data, field_mask);
                Ok(MaybeDocument::Document(Document::new(
                    key.clone(),
                    version,
                    patched,
                    false,
                )))
            }
            Mutation::Transform { key, transforms } => {
                let results = mutation_result.transform_results.as_ref().ok_or_else(|| {
                    internal_error("Transform mutation acknowledged without transform results")
                })?;
                if results.len() != transforms.len() {
                    return Err(internal_error(
                        "Transform results length mismatches transform count",
                    ));
                }
                let doc = maybe_doc
                    .and_then(MaybeDocument::into_document)
                    .ok_or_else(|| internal_error("Can only transform an existing document"))?;
                let mut data = doc.data;
                for (transform, result) in transforms.iter().zip(results.iter()) {
                    data = data.set(&transform.field, result.clone());
                }
                let version = mutation_result.version.unwrap_or(doc.version);
                Ok(MaybeDocument::Document(Document::new(
                    key.clone(),
                    version,
                    data,
                    false,
                )))
            }
            Mutation::Delete { key, .. } => Ok(MaybeDocument::NoDocument(NoDocument::new(
                key.clone(),
                mutation_result.version.unwrap_or(SnapshotVersion::MIN),
            ))),
        }
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version,
        _ => SnapshotVersion::MIN,
    }
}

fn base_data(maybe_doc: Option<&MaybeDocument>) -> ObjectValue {
    maybe_doc
        .and_then(MaybeDocument::as_document)
        .map(|doc| doc.data.clone())
        .unwrap_or_else(ObjectValue::empty)
}

fn patch_object(base: &ObjectValue, data: &ObjectValue, field_mask: &[FieldPath]) -> ObjectValue {
    let mut patched = base.clone();
    for path in field_mask {
        match data.field(path) {
            Some(value) => patched = patched.set(path, value.clone()),
            None => patched = patched.delete(path),
        }
    }
    patched
}

fn apply_local_transform(
    operation: &TransformOperation,
    previous: Option<FieldValue>,
    local_write_time: Timestamp,
) -> FieldValue {
    match operation {
        TransformOperation::ServerTimestamp => FieldValue::ServerTimestamp(local_write_time),
        TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
        TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
    }
}

fn array_union(existing: Option<FieldValue>, additions: &[FieldValue]) -> FieldValue {
    let mut values = match existing {
        Some(FieldValue::Array(values)) => values,
        _ => Vec::new(),
    };
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FieldValue::Array(values)
}

fn array_remove(existing: Option<FieldValue>, removals: &[FieldValue]) -> FieldValue {
    let values = match existing {
        Some(FieldValue::Array(values)) => values,
        _ => Vec::new(),
    };
    FieldValue::Array(
        values
            .into_iter()
            .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
            .collect(),
    )
}

fn numeric_increment(existing: Option<FieldValue>, operand: &FieldValue) -> FieldValue {
    match (existing, operand) {
        (Some(FieldValue::Integer(current)), FieldValue::Integer(delta)) => {
            match current.checked_add(*delta) {
                Some(sum) => FieldValue::Integer(sum),
                None => FieldValue::Double(current as f64 + *delta as f64),
            }
        }
        (Some(FieldValue::Double(current)), FieldValue::Integer(delta)) => {
            FieldValue::Double(current + *delta as f64)
        }
        (Some(FieldValue::Integer(current)), FieldValue::Double(delta)) => {
            FieldValue::Double(current as f64 + delta)
        }
        (Some(FieldValue::Double(current)), FieldValue::Double(delta)) => {
            FieldValue::Double(current + delta)
        }
        // Non-numeric (or absent) base values are replaced by the operand.
        (_, operand) => operand.clone(),
    }
}
