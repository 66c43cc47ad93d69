use crate::model::TargetId;

/// Hands out monotonically increasing target ids.
///
/// Seeded from the highest id the query cache has persisted so restarted
/// stores never reuse an id.
#[derive(Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    pub fn new(after: TargetId) -> Self {
        Self { next_id: after + 1 }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
