//! Query-wide deduplication registry for data part uuids

use dashmap::DashSet;
use uuid::Uuid;

/// Tracks every data part uuid seen by a query across all replicas.
///
/// Replicas announce the uuids of the parts they are about to serve; if two
/// replicas would serve the same part, the second announcement collides here
/// and the caller retries with the colliding uuids suppressed.
#[derive(Debug, Default)]
pub struct PartUuidRegistry {
    seen: DashSet<Uuid>,
}

impl PartUuidRegistry {
    pub fn new() -> Self {
        Self {
            seen: DashSet::new(),
        }
    }

    /// Register a batch of uuids, returning the subset that was already known.
    pub fn add(&self, uuids: &[Uuid]) -> Vec<Uuid> {
        uuids
            .iter()
            .filter(|uuid| !self.seen.insert(**uuid))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_add_has_no_collisions() {
        let registry = PartUuidRegistry::new();
        let uuids = vec![Uuid::new_v4(), Uuid::new_v4()];
        assert!(registry.add(&uuids).is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_repeated_uuid_collides() {
        let registry = PartUuidRegistry::new();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        registry.add(&[u1]);

        let collisions = registry.add(&[u1, u2]);
        assert_eq!(collisions, vec![u1]);
        assert_eq!(registry.len(), 2);
    }
}
