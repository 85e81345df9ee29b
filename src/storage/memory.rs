//! In-memory identity store
//!
//! Linear-scan reference implementation used for tests and small
//! deployments; production stores implement `IdentityStore` over their own
//! index.

use parking_lot::RwLock;

use super::traits::{cosine_similarity, IdentityMatch, IdentityStore};

struct IdentityRecord {
    name: String,
    external_id: String,
    embedding: Vec<f32>,
}

#[derive(Default)]
pub struct InMemoryIdentityStore {
    records: RwLock<Vec<IdentityRecord>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>, external_id: impl Into<String>, embedding: Vec<f32>) {
        self.records.write().push(IdentityRecord {
            name: name.into(),
            external_id: external_id.into(),
            embedding,
        });
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn search(&self, embedding: &[f32], threshold: f32) -> Option<IdentityMatch> {
        let records = self.records.read();

        let mut best: Option<IdentityMatch> = None;
        for record in records.iter() {
            let similarity = cosine_similarity(embedding, &record.embedding);
            if similarity < threshold {
                continue;
            }
            if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                best = Some(IdentityMatch {
                    name: record.name.clone(),
                    external_id: record.external_id.clone(),
                    similarity,
                });
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_two() -> InMemoryIdentityStore {
        let store = InMemoryIdentityStore::new();
        store.add("Alice", "EMP001", vec![1.0, 0.0, 0.0]);
        store.add("Bob", "EMP002", vec![0.0, 1.0, 0.0]);
        store
    }

    #[test]
    fn test_search_returns_best_match() {
        let store = store_with_two();
        let found = store.search(&[0.9, 0.1, 0.0], 0.5).unwrap();
        assert_eq!(found.name, "Alice");
        assert_eq!(found.external_id, "EMP001");
        assert!(found.similarity > 0.9);
    }

    #[test]
    fn test_search_respects_threshold() {
        let store = store_with_two();
        assert!(store.search(&[0.7, 0.7, 0.0], 0.99).is_none());
    }

    #[test]
    fn test_search_empty_store() {
        let store = InMemoryIdentityStore::new();
        assert!(store.search(&[1.0, 0.0], 0.1).is_none());
    }
}
