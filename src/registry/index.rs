//! Category-scoped similarity index over identity vectors.
//!
//! One flat partition per (extractor, species). Sex gating and version
//! filtering happen during the scan, so the returned shortlist only ever
//! contains gated, comparable candidates. Scans are exact; ordering is by
//! descending cosine similarity with ties broken by identity id.

use crate::embedding::cosine_similarity;
use crate::registry::{Category, Identity, IdentityId, Sex};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct Entry {
    identity: IdentityId,
    sex: Sex,
    version: String,
    vector: Vec<f32>,
}

/// A shortlist hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Candidate identity.
    pub identity: IdentityId,
    /// Raw cosine similarity on the queried extractor.
    pub similarity: f32,
}

/// Similarity index partitioned by extractor and species.
#[derive(Debug, Default, Clone)]
pub struct VectorIndex {
    partitions: HashMap<(String, String), Vec<Entry>>,
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh all vectors of an identity.
    ///
    /// Quarantined identities are removed instead.
    pub fn upsert(&mut self, identity: &Identity) {
        self.remove(identity.id);
        if identity.quarantined {
            return;
        }

        for (extractor, stored) in &identity.embeddings {
            self.partitions
                .entry((extractor.clone(), identity.category.species.clone()))
                .or_default()
                .push(Entry {
                    identity: identity.id,
                    sex: identity.category.sex,
                    version: stored.version.clone(),
                    vector: stored.vector.clone(),
                });
        }
    }

    /// Drop an identity from every partition.
    pub fn remove(&mut self, id: IdentityId) {
        for entries in self.partitions.values_mut() {
            entries.retain(|e| e.identity != id);
        }
        self.partitions.retain(|_, entries| !entries.is_empty());
    }

    /// Number of identities indexed for an extractor.
    pub fn len(&self, extractor: &str) -> usize {
        self.partitions
            .iter()
            .filter(|((name, _), _)| name == extractor)
            .map(|(_, entries)| entries.len())
            .sum()
    }

    /// Whether nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Top `k` gated candidates for a query vector.
    ///
    /// Only entries of the same species, a compatible sex and the same
    /// extractor version are considered. `exclude` removes identities the
    /// caller must never match (negative examples).
    pub fn search(
        &self,
        extractor: &str,
        version: &str,
        category: &Category,
        query: &[f32],
        k: usize,
        exclude: &HashSet<IdentityId>,
    ) -> Vec<Hit> {
        let key = (extractor.to_string(), category.species.clone());
        let Some(entries) = self.partitions.get(&key) else {
            return Vec::new();
        };

        let mut hits: Vec<Hit> = entries
            .iter()
            .filter(|e| e.version == version)
            .filter(|e| e.sex.compatible_with(category.sex))
            .filter(|e| !exclude.contains(&e.identity))
            .filter_map(|e| {
                cosine_similarity(query, &e.vector).map(|similarity| Hit {
                    identity: e.identity,
                    similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        hits.truncate(k);
        hits
    }

    /// Count of indexed entries whose version differs from `version`.
    pub fn stale_entries(&self, extractor: &str, version: &str) -> usize {
        self.partitions
            .iter()
            .filter(|((name, _), _)| name == extractor)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|e| e.version != version)
            .count()
    }
}
