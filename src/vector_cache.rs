//! In-memory face embedding cache.
//!
//! Stores one embedding per admitted reference photo and answers
//! "is there a stored face closer than `threshold`" queries. Entries are kept
//! in insertion order so the first match reported is deterministic.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Identity of a dropped file: name plus byte size. Two different files that
/// share both collide, which is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub name: String,
    pub size: u64,
}

impl FileKey {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
        }
    }
}

impl Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.size)
    }
}

/// A stored vector that lies within the query threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct NearMatch {
    pub key: FileKey,
    pub distance: f32,
}

#[derive(Debug, Default)]
pub struct VectorCache {
    entries: Vec<(FileKey, Vec<f32>)>,
}

impl VectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Insert or overwrite the vector for `key`. Overwriting keeps the
    /// first insertion position.
    pub fn put(&mut self, key: FileKey, vector: Vec<f32>) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, stored)) => *stored = vector,
            None => self.entries.push((key, vector)),
        }
    }

    pub fn remove(&mut self, key: &FileKey) -> Option<Vec<f32>> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Return the first stored vector (in insertion order) whose Euclidean
    /// distance to `vector` is strictly below `threshold`.
    ///
    /// All vectors must come from the same embedding model. A dimension
    /// mismatch is a caller bug; release builds skip such entries.
    pub fn nearest_within(&self, vector: &[f32], threshold: f32) -> Option<NearMatch> {
        self.entries.iter().find_map(|(key, stored)| {
            debug_assert_eq!(
                stored.len(),
                vector.len(),
                "embedding dimensions differ for {key}"
            );
            if stored.len() != vector.len() {
                return None;
            }

            let distance = euclidean_distance(stored, vector);
            (distance < threshold).then(|| NearMatch {
                key: key.clone(),
                distance,
            })
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Plain L2 norm of `a - b`.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> FileKey {
        FileKey::new(name, 100)
    }

    #[test]
    fn test_distance() {
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-6);
        assert_eq!(euclidean_distance(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_nearest_within_threshold_is_strict() {
        let mut cache = VectorCache::new();
        cache.put(key("a.jpg"), vec![0.0, 0.0]);

        assert!(cache.nearest_within(&[0.3, 0.0], 0.6).is_some());
        assert!(cache.nearest_within(&[0.6, 0.0], 0.6).is_none());
        assert!(cache.nearest_within(&[0.9, 0.0], 0.6).is_none());
    }

    #[test]
    fn test_first_match_in_insertion_order() {
        let mut cache = VectorCache::new();
        cache.put(key("far.jpg"), vec![0.5, 0.0]);
        cache.put(key("near.jpg"), vec![0.1, 0.0]);

        // both are within range, the earlier insert wins even though it is further away
        let hit = cache.nearest_within(&[0.0, 0.0], 0.6).unwrap();
        assert_eq!(hit.key, key("far.jpg"));
        assert!((hit.distance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_put_overwrites_in_place() {
        let mut cache = VectorCache::new();
        cache.put(key("a.jpg"), vec![5.0, 5.0]);
        cache.put(key("b.jpg"), vec![0.0, 0.0]);
        cache.put(key("a.jpg"), vec![0.0, 0.1]);

        assert_eq!(cache.len(), 2);
        let hit = cache.nearest_within(&[0.0, 0.0], 0.6).unwrap();
        assert_eq!(hit.key, key("a.jpg"));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = VectorCache::new();
        cache.put(key("a.jpg"), vec![0.0]);
        cache.put(key("b.jpg"), vec![1.0]);

        assert_eq!(cache.remove(&key("a.jpg")), Some(vec![0.0]));
        assert_eq!(cache.remove(&key("a.jpg")), None);
        assert!(cache.contains(&key("b.jpg")));

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.nearest_within(&[1.0], 0.6).is_none());
    }
}
