//! Admission of dropped reference photos.
//!
//! Positive references are filtered twice: first by exact (name, size)
//! identity against what is already accepted, then by face identity using
//! embeddings from the validation service and the [`VectorCache`]. Negative
//! references only get the first filter.

use std::path::Path;

use anyhow::Context;

use crate::{
    app::backend::FaceValidator,
    vector_cache::{FileKey, NearMatch, VectorCache},
};

/// A dropped file held in memory until it is sent with a search.
#[derive(Clone, PartialEq)]
pub struct UploadFile {
    pub name: String,
    pub size: u64,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

impl UploadFile {
    pub fn new(name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            size: bytes.len() as u64,
            bytes,
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        Ok(Self::new(&name, bytes))
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(&self.name, self.size)
    }

    /// Sniffed MIME type, if the bytes look like a known format.
    pub fn mime(&self) -> Option<&'static str> {
        infer::get(&self.bytes).map(|kind| kind.mime_type())
    }
}

/// A file rejected because its face is too close to an already admitted one.
#[derive(Debug, Clone, PartialEq)]
pub struct NearDuplicate {
    pub file: FileKey,
    pub duplicate_of: FileKey,
    pub distance: f32,
}

/// Outcome of one drop batch.
#[derive(Debug, Default)]
pub struct DropReport {
    pub admitted: Vec<UploadFile>,
    pub exact_duplicates: Vec<FileKey>,
    pub near_duplicates: Vec<NearDuplicate>,
}

impl DropReport {
    /// User-facing notices: at most one for the exact duplicates of the
    /// batch, one per face duplicate.
    pub fn notices(&self) -> Vec<String> {
        let mut notices = vec![];

        if !self.exact_duplicates.is_empty() {
            let names = self
                .exact_duplicates
                .iter()
                .map(|k| k.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            notices.push(format!(
                "Skipped {} file(s) already added: {names}",
                self.exact_duplicates.len()
            ));
        }

        for dup in &self.near_duplicates {
            notices.push(format!(
                "{} looks like the same person as {}",
                dup.file.name, dup.duplicate_of.name
            ));
        }

        notices
    }
}

/// Drop every file whose (name, size) is already in `accepted` or appeared
/// earlier in the same batch.
pub fn filter_exact(batch: Vec<UploadFile>, accepted: &[FileKey]) -> DropReport {
    let mut seen = accepted.to_vec();
    let mut report = DropReport::default();

    for file in batch {
        let key = file.key();
        if seen.contains(&key) {
            log::debug!("exact duplicate dropped: {key}");
            report.exact_duplicates.push(key);
        } else {
            seen.push(key);
            report.admitted.push(file);
        }
    }

    report
}

pub struct DedupGate {
    cache: VectorCache,
    threshold: f32,
}

impl DedupGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            cache: VectorCache::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn cache(&self) -> &VectorCache {
        &self.cache
    }

    /// Forget the embedding of a file that left the positive slot.
    pub fn forget(&mut self, key: &FileKey) {
        self.cache.remove(key);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Admit a batch of positive references.
    ///
    /// Files are validated one at a time in batch order so cache insertion
    /// order (and therefore which earlier file a duplicate is reported
    /// against) only depends on input order. Validation failures admit the
    /// file.
    pub async fn admit_positives(
        &mut self,
        validator: &dyn FaceValidator,
        batch: Vec<UploadFile>,
        accepted: &[FileKey],
    ) -> DropReport {
        let prefiltered = filter_exact(batch, accepted);
        let mut report = DropReport {
            admitted: Vec::with_capacity(prefiltered.admitted.len()),
            exact_duplicates: prefiltered.exact_duplicates,
            near_duplicates: vec![],
        };

        for file in prefiltered.admitted {
            let validation = match validator.validate_face(&file).await {
                Ok(validation) => validation,
                Err(err) => {
                    log::warn!("face validation failed for {}, admitting: {err}", file.name);
                    report.admitted.push(file);
                    continue;
                }
            };

            let Some(embedding) = validation.usable_embedding() else {
                log::debug!(
                    "no usable face in {} (status {}), admitting",
                    file.name,
                    validation.status
                );
                report.admitted.push(file);
                continue;
            };

            match self.cache.nearest_within(embedding, self.threshold) {
                Some(NearMatch { key, distance }) => {
                    log::info!(
                        "{} rejected: same face as {} (distance {distance:.3})",
                        file.name,
                        key.name
                    );
                    report.near_duplicates.push(NearDuplicate {
                        file: file.key(),
                        duplicate_of: key,
                        distance,
                    });
                }
                None => {
                    self.cache.put(file.key(), embedding.to_vec());
                    report.admitted.push(file);
                }
            }
        }

        report
    }
}
