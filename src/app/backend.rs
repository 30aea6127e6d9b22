use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{dedup::UploadFile, session_id::SessionId};

use super::errors::AppError;

/// Owner id the backend uses in single-user mode.
pub const DEFAULT_USER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Search endpoints and the bookkeeping calls the session needs around them.
///
/// Search calls return the raw JSON body; shaping it is the projector's job.
pub trait SearchBackend: Send + Sync {
    fn submit_image_search<'a>(
        &'a self,
        positives: &'a [UploadFile],
        negatives: &'a [UploadFile],
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<serde_json::Value, AppError>>;

    fn submit_text_search<'a>(
        &'a self,
        request: &'a PromptSearchRequest,
    ) -> BoxFuture<'a, Result<serde_json::Value, AppError>>;

    fn submit_generate_search<'a>(
        &'a self,
        request: &'a PromptSearchRequest,
    ) -> BoxFuture<'a, Result<serde_json::Value, AppError>>;

    fn list_collections(&self) -> BoxFuture<'_, Result<Vec<Collection>, AppError>>;

    fn create_collection<'a>(
        &'a self,
        meta: &'a CollectionCreate,
    ) -> BoxFuture<'a, Result<Collection, AppError>>;

    fn fetch_history(&self) -> BoxFuture<'_, Result<Vec<HistoryEntry>, AppError>>;
}

/// External face-embedding service used by the dedup gate.
pub trait FaceValidator: Send + Sync {
    fn validate_face<'a>(
        &'a self,
        file: &'a UploadFile,
    ) -> BoxFuture<'a, Result<FaceValidation, AppError>>;
}

/// Body shared by the text and generate search endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSearchRequest {
    pub prompt: String,
    pub collection_id: String,
    pub session_id: SessionId,
    pub top_k: u32,
    /// Only sent to the generate endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceValidation {
    pub status: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl FaceValidation {
    /// An embedding the gate can compare against the cache.
    pub fn usable_embedding(&self) -> Option<&[f32]> {
        if self.status != "ok" {
            return None;
        }
        self.embedding.as_deref().filter(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub photo_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionCreate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub user_id: String,
}

/// A past search as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub positives: Vec<String>,
    #[serde(default)]
    pub negatives: Vec<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_embedding() {
        let ok = FaceValidation {
            status: "ok".to_string(),
            embedding: Some(vec![0.1, 0.2]),
            detail: None,
        };
        assert_eq!(ok.usable_embedding(), Some(&[0.1f32, 0.2][..]));

        let no_face = FaceValidation {
            status: "ok".to_string(),
            ..Default::default()
        };
        assert!(no_face.usable_embedding().is_none());

        let disabled: FaceValidation =
            serde_json::from_str(r#"{"embedding":null,"status":"disabled"}"#).unwrap();
        assert!(disabled.usable_embedding().is_none());
    }

    #[test]
    fn test_prompt_request_omits_generator_for_text() {
        let request = PromptSearchRequest {
            prompt: "curly red hair".to_string(),
            collection_id: "c1".to_string(),
            session_id: SessionId::from("s1"),
            top_k: 20,
            generator: None,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["session_id"], "s1");
        assert!(body.get("generator").is_none());
    }
}
