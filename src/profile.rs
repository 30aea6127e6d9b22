//! Data shapes exchanged with the search backend.
//!
//! Everything here is plain serde data. Profiles and responses are received
//! whole from the backend (through [`crate::projector`]) and never mutated on
//! the client; stages are transient progress telemetry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One detected trait with its certainty.
///
/// `value == None` means the trait was not detected. `confidence` may be
/// missing even for a detected trait.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeScore {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl AttributeScore {
    pub fn is_detected(&self) -> bool {
        self.value.is_some()
    }
}

/// Trait name -> score, e.g. `basic.age_group`.
pub type TraitSection = BTreeMap<String, AttributeScore>;

/// One analyzed photo: an uploaded reference, a catalog candidate or the
/// synthesized target composite.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub image_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<TraitSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face: Option<TraitSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hair: Option<TraitSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<TraitSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibe: Option<TraitSection>,
}

impl PhotoProfile {
    /// Looks up `section.name`, returning `None` when the section or the trait
    /// is missing or the trait was not detected.
    pub fn attribute(&self, section: &str, name: &str) -> Option<&AttributeScore> {
        let section = match section {
            "basic" => self.basic.as_ref(),
            "face" => self.face.as_ref(),
            "hair" => self.hair.as_ref(),
            "extra" => self.extra.as_ref(),
            "vibe" => self.vibe.as_ref(),
            _ => None,
        }?;

        section.get(name).filter(|score| score.is_detected())
    }

    pub fn is_empty(&self) -> bool {
        *self == PhotoProfile::default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub profile: PhotoProfile,
    pub score: f64,
}

/// Outcome of one completed search. Results keep the order the backend
/// delivered them in (descending score).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub analyzed_positives: Vec<PhotoProfile>,
    #[serde(default)]
    pub analyzed_negatives: Vec<PhotoProfile>,
    #[serde(default)]
    pub target_profile: PhotoProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_image: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Running,
    Completed,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Running => write!(f, "running"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Other(status) => write!(f, "{status}"),
        }
    }
}

/// One named backend pipeline phase as seen so far in the current session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchStage {
    pub name: String,
    pub status: StageStatus,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A single progress event as sent over the channel. Everything but the
/// stage name is optional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageUpdate {
    pub stage: String,
    #[serde(default)]
    pub status: Option<StageStatus>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}
