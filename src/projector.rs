//! Turns whatever the search endpoints returned into a complete
//! [`SearchResponse`].
//!
//! Top-level collections always come out present (possibly empty) and the
//! target profile is always a profile, so callers never null-check them.
//! Individual traits stay optional.

use serde_json::{Map, Value};

use crate::profile::{AttributeScore, PhotoProfile, SearchResponse, SearchResult, TraitSection};

pub fn project(raw: &Value) -> SearchResponse {
    let Some(raw) = raw.as_object() else {
        log::warn!("search response is not an object, projecting an empty result");
        return SearchResponse::default();
    };

    // text and generate searches call the target `parsed_profile`
    let target_profile = raw
        .get("target_profile")
        .filter(|v| !v.is_null())
        .or_else(|| raw.get("parsed_profile"))
        .map(project_profile)
        .unwrap_or_default();

    SearchResponse {
        results: array(raw, "results").filter_map(project_result).collect(),
        analyzed_positives: array(raw, "analyzed_positives")
            .map(project_profile)
            .collect(),
        analyzed_negatives: array(raw, "analyzed_negatives")
            .map(project_profile)
            .collect(),
        target_profile,
        execution_time: raw.get("execution_time").and_then(Value::as_f64),
        generated_image: raw
            .get("generated_image")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn array<'a>(raw: &'a Map<String, Value>, key: &str) -> impl Iterator<Item = &'a Value> {
    raw.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

/// Either `{profile, score}` or the flat `{photo_id, score, image_path, profile?}`.
fn project_result(raw: &Value) -> Option<SearchResult> {
    let raw = raw.as_object()?;
    let score = raw.get("score").and_then(Value::as_f64).unwrap_or(0.0);

    let mut profile = raw.get("profile").map(project_profile).unwrap_or_default();
    if profile.id.is_empty() {
        if let Some(id) = raw.get("photo_id").and_then(as_text) {
            profile.id = id;
        }
    }
    if profile.image_path.is_empty() {
        if let Some(path) = raw.get("image_path").and_then(Value::as_str) {
            profile.image_path = path.to_string();
        }
    }

    Some(SearchResult { profile, score })
}

pub fn project_profile(raw: &Value) -> PhotoProfile {
    let Some(raw) = raw.as_object() else {
        return PhotoProfile::default();
    };

    PhotoProfile {
        id: raw.get("id").and_then(as_text).unwrap_or_default(),
        image_path: raw
            .get("image_path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        basic: section(raw, "basic"),
        face: section(raw, "face"),
        hair: section(raw, "hair"),
        extra: section(raw, "extra"),
        vibe: section(raw, "vibe"),
    }
}

fn section(raw: &Map<String, Value>, key: &str) -> Option<TraitSection> {
    let traits = raw.get(key)?.as_object()?;

    Some(
        traits
            .iter()
            .filter_map(|(name, score)| Some((name.clone(), attribute(score)?)))
            .collect(),
    )
}

fn attribute(raw: &Value) -> Option<AttributeScore> {
    let raw = raw.as_object()?;

    Some(AttributeScore {
        value: raw.get("value").and_then(as_text),
        confidence: raw.get("confidence").and_then(Value::as_f64),
    })
}

/// Strings as-is, numbers and booleans rendered; null and containers are absent.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_collections_default_to_empty() {
        let projected = project(&json!({
            "results": [],
            "analyzed_positives": [{"id": "p1", "image_path": "/img/p1.jpg"}],
        }));

        assert!(projected.analyzed_negatives.is_empty());
        assert_eq!(projected.target_profile, PhotoProfile::default());
        assert_eq!(projected.analyzed_positives.len(), 1);
        assert_eq!(projected.execution_time, None);
    }

    #[test]
    fn test_non_object_response() {
        assert_eq!(project(&json!(null)), SearchResponse::default());
        assert_eq!(project(&json!([1, 2])), SearchResponse::default());
    }

    #[test]
    fn test_results_keep_delivered_order() {
        let projected = project(&json!({
            "results": [
                {"profile": {"id": "b"}, "score": 0.4},
                {"profile": {"id": "a"}, "score": 0.9},
            ],
            "execution_time": 1.23,
        }));

        let ids = projected
            .results
            .iter()
            .map(|r| r.profile.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(projected.execution_time, Some(1.23));
    }

    #[test]
    fn test_text_search_shape() {
        let projected = project(&json!({
            "results": [
                {"photo_id": "42", "score": 0.8, "image_path": "data/uploads/42.jpg", "profile": {"vibe": {"vibe": {"value": "sporty"}}}},
            ],
            "parsed_profile": {"basic": {"gender": {"value": "male", "confidence": 0.7}}},
            "generated_image": "data/generated/x.png",
        }));

        let result = &projected.results[0];
        assert_eq!(result.profile.id, "42");
        assert_eq!(result.profile.image_path, "data/uploads/42.jpg");
        assert_eq!(
            result.profile.attribute("vibe", "vibe").unwrap().value.as_deref(),
            Some("sporty")
        );
        assert_eq!(
            projected.target_profile.attribute("basic", "gender").unwrap().confidence,
            Some(0.7)
        );
        assert_eq!(projected.generated_image.as_deref(), Some("data/generated/x.png"));
    }

    #[test]
    fn test_lenient_traits() {
        let profile = project_profile(&json!({
            "id": 7,
            "basic": {
                "height": {"value": 180},
                "ethnicity": null,
                "age_group": {"confidence": 0.2},
            },
            "face": "unknown",
        }));

        assert_eq!(profile.id, "7");
        let basic = profile.basic.as_ref().unwrap();
        assert_eq!(basic["height"].value.as_deref(), Some("180"));
        assert!(!basic.contains_key("ethnicity"));
        assert!(!basic["age_group"].is_detected());
        assert!(profile.face.is_none());
    }
}
