use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Key of one visible item list: content type plus category.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContentKey {
    pub content_type: String,
    pub category: String,
}

impl ContentKey {
    pub fn new(content_type: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            category: category.into(),
        }
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.content_type, self.category)
    }
}

/// Caller's request for one batch of generated items.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub content_type: String,
    pub category: String,
    pub focus: String,
    /// Audience/profile payload, passed through to the service untouched.
    #[serde(default)]
    pub profile: Value,
    /// Ask for a disjoint batch instead of continuing the current one.
    #[serde(default)]
    pub force_new_batch: bool,
}

impl GenerationRequest {
    pub fn new(
        content_type: impl Into<String>,
        category: impl Into<String>,
        focus: impl Into<String>,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            category: category.into(),
            focus: focus.into(),
            profile: Value::Null,
            force_new_batch: false,
        }
    }

    pub fn with_profile(mut self, profile: Value) -> Self {
        self.profile = profile;
        self
    }

    pub fn new_batch(mut self) -> Self {
        self.force_new_batch = true;
        self
    }

    pub fn key(&self) -> ContentKey {
        ContentKey::new(&self.content_type, &self.category)
    }

    /// Build the outbound JSON body. A forced new batch carries a fresh nonce.
    pub fn to_body(&self) -> GenerationBody {
        GenerationBody {
            category: self.category.clone(),
            focus: self.focus.clone(),
            profile: self.profile.clone(),
            nonce: self
                .force_new_batch
                .then(|| Uuid::now_v7().simple().to_string()),
        }
    }
}

/// JSON body sent to the generation service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationBody {
    pub category: String,
    pub focus: String,
    pub profile: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_display() {
        let req = GenerationRequest::new("videos", "luxury", "waterfront");
        assert_eq!(req.key().to_string(), "videos/luxury");
    }

    #[test]
    fn default_body_has_no_nonce() {
        let req = GenerationRequest::new("videos", "luxury", "waterfront")
            .with_profile(json!({"audience": "first-time buyers"}));
        let body = serde_json::to_value(req.to_body()).unwrap();
        assert_eq!(
            body,
            json!({
                "category": "luxury",
                "focus": "waterfront",
                "profile": {"audience": "first-time buyers"}
            })
        );
    }

    #[test]
    fn forced_batch_carries_fresh_nonce() {
        let req = GenerationRequest::new("videos", "luxury", "waterfront").new_batch();
        let a = req.to_body().nonce.unwrap();
        let b = req.to_body().nonce.unwrap();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
