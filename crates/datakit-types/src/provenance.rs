//! Build identity and provenance.

use serde::{Deserialize, Serialize};

/// Deterministic fingerprint of the inputs that produced a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(String);

impl BuildId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A configured transform: registry name plus its parameters, verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStep {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Provenance block stored in `meta/info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildProvenance {
    pub build_id: BuildId,
    /// RFC 3339 UTC time the build started. Not part of the build id.
    pub build_timestamp: String,
    pub random_seed: u64,
    pub transform_pipeline: Vec<TransformStep>,
    pub source_uri: String,
    pub source_version: String,
    pub code_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_id_is_transparent() {
        let id = BuildId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        assert_eq!(id.to_string(), "abc");
    }

    #[test]
    fn transform_step_params_default_empty() {
        let step: TransformStep = serde_json::from_str(r#"{"name":"pad_action"}"#).unwrap();
        assert!(step.params.is_empty());
    }
}
