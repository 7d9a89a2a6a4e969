//! Deterministic build identity.

use datakit_types::provenance::{BuildId, BuildProvenance, TransformStep};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Version stamped into every build id and provenance block.
pub const CODE_VERSION: &str = env!("CARGO_PKG_VERSION");

const BUILD_ID_HEX_LEN: usize = 16;

/// The exact inputs hashed into a build id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildInputs<'a> {
    pub source_uri: &'a str,
    pub source_version: &'a str,
    pub transforms: &'a [TransformStep],
    pub code_version: &'a str,
    pub seed: u64,
}

impl BuildInputs<'_> {
    /// SHA-256 over the canonical JSON of the inputs, truncated.
    ///
    /// Transform params serialize with sorted keys, so the id depends on
    /// transform order and values but not on YAML key order.
    #[must_use]
    pub fn build_id(&self) -> BuildId {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        let hex = format!("{digest:x}");
        BuildId::new(&hex[..BUILD_ID_HEX_LEN])
    }

    #[must_use]
    pub fn provenance(&self) -> BuildProvenance {
        BuildProvenance {
            build_id: self.build_id(),
            build_timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            random_seed: self.seed,
            transform_pipeline: self.transforms.to_vec(),
            source_uri: self.source_uri.to_string(),
            source_version: self.source_version.to_string(),
            code_version: self.code_version.to_string(),
        }
    }
}
