//! Common test utilities for ModelVault integration tests
//!
//! Provides helper functions for creating temp-backed vaults and sample
//! model drafts for integration testing.

use std::sync::Arc;

use chrono::Utc;
use modelvault::config::VaultConfig;
use modelvault::crypto::{MasterSecret, MIN_KDF_ITERATIONS};
use modelvault::model::{ModelDraft, ModelMetadata, ModelPayload, ModelPerformance};
use modelvault::store::ModelStore;
use tempfile::TempDir;

/// Test context holding a vault rooted in a temp directory
#[allow(dead_code)]
pub struct TestVault {
    pub temp_dir: TempDir,
    pub secret: Vec<u8>,
    pub store: Arc<ModelStore>,
}

#[allow(dead_code)]
impl TestVault {
    /// Create a vault with a fixed test secret
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let secret: Vec<u8> = (0..32).map(|i| (i * 7 + 13) as u8).collect();
        Self::with_secret(&secret)
    }

    /// Create a vault with a caller-chosen master secret
    pub fn with_secret(secret: &[u8]) -> Result<Self, Box<dyn std::error::Error>> {
        let temp_dir = TempDir::new()?;
        let config = VaultConfig::at(temp_dir.path(), MasterSecret::new(secret.to_vec()))
            .with_kdf_iterations(MIN_KDF_ITERATIONS);
        let store = Arc::new(ModelStore::open(config)?);

        Ok(Self {
            temp_dir,
            secret: secret.to_vec(),
            store,
        })
    }

    /// Open a second store over the same directory and secret, as a
    /// process restart would
    pub fn reopen(&self) -> Result<Arc<ModelStore>, Box<dyn std::error::Error>> {
        let config = VaultConfig::at(
            self.temp_dir.path(),
            MasterSecret::new(self.secret.clone()),
        )
        .with_kdf_iterations(MIN_KDF_ITERATIONS);
        Ok(Arc::new(ModelStore::open(config)?))
    }

    /// Open a second store over the same directory with a different secret
    pub fn reopen_with_secret(
        &self,
        secret: &[u8],
    ) -> Result<Arc<ModelStore>, Box<dyn std::error::Error>> {
        let config = VaultConfig::at(self.temp_dir.path(), MasterSecret::new(secret.to_vec()))
            .with_kdf_iterations(MIN_KDF_ITERATIONS);
        Ok(Arc::new(ModelStore::open(config)?))
    }

    /// Get the temp directory path
    pub fn temp_path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }
}

/// Build a draft with a recognizable payload for round-trip checks
#[allow(dead_code)]
pub fn sample_draft(user_id: &str, version: &str) -> ModelDraft {
    sample_draft_with_marker(user_id, version, "preference-weights-marker")
}

/// Build a draft whose payload carries a caller-chosen marker string
#[allow(dead_code)]
pub fn sample_draft_with_marker(user_id: &str, version: &str, marker: &str) -> ModelDraft {
    let now = Utc::now();
    ModelDraft {
        user_id: user_id.to_string(),
        version: version.to_string(),
        created_at: now,
        last_updated: now,
        payload: sample_payload(version, marker),
        metadata: ModelMetadata {
            model_type: "personalization".to_string(),
            description: "integration test model".to_string(),
            schema_fields: vec![
                "preferences".to_string(),
                "recentTopics".to_string(),
                "weights".to_string(),
            ],
            tags: vec!["test".to_string()],
        },
        performance: ModelPerformance {
            accuracy: 0.91,
            precision: 0.88,
            recall: 0.84,
            sample_count: 1200,
            last_evaluated: now,
        },
    }
}

/// Payload with enough repetitive content to benefit from compression
#[allow(dead_code)]
pub fn sample_payload(version: &str, marker: &str) -> ModelPayload {
    ModelPayload {
        schema_version: version.to_string(),
        format_revision: 1,
        parameters: serde_json::json!({
            "marker": marker,
            "preferences": {
                "theme": "dark",
                "density": "comfortable",
                "timezone": "UTC"
            },
            "recentTopics": ["alpha", "beta", "gamma", "alpha", "beta", "gamma"],
            "weights": vec![0.125f64; 64],
        }),
    }
}
