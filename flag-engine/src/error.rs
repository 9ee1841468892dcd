use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Feature state not found for feature: {0}")]
    FeatureStateNotFound(String),
    #[error("Feature state for feature {feature_id} already exists on this identity")]
    DuplicateOverride { feature_id: u32 },
    #[error("failed to parse environment document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
}
