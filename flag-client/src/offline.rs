use std::path::Path;

use flag_engine::environments::Environment;

use crate::error::FlagError;

/// Supplies an environment document without calling the API, either for offline mode or as a
/// fallback when the API can't be reached.
pub trait OfflineHandler: Send + Sync {
    fn environment(&self) -> &Environment;
}

/// Serves the environment document stored in a local JSON file.
pub struct LocalFileHandler {
    environment: Environment,
}

impl LocalFileHandler {
    pub fn new(environment_document_path: impl AsRef<Path>) -> Result<Self, FlagError> {
        let document = std::fs::read_to_string(environment_document_path)?;
        let environment = Environment::from_json(&document)?;
        Ok(LocalFileHandler { environment })
    }
}

impl OfflineHandler for LocalFileHandler {
    fn environment(&self) -> &Environment {
        &self.environment
    }
}
