// Definition Loader
// Reads pipeline definitions from YAML documents

use crate::definition::models::PipelineDefinition;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline definition: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Parse a definition from YAML text
pub fn from_yaml(content: &str) -> Result<PipelineDefinition, LoadError> {
    Ok(serde_yaml::from_str(content)?)
}

/// Read and parse a definition file
pub fn from_file(path: impl AsRef<Path>) -> Result<PipelineDefinition, LoadError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    from_yaml(&content)
}
