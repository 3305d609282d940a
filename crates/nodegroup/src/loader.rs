use std::path::Path;

#[cfg(test)]
use mockall::automock;
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{API_VERSION, CLUSTER_CONFIG_KIND, ClusterConfig},
};

/// Source of configuration documents
#[cfg_attr(test, automock)]
pub trait SpecLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<ClusterConfig>;
}

/// Loads YAML configuration documents from the local filesystem, or stdin for `-`
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl SpecLoader for FileLoader {
    #[instrument(level = Level::DEBUG)]
    fn load(&self, path: &Path) -> Result<ClusterConfig> {
        let data = if path == Path::new("-") {
            std::io::read_to_string(std::io::stdin())?
        } else {
            std::fs::read_to_string(path)?
        };
        parse_document(&data)
            .map_err(|e| Error::validation(format!("loading config file {}: {e}", path.display())))
    }
}

/// Parse a configuration document and check its header
pub fn parse_document(data: &str) -> Result<ClusterConfig> {
    let config: ClusterConfig = serde_yaml_ng::from_str(data)?;

    if config.api_version != API_VERSION {
        return Err(Error::validation(format!(
            "unsupported apiVersion {:?}, expected {API_VERSION:?}",
            config.api_version
        )));
    }
    if config.kind != CLUSTER_CONFIG_KIND {
        return Err(Error::validation(format!(
            "unsupported kind {:?}, expected {CLUSTER_CONFIG_KIND:?}",
            config.kind
        )));
    }

    Ok(config)
}
