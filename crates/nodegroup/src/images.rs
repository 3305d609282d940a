use std::path::Path;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    api::{AmiFamily, is_gpu_instance_type},
};

/// Resolves machine images for nodegroups that don't name one explicitly
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve_image(
        &self,
        instance_type: &str,
        family: AmiFamily,
        version: &str,
    ) -> Result<String>;
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ImageClass {
    #[default]
    Standard,
    Gpu,
}

impl ImageClass {
    pub fn for_instance_type(instance_type: &str) -> Self {
        if is_gpu_instance_type(instance_type) {
            Self::Gpu
        } else {
            Self::Standard
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CatalogImage {
    pub family: AmiFamily,
    pub version: String,
    #[serde(default)]
    pub class: ImageClass,
    pub id: String,
}

/// Image catalog for one region, read from a YAML file
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageCatalog {
    #[serde(default)]
    pub images: Vec<CatalogImage>,
}

impl ImageCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml_ng::from_str(&data)?)
    }

    pub fn lookup(&self, family: AmiFamily, version: &str, class: ImageClass) -> Option<&str> {
        self.images
            .iter()
            .find(|image| {
                image.family == family && image.version == version && image.class == class
            })
            .map(|image| image.id.as_str())
    }
}

#[async_trait]
impl ImageResolver for ImageCatalog {
    async fn resolve_image(
        &self,
        instance_type: &str,
        family: AmiFamily,
        version: &str,
    ) -> Result<String> {
        let class = ImageClass::for_instance_type(instance_type);
        self.lookup(family, version, class)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::validation(format!(
                    "no {class:?} image for family {family} and version {version} \
                     (instance type {instance_type})"
                ))
            })
    }
}
