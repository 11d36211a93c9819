//! Model registry: (modality, id) → descriptor, built once from the catalog.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Catalog;
use crate::error::{ImgenieError, Result};
use crate::types::{Modality, ModelDescriptor, Resolution};

pub struct ModelRegistry {
    by_key: HashMap<(Modality, String), Arc<ModelDescriptor>>,
    ordered: Vec<Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Result<Self> {
        let mut by_key = HashMap::new();
        let mut ordered = Vec::new();
        for descriptor in descriptors {
            let key = (descriptor.modality, descriptor.id.clone());
            if by_key.contains_key(&key) {
                return Err(ImgenieError::Config(format!(
                    "duplicate {} model id '{}'",
                    descriptor.modality, descriptor.id
                )));
            }
            let descriptor = Arc::new(descriptor);
            by_key.insert(key, descriptor.clone());
            ordered.push(descriptor);
        }
        Ok(Self { by_key, ordered })
    }

    pub fn from_catalog(catalog: &Catalog) -> Result<Self> {
        Self::new(catalog.models.iter().cloned())
    }

    pub fn resolve(&self, modality: Modality, id: &str) -> Result<Arc<ModelDescriptor>> {
        self.by_key
            .get(&(modality, id.to_string()))
            .cloned()
            .ok_or_else(|| ImgenieError::NotFound {
                modality,
                id: id.to_string(),
            })
    }

    pub fn list(&self, modality: Modality) -> Vec<Arc<ModelDescriptor>> {
        self.ordered
            .iter()
            .filter(|d| d.modality == modality)
            .cloned()
            .collect()
    }

    pub fn resolutions(&self, modality: Modality, id: &str) -> Result<Vec<Resolution>> {
        Ok(self.resolve(modality, id)?.resolution_options.clone())
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
