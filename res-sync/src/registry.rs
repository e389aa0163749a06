//! Factory lookup per resource kind.

use std::sync::Arc;

use crate::pattern::{PatternError, PatternMap};
use crate::resource::{CollectionResource, ModelResource, ResCollection, ResModel};

pub type ModelFactory = Arc<dyn Fn(&str) -> Box<dyn ModelResource> + Send + Sync>;
pub type CollectionFactory = Arc<dyn Fn(&str) -> Box<dyn CollectionResource> + Send + Sync>;

/// Pattern tables for model and collection factories, with defaults used
/// when no registered pattern matches.
pub struct PatternRegistry {
    models: PatternMap<ModelFactory>,
    collections: PatternMap<CollectionFactory>,
    default_model: ModelFactory,
    default_collection: CollectionFactory,
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self {
            models: PatternMap::new(),
            collections: PatternMap::new(),
            default_model: Arc::new(|_: &str| -> Box<dyn ModelResource> {
                Box::new(ResModel::new())
            }),
            default_collection: Arc::new(|_: &str| -> Box<dyn CollectionResource> {
                Box::new(ResCollection::new())
            }),
        }
    }

    pub fn register_model<F>(&mut self, pattern: &str, factory: F) -> Result<(), PatternError>
    where
        F: Fn(&str) -> Box<dyn ModelResource> + Send + Sync + 'static,
    {
        self.models.add(pattern, Arc::new(factory))
    }

    pub fn register_collection<F>(&mut self, pattern: &str, factory: F) -> Result<(), PatternError>
    where
        F: Fn(&str) -> Box<dyn CollectionResource> + Send + Sync + 'static,
    {
        self.collections.add(pattern, Arc::new(factory))
    }

    pub fn set_default_model<F>(&mut self, factory: F)
    where
        F: Fn(&str) -> Box<dyn ModelResource> + Send + Sync + 'static,
    {
        self.default_model = Arc::new(factory);
    }

    pub fn set_default_collection<F>(&mut self, factory: F)
    where
        F: Fn(&str) -> Box<dyn CollectionResource> + Send + Sync + 'static,
    {
        self.default_collection = Arc::new(factory);
    }

    pub fn create_model(&self, rid: &str) -> Box<dyn ModelResource> {
        let factory = self.models.get(rid).unwrap_or(&self.default_model);
        (**factory)(rid)
    }

    pub fn create_collection(&self, rid: &str) -> Box<dyn CollectionResource> {
        let factory = self.collections.get(rid).unwrap_or(&self.default_collection);
        (**factory)(rid)
    }
}
