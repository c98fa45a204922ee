use super::builtin::{Mean, MeanConfig, Passthrough, PassthroughConfig, PeakArea, PeakAreaConfig};
use super::Reducer;
use crate::config::FunctionConfig;
use std::collections::HashMap;
use std::sync::Arc;
use toml::Value;

type ReducerFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn Reducer>, anyhow::Error> + Send + Sync>;

/// Maps configured reducer names to factories.
pub struct ReducerRegistry {
    factories: HashMap<String, ReducerFactory>,
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReducerRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("passthrough", |params| {
            let config: PassthroughConfig = params.clone().try_into()?;
            Ok(Arc::new(Passthrough::new(config)) as Arc<dyn Reducer>)
        });

        registry.register("peak_area", |params| {
            let config: PeakAreaConfig = params.clone().try_into()?;
            Ok(Arc::new(PeakArea::new(config)?) as Arc<dyn Reducer>)
        });

        registry.register("mean", |params| {
            let config: MeanConfig = params.clone().try_into()?;
            Ok(Arc::new(Mean::new(config)?) as Arc<dyn Reducer>)
        });

        registry
    }

    /// Add or replace a factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Reducer>, anyhow::Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, name: &str, params: &Value) -> Result<Arc<dyn Reducer>, anyhow::Error> {
        self.factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Reducer '{}' not found", name))
            .and_then(|factory| factory(params))
    }

    pub fn from_config(&self, config: &FunctionConfig) -> Result<Arc<dyn Reducer>, anyhow::Error> {
        self.create(&config.name, &config.params)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
