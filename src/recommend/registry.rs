use super::step::{MaxCount, StepConfig, StepRecommender};
use super::Recommender;
use crate::config::FunctionConfig;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::Arc;
use toml::Value;

type RecommenderFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn Recommender>, anyhow::Error> + Send + Sync>;

/// Maps configured recommender names to factories.
///
/// Any recommender's parameters may carry `max_count`; the built instance is
/// then wrapped in [`MaxCount`].
pub struct RecommenderRegistry {
    factories: HashMap<String, RecommenderFactory>,
}

impl Default for RecommenderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RecommenderRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("step", |params| {
            let config: StepConfig = params.clone().try_into()?;
            Ok(Arc::new(StepRecommender::new(config)?) as Arc<dyn Recommender>)
        });

        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Recommender>, anyhow::Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, name: &str, params: &Value) -> Result<Arc<dyn Recommender>, anyhow::Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("Recommender '{}' not found", name))?;
        let recommender = factory(params)?;

        match params.get("max_count") {
            None => Ok(recommender),
            Some(value) => {
                let max_count = value
                    .as_integer()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| anyhow!("max_count must be a positive integer, got {}", value))?;
                Ok(Arc::new(MaxCount::new(recommender, max_count as usize)))
            }
        }
    }

    pub fn from_config(&self, config: &FunctionConfig) -> Result<Arc<dyn Recommender>, anyhow::Error> {
        self.create(&config.name, &config.params)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ReducedRecord, SequenceRange};
    use crate::recommend::{Proposal, RecommenderState};

    #[test]
    fn test_step_with_max_count() {
        let registry = RecommenderRegistry::new();
        let params: Value = toml::from_str("step = 1.5\nmax_count = 1").unwrap();
        let rec = registry.create("step", &params).unwrap();
        assert_eq!(rec.name(), "step");

        let history = [ReducedRecord::new("R1", SequenceRange::single(2))
            .with_field("motor", 0.0)
            .with_field("det", 1.0)];
        let mut state = RecommenderState::new("R1");
        assert_eq!(rec.recommend(&history, &mut state).unwrap(), Proposal::Finished);
    }

    #[test]
    fn test_bad_params() {
        let registry = RecommenderRegistry::new();
        let no_step = Value::Table(Default::default());
        assert!(registry.create("step", &no_step).is_err());

        let bad_count: Value = toml::from_str("step = 1.0\nmax_count = -3").unwrap();
        assert!(registry.create("step", &bad_count).is_err());

        assert!(registry.create("gpcam", &no_step).is_err());
        assert_eq!(registry.names(), vec!["step"]);
    }
}
