//! Externally registered rule types (`custom:<name>`).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::metadata::Metadata;

use super::ListMap;

/// Predicate behind a `custom:<name>` rule.
pub trait CustomRule: Send + Sync {
    fn matches(&self, metadata: &Metadata) -> bool;
}

impl<F> CustomRule for F
where
    F: Fn(&Metadata) -> bool + Send + Sync,
{
    fn matches(&self, metadata: &Metadata) -> bool {
        self(metadata)
    }
}

/// Builds a custom predicate from the rule's `parameter` and the named lists.
pub type CustomRuleFactory =
    Arc<dyn Fn(&serde_json::Value, &ListMap) -> Result<Arc<dyn CustomRule>, ConfigError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CustomRuleRegistry {
    factories: HashMap<String, CustomRuleFactory>,
}

impl CustomRuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, replacing any previous factory with that name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value, &ListMap) -> Result<Arc<dyn CustomRule>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    pub(crate) fn build(
        &self,
        name: &str,
        parameter: &serde_json::Value,
        lists: &ListMap,
    ) -> Result<Arc<dyn CustomRule>, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRuleType(format!("custom:{name}")))?;
        factory(parameter, lists)
    }
}

impl std::fmt::Debug for CustomRuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_build() {
        let mut registry = CustomRuleRegistry::new();
        registry.register("port-parity", |parameter, _lists| {
            let even = parameter.as_bool().unwrap_or(true);
            let rule: Arc<dyn CustomRule> =
                Arc::new(move |metadata: &Metadata| (metadata.source.port() % 2 == 0) == even);
            Ok(rule)
        });

        let rule = registry
            .build("port-parity", &serde_json::json!(true), &ListMap::new())
            .unwrap();
        let metadata = Metadata::new("main", "127.0.0.1:40000".parse().unwrap());
        assert!(rule.matches(&metadata));

        assert!(registry.unregister("port-parity"));
        assert!(matches!(
            registry.build("port-parity", &serde_json::Value::Null, &ListMap::new()),
            Err(ConfigError::UnknownRuleType(name)) if name == "custom:port-parity"
        ));
    }
}
