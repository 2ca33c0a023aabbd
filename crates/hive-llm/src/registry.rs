use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use hive_core::config::ModelConfig;
use hive_core::error::{HiveError, Result};
use hive_core::traits::ModelClient;

use crate::scripted::ScriptedClient;

/// Builds a model client from its configuration.
pub type ClientFactory = Arc<dyn Fn(&ModelConfig) -> Result<Arc<dyn ModelClient>> + Send + Sync>;

/// Provider name -> client factory.
///
/// Handed to the application at construction time so nothing in the engine
/// branches on which provider is in use.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the offline `scripted` provider pre-registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("scripted", |_config: &ModelConfig| {
            Ok(Arc::new(ScriptedClient::new()) as Arc<dyn ModelClient>)
        });
        registry
    }

    /// Register (or replace) a provider factory. Names are case-insensitive.
    pub fn register<F>(&mut self, provider: impl Into<String>, factory: F)
    where
        F: Fn(&ModelConfig) -> Result<Arc<dyn ModelClient>> + Send + Sync + 'static,
    {
        let provider = provider.into().to_lowercase();
        debug!(provider = %provider, "Registering model provider");
        self.factories.insert(provider, Arc::new(factory));
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.factories.contains_key(&provider.to_lowercase())
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(&self, config: &ModelConfig) -> Result<Arc<dyn ModelClient>> {
        let factory = self
            .factories
            .get(&config.provider.to_lowercase())
            .ok_or_else(|| HiveError::UnsupportedProvider(config.provider.clone()))?;
        factory(config)
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scripted_provider() {
        let registry = ClientRegistry::with_builtin();
        assert!(registry.contains("scripted"));
        assert!(registry.contains("Scripted"));
        assert!(registry.create(&ModelConfig::default()).is_ok());
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let registry = ClientRegistry::with_builtin();
        let config = ModelConfig {
            provider: "nonexistent".into(),
            ..ModelConfig::default()
        };
        match registry.create(&config) {
            Err(HiveError::UnsupportedProvider(name)) => assert_eq!(name, "nonexistent"),
            other => panic!("expected UnsupportedProvider, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_factory_receives_config() {
        let mut registry = ClientRegistry::new();
        registry.register("keyed", |config: &ModelConfig| {
            if config.api_key.is_none() {
                return Err(HiveError::Config("api_key is required".into()));
            }
            Ok(Arc::new(ScriptedClient::new()) as Arc<dyn ModelClient>)
        });

        let mut config = ModelConfig {
            provider: "keyed".into(),
            ..ModelConfig::default()
        };
        assert!(matches!(registry.create(&config), Err(HiveError::Config(_))));

        config.api_key = Some("sk-test".into());
        assert!(registry.create(&config).is_ok());
        assert_eq!(registry.providers(), vec!["keyed".to_string()]);
    }
}
