//! Plugin factory registry.
//!
//! Vendor crates are linked into the binary and register their factories at
//! startup. A configuration selects one by `driver_plugin`:
//!
//! ```rust,ignore
//! let registry = PluginRegistry::new();
//! ph_driver_techwing::register(&registry);
//! ph_driver_mock::register(&registry);
//!
//! let config = load_handler_config(path)?;
//! let frame = registry.open_frame(config, tester, events).await?;
//! ```

use crate::event::EventHandler;
use crate::frame::Frame;
use crate::tester::Tester;
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use ph_core::{
    FactoryRegistry, FuncAvailability, HandlerConfig, HandlerPlugin, PluginContext, PluginFactory,
};
use std::sync::Arc;

/// Description of a registered factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryInfo {
    pub driver_type: String,
    pub name: String,
    pub models: Vec<String>,
    pub availability: FuncAvailability,
}

/// Registered plugin factories, keyed by driver type.
#[derive(Default)]
pub struct PluginRegistry {
    factories: DashMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, returning the one it replaces.
    pub fn register_factory(&self, factory: Box<dyn PluginFactory>) -> Option<Arc<dyn PluginFactory>> {
        let driver_type = factory.driver_type().to_string();
        tracing::info!(
            driver_type = %driver_type,
            name = %factory.name(),
            availability = ?factory.availability(),
            "Registering plugin factory"
        );
        self.factories.insert(driver_type, Arc::from(factory))
    }

    pub fn unregister_factory(&self, driver_type: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.remove(driver_type).map(|(_, factory)| factory)
    }

    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// Registered driver types, sorted.
    pub fn list_factories(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    pub fn factory_info(&self, driver_type: &str) -> Option<FactoryInfo> {
        self.factories.get(driver_type).map(|entry| {
            let factory = entry.value();
            FactoryInfo {
                driver_type: factory.driver_type().to_string(),
                name: factory.name().to_string(),
                models: factory.models().iter().map(|m| m.to_string()).collect(),
                availability: factory.availability(),
            }
        })
    }

    fn factory(&self, driver_type: &str) -> Result<Arc<dyn PluginFactory>> {
        // clone out of the map, the build future must not hold a shard lock
        self.factories
            .get(driver_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                anyhow!(
                    "No factory registered for driver_plugin '{}'. Available factories: {:?}",
                    driver_type,
                    self.list_factories()
                )
            })
    }

    /// Check a configuration against the factory it selects, without
    /// connecting to the handler.
    pub fn validate(&self, config: &HandlerConfig) -> Result<()> {
        self.factory(&config.driver_plugin)?
            .validate(config)
            .with_context(|| format!("invalid configuration for driver '{}'", config.driver_plugin))
    }

    /// Validate the configuration and build the plugin it selects.
    ///
    /// # Errors
    /// - no factory is registered for `driver_plugin`
    /// - the factory rejects the configuration
    /// - the plugin fails to connect or initialise
    /// - the plugin lacks the minimum operations
    pub async fn create(&self, ctx: PluginContext) -> Result<Arc<dyn HandlerPlugin>> {
        let driver_type = ctx.config.driver_plugin.clone();
        let factory = self.factory(&driver_type)?;
        self.validate(&ctx.config)?;

        let plugin = factory
            .build(ctx)
            .await
            .with_context(|| format!("failed to initialise driver '{}'", driver_type))?;

        let availability = plugin.availability();
        if !availability.is_usable() {
            anyhow::bail!(
                "driver '{}' lacks required operations: {:?}",
                driver_type,
                FuncAvailability::MINIMUM.difference(availability)
            );
        }
        tracing::info!(driver_type = %driver_type, ?availability, "plugin initialised");
        Ok(plugin)
    }

    /// Build the configured plugin and bind it to a new [`Frame`].
    pub async fn open_frame(
        &self,
        config: HandlerConfig,
        tester: Arc<dyn Tester>,
        events: Arc<dyn EventHandler>,
    ) -> Result<Frame> {
        let ctx = PluginContext::new(config);
        let plugin = self.create(ctx.clone()).await?;
        Ok(Frame::new(ctx, plugin, tester, events))
    }
}

impl FactoryRegistry for PluginRegistry {
    fn register_factory(&self, factory: Box<dyn PluginFactory>) {
        PluginRegistry::register_factory(self, factory);
    }
}
