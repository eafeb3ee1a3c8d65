//! Shared application state handed to the data plane and admin surface.

use crate::backend::EngineClient;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::plugin::registry::PluginRegistry;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub registry: Arc<PluginRegistry>,
    pub metrics: Arc<Metrics>,
    pub backend: Arc<EngineClient>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Arc::new(PluginRegistry::new(config.plugins.dir.clone()));
        let backend = Arc::new(EngineClient::new(&config.backend));
        Arc::new(Self {
            config,
            registry,
            metrics: Arc::new(Metrics::new()),
            backend,
        })
    }
}
