use std::sync::Arc;

use crate::analysis::OutlierModels;
use crate::config::AppConfig;
use crate::detect::{EventTracker, StatusEngine};
use crate::security::{SecurityContext, Verifier};
use crate::storage::ReadingStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn ReadingStore>,
    pub engine: Arc<StatusEngine>,
    pub verifier: Arc<Verifier>,
    pub events: Arc<EventTracker>,
}

impl AppState {
    /// Wire the engine, verifier and store together from one configuration.
    /// Outlier models are loaded here; a missing artifact only disables it.
    pub fn new(config: AppConfig, store: Arc<dyn ReadingStore>) -> Self {
        let models = OutlierModels::load(
            config.model.ground_path.as_deref(),
            config.model.water_path.as_deref(),
        );
        Self::with_models(config, store, models)
    }

    pub fn with_models(
        config: AppConfig,
        store: Arc<dyn ReadingStore>,
        models: OutlierModels,
    ) -> Self {
        let engine = StatusEngine::new(config.status.clone(), models);
        let verifier = Verifier::new(SecurityContext::from_config(&config.security));
        Self {
            config: Arc::new(config),
            store,
            engine: Arc::new(engine),
            verifier: Arc::new(verifier),
            events: Arc::new(EventTracker::new()),
        }
    }
}
