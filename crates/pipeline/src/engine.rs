//! The engine object: owns every long-lived connection and task.
//!
//! Built once with [`Engine::start`] and passed around explicitly. All
//! background work runs under one cancellation token, so
//! [`Engine::shutdown`] (or dropping the engine) stops the event stream and
//! the reachability refresher together.

use std::sync::Arc;
use std::time::Duration;

use genroute_comfyui::api::ComfyUIApi;
use genroute_comfyui::client::ComfyUIClient;
use genroute_comfyui::events::JobEvent;
use genroute_comfyui::executor::ExecutionClient;
use genroute_comfyui::session::StreamSession;
use genroute_comfyui::templates::TemplateStore;
use genroute_core::request::GenerationRequest;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::local::ComfyUIProvider;
use crate::provider::ImageProvider;
use crate::registry::{ProviderRecord, ProviderRegistry};
use crate::router::ProviderRouter;
use crate::service::{GenerationError, GenerationOutcome, GenerationService};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Engine {
    config: EngineConfig,
    session: Arc<StreamSession>,
    templates: Arc<TemplateStore>,
    executor: Arc<ExecutionClient>,
    registry: Arc<ProviderRegistry>,
    service: GenerationService,
    cancel: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Wire up the engine and start its background tasks. Must be called
    /// from within a Tokio runtime.
    ///
    /// The local renderer is registered first; `extra_providers` follow in
    /// the given order.
    pub fn start(config: EngineConfig, extra_providers: Vec<Arc<dyn ImageProvider>>) -> Self {
        let cancel = CancellationToken::new();

        let client = ComfyUIClient::with_random_id(config.ws_url());
        let session = StreamSession::start(client, config.reconnect.clone(), &cancel);
        let api = ComfyUIApi::new(config.comfyui_url.clone());
        let executor = Arc::new(ExecutionClient::new(
            api,
            Arc::clone(&session),
            config.executor_config(),
        ));
        let templates = Arc::new(TemplateStore::new(config.template_dir.clone()));

        let local: Arc<dyn ImageProvider> = Arc::new(ComfyUIProvider::new(
            config.local_provider_id.clone(),
            Arc::clone(&templates),
            config.templates.clone(),
            Arc::clone(&executor),
        ));
        let mut providers = vec![local];
        providers.extend(extra_providers);
        let registry = Arc::new(ProviderRegistry::new(providers));

        let router = Arc::new(ProviderRouter::new(
            Arc::clone(&registry),
            config.routing.clone(),
            config.retry,
        ));
        let cache = Arc::new(ResultCache::new(config.cache_capacity, config.cache_ttl));
        let service = GenerationService::new(router, cache, config.apply_style_templates);

        let refresher =
            registry.spawn_refresher(config.reachability_interval, cancel.child_token());

        tracing::info!(
            comfyui_url = %config.comfyui_url,
            client_id = %session.client_id(),
            providers = ?registry.ids(),
            "Engine started"
        );

        Self {
            config,
            session,
            templates,
            executor,
            registry,
            service,
            cancel,
            refresher: Mutex::new(Some(refresher)),
        }
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.service.generate(request).await
    }

    pub async fn available_providers(&self) -> Vec<ProviderRecord> {
        self.registry.available_providers().await
    }

    /// Probe every provider now instead of waiting for the next tick.
    pub async fn refresh_providers(&self) {
        self.registry.refresh().await;
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.executor.subscribe_jobs()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        self.service.cache()
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        self.service.router()
    }

    pub fn is_stream_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Cancel background work and wait briefly for it to stop.
    pub async fn shutdown(&self) {
        tracing::info!("Engine shutting down");
        self.cancel.cancel();
        self.session.shutdown().await;
        if let Some(handle) = self.refresher.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("Reachability refresher did not exit in time");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
