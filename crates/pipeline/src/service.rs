//! Generation service: the one place that touches both cache and router.

use std::sync::Arc;

use genroute_core::error::CoreError;
use genroute_core::fingerprint::Fingerprint;
use genroute_core::request::GenerationRequest;
use genroute_core::style::apply_style_templates;

use crate::cache::ResultCache;
use crate::provider::GenerationResult;
use crate::router::{ProviderRouter, RouterError};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] CoreError),

    #[error(transparent)]
    Routing(#[from] RouterError),
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub fingerprint: Fingerprint,
    pub result: Arc<GenerationResult>,
    pub cache_hit: bool,
}

pub struct GenerationService {
    router: Arc<ProviderRouter>,
    cache: Arc<ResultCache>,
    apply_style_templates: bool,
}

impl GenerationService {
    pub fn new(
        router: Arc<ProviderRouter>,
        cache: Arc<ResultCache>,
        apply_style_templates: bool,
    ) -> Self {
        Self {
            router,
            cache,
            apply_style_templates,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    /// Validate, fingerprint, then serve from cache or route.
    ///
    /// With `use_cache` off the router always runs, but the fresh result
    /// still replaces the cached one.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        request.validate()?;
        let request = if self.apply_style_templates {
            apply_style_templates(&request)
        } else {
            request
        };
        let fingerprint = Fingerprint::of(&request);

        let (result, cache_hit) = if request.use_cache {
            self.cache
                .get_or_compute(&fingerprint, || self.route(&request))
                .await?
        } else {
            let result = self.route(&request).await?;
            (self.cache.put(fingerprint.clone(), result).await, false)
        };

        if cache_hit {
            tracing::info!(fingerprint = %fingerprint, provider = %result.provider_id, "Served from cache");
        }

        Ok(GenerationOutcome {
            fingerprint,
            result,
            cache_hit,
        })
    }

    async fn route(&self, request: &GenerationRequest) -> Result<GenerationResult, RouterError> {
        self.router.generate(request).await.map(|routed| routed.result)
    }
}
