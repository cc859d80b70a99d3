//! The local renderer as a provider: template, mutate, execute.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use genroute_comfyui::executor::ExecutionClient;
use genroute_comfyui::templates::TemplateStore;
use genroute_core::mutation::{self, Slot};
use genroute_core::request::{Feature, GenerationRequest};
use genroute_core::types::ProviderId;

use crate::config::TemplateNames;
use crate::provider::{Capabilities, GenerationResult, ImageOutput, ImageProvider, ProviderError};

pub struct ComfyUIProvider {
    id: ProviderId,
    capabilities: Capabilities,
    templates: Arc<TemplateStore>,
    names: TemplateNames,
    executor: Arc<ExecutionClient>,
}

impl ComfyUIProvider {
    pub fn new(
        id: impl Into<ProviderId>,
        templates: Arc<TemplateStore>,
        names: TemplateNames,
        executor: Arc<ExecutionClient>,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities: Feature::ALL.into_iter().collect(),
            templates,
            names,
            executor,
        }
    }

    /// Template for the request's mode: inpainting, image-to-image or
    /// text-to-image.
    pub fn template_for(&self, request: &GenerationRequest) -> &str {
        if request.mask_image.is_some() {
            &self.names.inpainting
        } else if request.source_image.is_some() {
            &self.names.image_to_image
        } else {
            &self.names.text_to_image
        }
    }
}

#[async_trait]
impl ImageProvider for ComfyUIProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn attempt(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError> {
        let started = Instant::now();
        let template_name = self.template_for(request);
        let template = self.templates.load(template_name).await?;
        let instance = mutation::apply(&template, request)?;
        let seed = instance.seed();

        let uploads: Vec<_> = [
            (Slot::InputImage, request.source_image.clone()),
            (Slot::InputMask, request.mask_image.clone()),
        ]
        .into_iter()
        .filter_map(|(slot, source)| source.map(|s| (slot, s)))
        .collect();

        tracing::debug!(provider = %self.id, template = %template_name, seed, "Running graph");
        let job = self.executor.run(instance, &uploads).await?;

        let images = job
            .artifacts
            .into_iter()
            .map(|artifact| ImageOutput::Bytes {
                content_type: artifact.content_type().to_string(),
                filename: Some(artifact.reference.filename),
                data: artifact.bytes,
            })
            .collect();

        Ok(GenerationResult {
            provider_id: self.id.clone(),
            images,
            seed: Some(seed),
            job_id: Some(job.job_id),
            elapsed: started.elapsed(),
            created_at: Utc::now(),
        })
    }

    async fn probe(&self) -> bool {
        match self.executor.api().system_stats().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(provider = %self.id, error = %e, "Health probe failed");
                false
            }
        }
    }
}
