//! Generic adapter for hosted image APIs.
//!
//! One POST per attempt. The response is either an image body or JSON
//! listing image URLs. Status codes map onto the provider error taxonomy
//! so the router can tell rejections from upstream trouble.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use genroute_core::request::{GenerationRequest, ImageStyle};
use genroute_core::types::ProviderId;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

use crate::provider::{Capabilities, GenerationResult, ImageOutput, ImageProvider, ProviderError};

/// Longest upstream body excerpt kept in error messages.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HostedApiConfig {
    pub id: ProviderId,
    /// Generation endpoint that accepts the JSON body.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub capabilities: Capabilities,
    pub timeout: Duration,
    /// Probed for reachability. Defaults to `endpoint`.
    pub health_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct HostedRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    guidance_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<ImageStyle>,
}

impl<'a> From<&'a GenerationRequest> for HostedRequest<'a> {
    fn from(request: &'a GenerationRequest) -> Self {
        Self {
            prompt: &request.prompt,
            negative_prompt: request
                .negative_prompt
                .as_deref()
                .filter(|n| !n.trim().is_empty()),
            width: request.width,
            height: request.height,
            seed: request.seed,
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            style: request.style,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostedResponse {
    Images { images: Vec<ImageUrl> },
    Single { url: String },
}

impl HostedResponse {
    fn into_urls(self) -> Vec<String> {
        match self {
            HostedResponse::Images { images } => images.into_iter().map(|i| i.url).collect(),
            HostedResponse::Single { url } => vec![url],
        }
    }
}

pub struct HostedApiProvider {
    config: HostedApiConfig,
    http: reqwest::Client,
}

impl HostedApiProvider {
    pub fn new(config: HostedApiConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: HostedApiConfig) -> Self {
        Self { config, http }
    }

    fn map_request_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_connect() {
            ProviderError::Unreachable(format!("{}: {err}", self.config.id))
        } else if err.is_timeout() {
            ProviderError::TimedOut(format!(
                "{} did not answer within {}s",
                self.config.id,
                self.config.timeout.as_secs()
            ))
        } else {
            ProviderError::Submission {
                message: err.to_string(),
                transient: true,
            }
        }
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[async_trait]
impl ImageProvider for HostedApiProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.config.capabilities
    }

    async fn attempt(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError> {
        let started = Instant::now();
        let mut builder = self
            .http
            .post(&self.config.endpoint)
            .timeout(self.config.timeout)
            .json(&HostedRequest::from(request));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.map_request_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(provider = %self.config.id, status = status.as_u16(), "Hosted API rejected request");
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                message: truncate(&body),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();

        let images = if content_type.starts_with("image/") {
            let data = response
                .bytes()
                .await
                .map_err(|e| self.map_request_error(e))?
                .to_vec();
            if data.is_empty() {
                return Err(ProviderError::InvalidResponse("empty image body".to_string()));
            }
            vec![ImageOutput::Bytes {
                data,
                content_type,
                filename: None,
            }]
        } else {
            let body = response.bytes().await.map_err(|e| self.map_request_error(e))?;
            let parsed: HostedResponse = serde_json::from_slice(&body)
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            parsed
                .into_urls()
                .into_iter()
                .map(|url| ImageOutput::Url { url })
                .collect::<Vec<_>>()
        };

        if images.is_empty() {
            return Err(ProviderError::InvalidResponse("response carried no images".to_string()));
        }

        Ok(GenerationResult {
            provider_id: self.config.id.clone(),
            images,
            seed: request.seed,
            job_id: None,
            elapsed: started.elapsed(),
            created_at: Utc::now(),
        })
    }

    /// Any HTTP answer counts as reachable.
    async fn probe(&self) -> bool {
        let url = self
            .config
            .health_url
            .as_deref()
            .unwrap_or(&self.config.endpoint);
        match self.http.get(url).timeout(Duration::from_secs(10)).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(provider = %self.config.id, error = %e, "Health probe failed");
                false
            }
        }
    }
}
