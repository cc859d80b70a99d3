//! Engine configuration.
//!
//! A plain value object. Nothing in the library reads the environment;
//! the worker binary builds one of these from env vars.

use std::path::PathBuf;
use std::time::Duration;

use genroute_comfyui::executor::ExecutorConfig;
use genroute_comfyui::reconnect::ReconnectConfig;
use genroute_core::types::ProviderId;

use crate::rules::RoutingRules;

/// Bounded retry for transient failures on a single candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(500),
        }
    }
}

/// Template file names (without `.json`) per generation mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateNames {
    pub text_to_image: String,
    pub image_to_image: String,
    pub inpainting: String,
}

impl Default for TemplateNames {
    fn default() -> Self {
        Self {
            text_to_image: "t2i_flux".to_string(),
            image_to_image: "i2i_flux".to_string(),
            inpainting: "inpaint_flux".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Renderer HTTP base, e.g. `http://127.0.0.1:8188`.
    pub comfyui_url: String,
    /// Renderer WebSocket base. Derived from `comfyui_url` when `None`.
    pub comfyui_ws_url: Option<String>,
    /// Event-stream reconnect backoff.
    pub reconnect: ReconnectConfig,
    pub local_provider_id: ProviderId,
    pub template_dir: PathBuf,
    pub templates: TemplateNames,
    pub staging_dir: PathBuf,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub cache_capacity: usize,
    /// `None` keeps entries until evicted by capacity.
    pub cache_ttl: Option<Duration>,
    pub retry: RetryPolicy,
    pub reachability_interval: Duration,
    /// Prepend per-style prompt templates and default negatives.
    pub apply_style_templates: bool,
    pub routing: RoutingRules,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            comfyui_url: "http://127.0.0.1:8188".to_string(),
            comfyui_ws_url: None,
            reconnect: ReconnectConfig::default(),
            local_provider_id: "comfyui".to_string(),
            template_dir: PathBuf::from("workflows"),
            templates: TemplateNames::default(),
            staging_dir: std::env::temp_dir().join("genroute-staging"),
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            cache_capacity: 256,
            cache_ttl: Some(Duration::from_secs(3600)),
            retry: RetryPolicy::default(),
            reachability_interval: Duration::from_secs(60),
            apply_style_templates: false,
            routing: RoutingRules::default(),
        }
    }
}

impl EngineConfig {
    /// WebSocket base URL: the explicit one, or the HTTP URL with its
    /// scheme swapped.
    pub fn ws_url(&self) -> String {
        if let Some(url) = &self.comfyui_ws_url {
            return url.trim_end_matches('/').to_string();
        }
        let http = self.comfyui_url.trim_end_matches('/');
        if let Some(rest) = http.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = http.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{http}")
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: self.poll_interval,
            job_timeout: self.job_timeout,
            staging_dir: self.staging_dir.clone(),
        }
    }
}
