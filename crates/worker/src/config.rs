use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use genroute_core::request::Feature;
use genroute_pipeline::config::EngineConfig;
use genroute_pipeline::hosted::HostedApiConfig;
use genroute_pipeline::provider::Capabilities;
use genroute_pipeline::rules::RoutingRules;

/// Hosted provider calls are bounded by this unless the renderer's job
/// timeout is shorter.
const HOSTED_TIMEOUT: Duration = Duration::from_secs(120);

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub engine: EngineConfig,
    /// Where byte artifacts are written.
    pub output_dir: PathBuf,
    /// Optional hosted provider registered after the local renderer.
    pub hosted: Option<HostedApiConfig>,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                   | Default                      |
    /// |---------------------------|------------------------------|
    /// | `COMFYUI_URL`             | `http://127.0.0.1:8188`      |
    /// | `COMFYUI_WS_URL`          | derived from `COMFYUI_URL`   |
    /// | `TEMPLATE_DIR`            | `workflows`                  |
    /// | `STAGING_DIR`             | `<tmp>/genroute-staging`     |
    /// | `OUTPUT_DIR`              | `output`                     |
    /// | `POLL_INTERVAL_MS`        | `1000`                       |
    /// | `JOB_TIMEOUT_SECS`        | `300`                        |
    /// | `CACHE_CAPACITY`          | `256`                        |
    /// | `CACHE_TTL_SECS`          | `3600` (`0` disables expiry) |
    /// | `ROUTING_RULES_PATH`      | built-in rule table          |
    /// | `HOSTED_API_ID`           | `flux`                       |
    /// | `HOSTED_API_URL`          | unset (no hosted provider)   |
    /// | `HOSTED_API_KEY`          | unset                        |
    /// | `HOSTED_API_CAPABILITIES` | `seed,negative_prompt`       |
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default: u64| -> anyhow::Result<u64> {
            match var(key) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'")),
                None => Ok(default),
            }
        };

        let mut engine = EngineConfig::default();
        if let Some(url) = var("COMFYUI_URL") {
            engine.comfyui_url = url;
        }
        engine.comfyui_ws_url = var("COMFYUI_WS_URL");
        if let Some(dir) = var("TEMPLATE_DIR") {
            engine.template_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("STAGING_DIR") {
            engine.staging_dir = PathBuf::from(dir);
        }
        engine.poll_interval = Duration::from_millis(number("POLL_INTERVAL_MS", 1000)?);
        engine.job_timeout = Duration::from_secs(number("JOB_TIMEOUT_SECS", 300)?);
        engine.cache_capacity = usize::try_from(number("CACHE_CAPACITY", 256)?)
            .context("CACHE_CAPACITY is too large")?;
        engine.cache_ttl = match number("CACHE_TTL_SECS", 3600)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        if engine.poll_interval.is_zero() {
            bail!("POLL_INTERVAL_MS must be positive");
        }

        if let Some(path) = var("ROUTING_RULES_PATH") {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read routing rules from {path}"))?;
            engine.routing = RoutingRules::from_json(&raw)
                .with_context(|| format!("Invalid routing rules in {path}"))?;
        }

        let hosted = match var("HOSTED_API_URL") {
            None => None,
            Some(endpoint) => {
                let capabilities: Capabilities = var("HOSTED_API_CAPABILITIES")
                    .unwrap_or_else(|| "seed,negative_prompt".to_string())
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<Feature>()
                            .map_err(|e| anyhow::anyhow!("HOSTED_API_CAPABILITIES: {e}"))
                    })
                    .collect::<anyhow::Result<_>>()?;
                Some(HostedApiConfig {
                    id: var("HOSTED_API_ID")
                        .unwrap_or_else(|| "flux".to_string())
                        .to_ascii_lowercase(),
                    endpoint,
                    api_key: var("HOSTED_API_KEY"),
                    capabilities,
                    timeout: HOSTED_TIMEOUT.min(engine.job_timeout),
                    health_url: None,
                })
            }
        };

        Ok(Self {
            engine,
            output_dir: PathBuf::from(var("OUTPUT_DIR").unwrap_or_else(|| "output".to_string())),
            hosted,
        })
    }
}
