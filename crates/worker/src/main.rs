mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use genroute_core::request::GenerationRequest;
use genroute_pipeline::hosted::HostedApiProvider;
use genroute_pipeline::provider::{ImageOutput, ImageProvider};
use genroute_pipeline::{Engine, GenerationOutcome};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;

#[derive(Debug, Serialize)]
struct Summary<'a> {
    fingerprint: &'a str,
    provider: &'a str,
    cache_hit: bool,
    seed: Option<u64>,
    job_id: Option<&'a str>,
    elapsed_ms: u128,
    files: Vec<PathBuf>,
    urls: Vec<&'a str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "genroute_worker=info,genroute_pipeline=info,genroute_comfyui=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = WorkerConfig::from_env()?;
    let request = read_request(std::env::args().nth(1).as_deref()).await?;

    let extra: Vec<Arc<dyn ImageProvider>> = config
        .hosted
        .clone()
        .map(|hosted| Arc::new(HostedApiProvider::new(hosted)) as Arc<dyn ImageProvider>)
        .into_iter()
        .collect();

    let engine = Engine::start(config.engine.clone(), extra);
    let outcome = engine.generate(request).await;
    engine.shutdown().await;
    let outcome = outcome?;

    let files = write_artifacts(&config.output_dir, &outcome).await?;
    let result = &outcome.result;
    let summary = Summary {
        fingerprint: outcome.fingerprint.as_str(),
        provider: &result.provider_id,
        cache_hit: outcome.cache_hit,
        seed: result.seed,
        job_id: result.job_id.as_deref(),
        elapsed_ms: result.elapsed.as_millis(),
        files,
        urls: result
            .images
            .iter()
            .filter_map(|image| match image {
                ImageOutput::Url { url } => Some(url.as_str()),
                ImageOutput::Bytes { .. } => None,
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Request JSON from `path`, or from stdin when no path is given.
async fn read_request(path: Option<&str>) -> anyhow::Result<GenerationRequest> {
    let raw = match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read request from {path}"))?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("Failed to read request from stdin")?;
            raw
        }
    };
    serde_json::from_str(&raw).context("Request is not a valid generation request")
}

async fn write_artifacts(dir: &Path, outcome: &GenerationOutcome) -> anyhow::Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for (index, image) in outcome.result.images.iter().enumerate() {
        let ImageOutput::Bytes {
            data,
            content_type,
            filename,
        } = image
        else {
            continue;
        };
        if written.is_empty() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let name = filename.clone().unwrap_or_else(|| {
            let prefix: String = outcome.fingerprint.as_str().chars().take(16).collect();
            format!("{prefix}_{index}.{}", extension_for(content_type))
        });
        let path = dir.join(name);
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), bytes = data.len(), "Artifact written");
        written.push(path);
    }
    Ok(written)
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}
