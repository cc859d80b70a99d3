//! Named graph templates loaded from a directory of API-format JSON files.
//!
//! `load("t2i_flux")` reads `<dir>/t2i_flux.json`, validates it and keeps
//! the parsed template in memory for the rest of the process. `reload`
//! is the only way to pick up changes on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use genroute_core::workflow::GraphTemplate;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template '{name}' not found at {}", path.display())]
    NotFound { name: String, path: PathBuf },

    #[error("Template '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },

    #[error("Failed to read template '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct TemplateStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<GraphTemplate>>>,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached template, reading it from disk on first use.
    pub async fn load(&self, name: &str) -> Result<Arc<GraphTemplate>, TemplateError> {
        if let Some(template) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(template));
        }
        self.reload(name).await
    }

    /// Re-read a template from disk, replacing any cached copy.
    pub async fn reload(&self, name: &str) -> Result<Arc<GraphTemplate>, TemplateError> {
        let template = Arc::new(self.read_from_disk(name).await?);
        self.cache
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&template));
        tracing::info!(template = %name, nodes = template.nodes.len(), "Loaded graph template");
        Ok(template)
    }

    /// Names of the `.json` files in the template directory, sorted.
    pub async fn available(&self) -> Result<Vec<String>, TemplateError> {
        let io_err = |source| TemplateError::Io {
            name: self.dir.display().to_string(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    async fn read_from_disk(&self, name: &str) -> Result<GraphTemplate, TemplateError> {
        let path = self.path_for(name);
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(TemplateError::NotFound {
                name: name.to_string(),
                path,
            });
        }

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound {
                    name: name.to_string(),
                    path,
                })
            }
            Err(source) => {
                return Err(TemplateError::Io {
                    name: name.to_string(),
                    source,
                })
            }
        };

        let json: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| TemplateError::Invalid {
                name: name.to_string(),
                reason: format!("malformed JSON: {e}"),
            })?;

        GraphTemplate::parse(name, &json).map_err(|e| TemplateError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}
