//! The provider interface shared by local and hosted backends.
//!
//! Every backend implements [`ImageProvider`]: a capability set plus a
//! uniform `attempt(request)` returning a result or a typed
//! [`ProviderError`]. The router only looks at the error's
//! [`ErrorClass`] to decide between retrying and moving on.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use genroute_comfyui::executor::ExecutionError;
use genroute_comfyui::templates::TemplateError;
use genroute_core::mutation::MutationError;
use genroute_core::request::{Feature, GenerationRequest};
use genroute_core::types::{ProviderId, Timestamp};
use serde::Serialize;

pub type Capabilities = BTreeSet<Feature>;

/// One generated image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageOutput {
    Bytes {
        #[serde(skip)]
        data: Vec<u8>,
        content_type: String,
        filename: Option<String>,
    },
    Url { url: String },
}

/// A successful generation, as produced by one provider.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub provider_id: ProviderId,
    pub images: Vec<ImageOutput>,
    /// Seed actually used, when the backend reports it.
    pub seed: Option<u64>,
    /// Backend-side job identifier, if any.
    pub job_id: Option<String>,
    pub elapsed: Duration,
    pub created_at: Timestamp,
}

/// Whether a failure is worth retrying on the same provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Precondition or rejection: move to the next candidate.
    Local,
    /// Timeout or upstream trouble: retry a bounded number of times.
    Transient,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template invalid: {0}")]
    TemplateInvalid(String),

    #[error("Unsupported graph feature: {0}")]
    UnsupportedGraphFeature(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Submission failed: {message}")]
    Submission { message: String, transient: bool },

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Submission { transient: true, .. }
            | ProviderError::Retrieval(_)
            | ProviderError::TimedOut(_) => ErrorClass::Transient,
            ProviderError::Upstream { status, .. } if *status >= 500 || *status == 429 => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Local,
        }
    }

    /// Short machine-readable label used in attempt histories.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::TemplateNotFound(_) => "template_not_found",
            ProviderError::TemplateInvalid(_) => "template_invalid",
            ProviderError::UnsupportedGraphFeature(_) => "unsupported_graph_feature",
            ProviderError::Upload(_) => "upload_error",
            ProviderError::Submission { .. } => "submission_error",
            ProviderError::Retrieval(_) => "retrieval_error",
            ProviderError::ExecutionFailed(_) => "execution_failed",
            ProviderError::TimedOut(_) => "timed_out",
            ProviderError::Unreachable(_) => "provider_unreachable",
            ProviderError::Upstream { .. } => "upstream_error",
            ProviderError::InvalidResponse(_) => "invalid_response",
        }
    }
}

impl From<TemplateError> for ProviderError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound { .. } => ProviderError::TemplateNotFound(err.to_string()),
            TemplateError::Invalid { .. } | TemplateError::Io { .. } => {
                ProviderError::TemplateInvalid(err.to_string())
            }
        }
    }
}

impl From<MutationError> for ProviderError {
    fn from(err: MutationError) -> Self {
        ProviderError::UnsupportedGraphFeature(err.to_string())
    }
}

impl From<ExecutionError> for ProviderError {
    fn from(err: ExecutionError) -> Self {
        let message = err.to_string();
        match err {
            ExecutionError::Upload(_) => ProviderError::Upload(message),
            ExecutionError::Submission { transient, .. } => {
                ProviderError::Submission { message, transient }
            }
            ExecutionError::Retrieval(_) => ProviderError::Retrieval(message),
            ExecutionError::Failed(_) => ProviderError::ExecutionFailed(message),
            ExecutionError::TimedOut { .. } => ProviderError::TimedOut(message),
        }
    }
}

/// A generation backend.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    /// Produce images for `request`. No retries happen in here.
    async fn attempt(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError>;

    /// Cheap health check used by the background reachability refresh.
    async fn probe(&self) -> bool;

    fn supports(&self, feature: Feature) -> bool {
        self.capabilities().contains(&feature)
    }
}
