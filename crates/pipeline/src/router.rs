//! Provider selection with fallback.
//!
//! The router turns a request into an ordered candidate list, skips
//! candidates that cannot serve it, and walks the rest until one succeeds.
//! Local errors move on immediately; transient errors are retried on the
//! same candidate up to the configured bound first.

use std::fmt;
use std::sync::Arc;

use genroute_core::request::{Feature, GenerationRequest};
use genroute_core::types::ProviderId;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::RetryPolicy;
use crate::provider::{ErrorClass, GenerationResult, ImageProvider, ProviderError};
use crate::registry::ProviderRegistry;
use crate::rules::RoutingRules;

/// Why a candidate was passed over without being invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NotRegistered,
    Unreachable,
    MissingCapability { feature: Feature },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotRegistered => f.write_str("not registered"),
            SkipReason::Unreachable => f.write_str("unreachable"),
            SkipReason::MissingCapability { feature } => write!(f, "lacks {feature}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Skipped {
        reason: SkipReason,
    },
    Failed {
        kind: &'static str,
        class: ErrorClass,
        message: String,
        attempts: u32,
    },
    Succeeded {
        attempts: u32,
    },
}

/// One line of the per-request routing history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub provider: ProviderId,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Skipped { reason } => {
                write!(f, "{}: skipped ({reason})", self.provider)
            }
            AttemptOutcome::Failed {
                kind,
                message,
                attempts,
                ..
            } => write!(
                f,
                "{}: {kind} after {attempts} attempt(s): {message}",
                self.provider
            ),
            AttemptOutcome::Succeeded { attempts } => {
                write!(f, "{}: succeeded after {attempts} attempt(s)", self.provider)
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    #[error("All providers exhausted: [{}]", format_history(.history))]
    AllProvidersExhausted {
        last_error: Option<ProviderError>,
        history: Vec<AttemptRecord>,
    },
}

impl RouterError {
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            RouterError::AllProvidersExhausted { history, .. } => history,
        }
    }

    pub fn last_error(&self) -> Option<&ProviderError> {
        match self {
            RouterError::AllProvidersExhausted { last_error, .. } => last_error.as_ref(),
        }
    }
}

fn format_history(history: &[AttemptRecord]) -> String {
    if history.is_empty() {
        return "no candidates".to_string();
    }
    history
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Successful routing: the result plus how it was reached.
#[derive(Debug, Clone)]
pub struct Routed {
    pub result: GenerationResult,
    pub history: Vec<AttemptRecord>,
}

pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
    rules: RwLock<RoutingRules>,
    retry: RetryPolicy,
}

impl ProviderRouter {
    pub fn new(registry: Arc<ProviderRegistry>, rules: RoutingRules, retry: RetryPolicy) -> Self {
        Self {
            registry,
            rules: RwLock::new(rules),
            retry,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub async fn set_rules(&self, rules: RoutingRules) {
        *self.rules.write().await = rules;
    }

    /// Candidate ids for `request`, before capability filtering.
    ///
    /// A registered, reachable override is the only candidate. Otherwise
    /// the rule table decides, and an unusable override is noted in
    /// `history`.
    async fn candidates(
        &self,
        request: &GenerationRequest,
        history: &mut Vec<AttemptRecord>,
    ) -> Vec<ProviderId> {
        if let Some(id) = request.normalized_override() {
            let reason = if self.registry.get(&id).is_none() {
                Some(SkipReason::NotRegistered)
            } else if !self.registry.is_reachable(&id).await {
                Some(SkipReason::Unreachable)
            } else {
                None
            };

            match reason {
                None => return vec![id],
                Some(reason) => {
                    tracing::warn!(provider = %id, %reason, "Provider override unusable, using rules");
                    history.push(AttemptRecord {
                        provider: id,
                        outcome: AttemptOutcome::Skipped { reason },
                    });
                }
            }
        }

        self.rules.read().await.plan(request)
    }

    async fn check(
        &self,
        id: &str,
        hard_features: &[Feature],
    ) -> Result<Arc<dyn ImageProvider>, SkipReason> {
        let provider = self.registry.get(id).ok_or(SkipReason::NotRegistered)?;
        if let Some(&feature) = hard_features.iter().find(|f| !provider.supports(**f)) {
            return Err(SkipReason::MissingCapability { feature });
        }
        if !self.registry.is_reachable(id).await {
            return Err(SkipReason::Unreachable);
        }
        Ok(provider)
    }

    /// Run `request` against each candidate in order until one succeeds.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Routed, RouterError> {
        let mut history = Vec::new();
        let mut last_error = None;

        let hard_features: Vec<Feature> = request
            .required_features()
            .into_iter()
            .filter(|f| f.is_hard())
            .collect();

        let candidates = self.candidates(request, &mut history).await;
        tracing::debug!(?candidates, "Routing request");

        for id in candidates {
            let provider = match self.check(&id, &hard_features).await {
                Ok(provider) => provider,
                Err(reason) => {
                    tracing::debug!(provider = %id, %reason, "Skipping candidate");
                    history.push(AttemptRecord {
                        provider: id,
                        outcome: AttemptOutcome::Skipped { reason },
                    });
                    continue;
                }
            };

            let mut attempts = 0;
            let error = loop {
                attempts += 1;
                tracing::info!(provider = %id, attempt = attempts, "Attempting generation");
                match provider.attempt(request).await {
                    Ok(result) => {
                        tracing::info!(
                            provider = %id,
                            attempts,
                            elapsed_ms = result.elapsed.as_millis() as u64,
                            "Generation succeeded"
                        );
                        history.push(AttemptRecord {
                            provider: id,
                            outcome: AttemptOutcome::Succeeded { attempts },
                        });
                        return Ok(Routed { result, history });
                    }
                    Err(e) if e.class() == ErrorClass::Transient && attempts <= self.retry.max_retries => {
                        tracing::warn!(provider = %id, attempt = attempts, error = %e, "Transient failure, retrying");
                        tokio::time::sleep(self.retry.delay).await;
                    }
                    Err(e) => break e,
                }
            };

            tracing::warn!(provider = %id, attempts, error = %error, "Candidate failed");
            history.push(AttemptRecord {
                provider: id,
                outcome: AttemptOutcome::Failed {
                    kind: error.kind(),
                    class: error.class(),
                    message: error.to_string(),
                    attempts,
                },
            });
            last_error = Some(error);
        }

        let err = RouterError::AllProvidersExhausted {
            last_error,
            history,
        };
        tracing::error!(error = %err, "Generation failed on every candidate");
        Err(err)
    }
}
