//! Provider registry with periodically refreshed reachability.
//!
//! The registry is read by every request but only written by the
//! background refresh task spawned with [`ProviderRegistry::spawn_refresher`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genroute_core::types::{ProviderId, Timestamp};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::provider::{Capabilities, ImageProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    /// Not probed yet. Treated as reachable.
    Unknown,
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone, Copy)]
struct Health {
    reachability: Reachability,
    checked_at: Option<Timestamp>,
}

/// Snapshot of one registered provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub capabilities: Capabilities,
    pub reachability: Reachability,
    pub checked_at: Option<Timestamp>,
}

/// Lookup key for a provider id: trimmed and lowercased, matching how
/// routing rules and request overrides are normalized.
pub fn normalize_id(id: &str) -> ProviderId {
    id.trim().to_ascii_lowercase()
}

pub struct ProviderRegistry {
    /// Registration order, keyed by normalized id.
    providers: Vec<(ProviderId, Arc<dyn ImageProvider>)>,
    health: RwLock<HashMap<ProviderId, Health>>,
}

impl ProviderRegistry {
    /// Later registrations whose normalized id is already present are
    /// ignored.
    pub fn new(providers: Vec<Arc<dyn ImageProvider>>) -> Self {
        let mut unique: Vec<(ProviderId, Arc<dyn ImageProvider>)> =
            Vec::with_capacity(providers.len());
        for provider in providers {
            let key = normalize_id(provider.id());
            if unique.iter().any(|(existing, _)| *existing == key) {
                tracing::warn!(provider = %provider.id(), "Duplicate provider id ignored");
                continue;
            }
            unique.push((key, provider));
        }

        let health = unique
            .iter()
            .map(|(key, _)| {
                (
                    key.clone(),
                    Health {
                        reachability: Reachability::Unknown,
                        checked_at: None,
                    },
                )
            })
            .collect();

        Self {
            providers: unique,
            health: RwLock::new(health),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ImageProvider>> {
        let key = normalize_id(id);
        self.providers
            .iter()
            .find(|(existing, _)| *existing == key)
            .map(|(_, provider)| Arc::clone(provider))
    }

    /// Normalized ids in registration order.
    pub fn ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|(key, _)| key.clone()).collect()
    }

    pub async fn reachability(&self, id: &str) -> Reachability {
        self.health
            .read()
            .await
            .get(&normalize_id(id))
            .map(|h| h.reachability)
            .unwrap_or(Reachability::Unknown)
    }

    pub async fn is_reachable(&self, id: &str) -> bool {
        self.reachability(id).await != Reachability::Unreachable
    }

    pub async fn available_providers(&self) -> Vec<ProviderRecord> {
        let health = self.health.read().await;
        self.providers
            .iter()
            .map(|(key, p)| {
                let h = health.get(key).copied();
                ProviderRecord {
                    id: key.clone(),
                    capabilities: p.capabilities().clone(),
                    reachability: h.map_or(Reachability::Unknown, |h| h.reachability),
                    checked_at: h.and_then(|h| h.checked_at),
                }
            })
            .collect()
    }

    /// Probe every provider concurrently and record the results.
    pub async fn refresh(&self) {
        let probes = self.providers.iter().map(|(key, provider)| async move {
            let ok = provider.probe().await;
            (key.clone(), ok)
        });
        let results = futures::future::join_all(probes).await;

        let now = Utc::now();
        let mut health = self.health.write().await;
        for (id, ok) in results {
            let reachability = if ok {
                Reachability::Reachable
            } else {
                Reachability::Unreachable
            };
            let previous = health.insert(
                id.clone(),
                Health {
                    reachability,
                    checked_at: Some(now),
                },
            );
            if previous.map(|h| h.reachability) != Some(reachability) {
                tracing::info!(provider = %id, ?reachability, "Provider reachability changed");
            }
        }
    }

    /// Refresh on `interval` (first tick immediately) until `cancel` fires.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Reachability refresher stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        registry.refresh().await;
                    }
                }
            }
        })
    }
}
