//! Routing rule table.
//!
//! Rules map styles and required features to provider ids. Candidate
//! order for a request is: feature routes, style routes, the default
//! provider, then the fallback chain. Within each group, lower `priority`
//! values come first. Duplicates keep their first position.

use std::collections::{BTreeMap, HashSet};

use genroute_core::request::{Feature, GenerationRequest, ImageStyle};
use genroute_core::types::ProviderId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub provider: ProviderId,
    #[serde(default)]
    pub priority: u32,
}

impl RouteTarget {
    pub fn new(provider: impl Into<ProviderId>, priority: u32) -> Self {
        Self {
            provider: provider.into(),
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRules {
    pub default_provider: ProviderId,
    #[serde(default)]
    pub styles: BTreeMap<ImageStyle, Vec<RouteTarget>>,
    #[serde(default)]
    pub features: BTreeMap<Feature, Vec<RouteTarget>>,
    #[serde(default)]
    pub fallback_chain: Vec<ProviderId>,
}

impl Default for RoutingRules {
    fn default() -> Self {
        let comfyui = || vec![RouteTarget::new("comfyui", 0)];
        let openai = || vec![RouteTarget::new("openai", 0)];

        let mut styles = BTreeMap::new();
        for style in [
            ImageStyle::FastDraft,
            ImageStyle::Photoreal,
            ImageStyle::Portrait,
            ImageStyle::Artistic,
            ImageStyle::Cinematic,
        ] {
            styles.insert(style, comfyui());
        }
        for style in [
            ImageStyle::BrandLayout,
            ImageStyle::LogoText,
            ImageStyle::Product,
        ] {
            styles.insert(style, openai());
        }

        let mut features = BTreeMap::new();
        for feature in [
            Feature::Img2Img,
            Feature::Inpainting,
            Feature::NegativePrompt,
            Feature::Seed,
        ] {
            features.insert(feature, comfyui());
        }

        Self {
            default_provider: "comfyui".to_string(),
            styles,
            features,
            fallback_chain: vec!["comfyui".into(), "flux".into(), "openai".into()],
        }
    }
}

impl RoutingRules {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Ordered, de-duplicated provider ids for `request`, ignoring any
    /// override.
    pub fn plan(&self, request: &GenerationRequest) -> Vec<ProviderId> {
        let mut feature_routes: Vec<&RouteTarget> = request
            .required_features()
            .into_iter()
            .filter_map(|feature| self.features.get(&feature))
            .flatten()
            .collect();
        feature_routes.sort_by_key(|target| target.priority);

        let mut style_routes: Vec<&RouteTarget> = request
            .style
            .and_then(|style| self.styles.get(&style))
            .into_iter()
            .flatten()
            .collect();
        style_routes.sort_by_key(|target| target.priority);

        let ordered = feature_routes
            .into_iter()
            .chain(style_routes)
            .map(|target| target.provider.as_str())
            .chain(std::iter::once(self.default_provider.as_str()))
            .chain(self.fallback_chain.iter().map(String::as_str));

        let mut seen = HashSet::new();
        ordered
            .map(|id| id.trim().to_ascii_lowercase())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect()
    }
}
