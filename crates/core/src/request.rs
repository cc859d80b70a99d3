//! Generation request model.
//!
//! A [`GenerationRequest`] describes what the caller wants (prompt, size,
//! style, optional source image) without naming how it is produced. The
//! router derives the [`Feature`]s a backend must support from it.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hashing::sha256_hex;

// ---------------------------------------------------------------------------
// Limits and defaults
// ---------------------------------------------------------------------------

/// Width and height used when a request does not specify them.
pub const DEFAULT_DIMENSION: u32 = 1024;

/// Largest accepted width or height in pixels.
pub const MAX_DIMENSION: u32 = 8192;

/// Upper bound on sampling steps.
pub const MAX_STEPS: u32 = 200;

/// Image-to-image strength applied when a source image is given without one.
pub const DEFAULT_STRENGTH: f32 = 0.7;

// ---------------------------------------------------------------------------
// ImageStyle
// ---------------------------------------------------------------------------

/// Style preset tag. Drives routing rules and sampling defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStyle {
    FastDraft,
    Photoreal,
    BrandLayout,
    Portrait,
    Product,
    LogoText,
    Artistic,
    Cinematic,
}

impl ImageStyle {
    /// Every style, in declaration order.
    pub const ALL: [ImageStyle; 8] = [
        ImageStyle::FastDraft,
        ImageStyle::Photoreal,
        ImageStyle::BrandLayout,
        ImageStyle::Portrait,
        ImageStyle::Product,
        ImageStyle::LogoText,
        ImageStyle::Artistic,
        ImageStyle::Cinematic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageStyle::FastDraft => "fast_draft",
            ImageStyle::Photoreal => "photoreal",
            ImageStyle::BrandLayout => "brand_layout",
            ImageStyle::Portrait => "portrait",
            ImageStyle::Product => "product",
            ImageStyle::LogoText => "logo_text",
            ImageStyle::Artistic => "artistic",
            ImageStyle::Cinematic => "cinematic",
        }
    }
}

impl fmt::Display for ImageStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStyle {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ImageStyle::ALL
            .into_iter()
            .find(|style| style.as_str() == needle)
            .ok_or_else(|| CoreError::Validation(format!("Unknown image style '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Feature
// ---------------------------------------------------------------------------

/// A capability a request may demand from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Feature {
    #[serde(rename = "img2img")]
    Img2Img,
    #[serde(rename = "inpainting")]
    Inpainting,
    #[serde(rename = "negative_prompt")]
    NegativePrompt,
    #[serde(rename = "seed")]
    Seed,
    #[serde(rename = "custom_size")]
    CustomSize,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Img2Img,
        Feature::Inpainting,
        Feature::NegativePrompt,
        Feature::Seed,
        Feature::CustomSize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Img2Img => "img2img",
            Feature::Inpainting => "inpainting",
            Feature::NegativePrompt => "negative_prompt",
            Feature::Seed => "seed",
            Feature::CustomSize => "custom_size",
        }
    }

    /// Hard features cannot be silently dropped: a backend lacking one
    /// must not be asked to serve the request. Soft features only
    /// influence which backend is preferred.
    pub fn is_hard(self) -> bool {
        matches!(self, Feature::Img2Img | Feature::Inpainting)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Feature::ALL
            .into_iter()
            .find(|feature| feature.as_str() == needle)
            .ok_or_else(|| CoreError::Validation(format!("Unknown feature '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// SourceImage
// ---------------------------------------------------------------------------

/// Reference to an auxiliary input image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceImage {
    /// Remote image fetched over HTTP(S).
    Url { url: String },
    /// Image bytes supplied with the request.
    Inline {
        bytes: Vec<u8>,
        #[serde(default)]
        filename: Option<String>,
    },
    /// Image on the local filesystem.
    Path { path: PathBuf },
}

impl SourceImage {
    pub fn url(url: impl Into<String>) -> Self {
        SourceImage::Url { url: url.into() }
    }

    pub fn inline(bytes: Vec<u8>) -> Self {
        SourceImage::Inline {
            bytes,
            filename: None,
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        SourceImage::Path { path: path.into() }
    }

    /// Stable identity used for fingerprinting. Inline images are
    /// identified by content, URLs and paths by location.
    pub fn identity(&self) -> String {
        match self {
            SourceImage::Url { url } => format!("url:{}", url.trim()),
            SourceImage::Inline { bytes, .. } => format!("sha256:{}", sha256_hex(bytes)),
            SourceImage::Path { path } => format!("path:{}", path.display()),
        }
    }

    /// Best-effort filename for uploads. Falls back to `input.png`.
    pub fn file_name_hint(&self) -> String {
        let candidate = match self {
            SourceImage::Url { url } => url
                .split(['?', '#'])
                .next()
                .and_then(|u| u.rsplit('/').next())
                .map(str::to_string),
            SourceImage::Inline { filename, .. } => filename.clone(),
            SourceImage::Path { path } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        };
        candidate
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "input.png".to_string())
    }
}

// ---------------------------------------------------------------------------
// GenerationRequest
// ---------------------------------------------------------------------------

fn default_dimension() -> u32 {
    DEFAULT_DIMENSION
}

fn default_use_cache() -> bool {
    true
}

/// A backend-agnostic image generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    /// Absent means a random seed is drawn per generation.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub style: Option<ImageStyle>,
    /// Sampling step override; the style preset applies when absent.
    #[serde(default)]
    pub steps: Option<u32>,
    /// Guidance override; the style preset applies when absent.
    #[serde(default)]
    pub guidance_scale: Option<f32>,
    #[serde(default)]
    pub source_image: Option<SourceImage>,
    #[serde(default)]
    pub mask_image: Option<SourceImage>,
    /// Only meaningful together with `source_image`.
    #[serde(default)]
    pub strength: Option<f32>,
    #[serde(default)]
    pub provider_override: Option<String>,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            seed: None,
            style: None,
            steps: None,
            guidance_scale: None,
            source_image: None,
            mask_image: None,
            strength: None,
            provider_override: None,
            use_cache: true,
        }
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_style(mut self, style: ImageStyle) -> Self {
        self.style = Some(style);
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_guidance_scale(mut self, guidance: f32) -> Self {
        self.guidance_scale = Some(guidance);
        self
    }

    pub fn with_source_image(mut self, source: SourceImage, strength: Option<f32>) -> Self {
        self.source_image = Some(source);
        self.strength = strength;
        self
    }

    pub fn with_mask_image(mut self, mask: SourceImage) -> Self {
        self.mask_image = Some(mask);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider_override = Some(provider.into());
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Check structural invariants before any backend is involved.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation("Prompt must not be empty".to_string()));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 {
                return Err(CoreError::Validation(format!("{name} must be positive")));
            }
            if value > MAX_DIMENSION {
                return Err(CoreError::Validation(format!(
                    "{name} must be at most {MAX_DIMENSION}, got {value}"
                )));
            }
        }
        if self.mask_image.is_some() && self.source_image.is_none() {
            return Err(CoreError::Validation(
                "mask_image requires a source_image to inpaint".to_string(),
            ));
        }
        if let Some(strength) = self.strength {
            if !strength.is_finite() || !(0.0..=1.0).contains(&strength) {
                return Err(CoreError::Validation(format!(
                    "strength must be within [0, 1], got {strength}"
                )));
            }
        }
        if let Some(steps) = self.steps {
            if steps == 0 || steps > MAX_STEPS {
                return Err(CoreError::Validation(format!(
                    "steps must be within 1..={MAX_STEPS}, got {steps}"
                )));
            }
        }
        if let Some(guidance) = self.guidance_scale {
            if !guidance.is_finite() || guidance < 0.0 {
                return Err(CoreError::Validation(format!(
                    "guidance_scale must be a non-negative number, got {guidance}"
                )));
            }
        }
        if let Some(provider) = &self.provider_override {
            if provider.trim().is_empty() {
                return Err(CoreError::Validation(
                    "provider_override must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Denoise strength to apply, present only when a source image is.
    pub fn effective_strength(&self) -> Option<f32> {
        self.source_image
            .as_ref()
            .map(|_| self.strength.unwrap_or(DEFAULT_STRENGTH))
    }

    /// Features this request asks of a backend.
    pub fn required_features(&self) -> BTreeSet<Feature> {
        let mut features = BTreeSet::new();
        if self.source_image.is_some() {
            features.insert(Feature::Img2Img);
        }
        if self.mask_image.is_some() {
            features.insert(Feature::Inpainting);
        }
        if self
            .negative_prompt
            .as_deref()
            .is_some_and(|neg| !neg.trim().is_empty())
        {
            features.insert(Feature::NegativePrompt);
        }
        if self.seed.is_some() {
            features.insert(Feature::Seed);
        }
        if self.width != DEFAULT_DIMENSION || self.height != DEFAULT_DIMENSION {
            features.insert(Feature::CustomSize);
        }
        features
    }

    /// Override id normalized for lookup, if one is set.
    pub fn normalized_override(&self) -> Option<String> {
        self.provider_override
            .as_deref()
            .map(|id| id.trim().to_ascii_lowercase())
            .filter(|id| !id.is_empty())
    }
}
