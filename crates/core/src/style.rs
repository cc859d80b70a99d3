//! Style presets: sampling defaults, prompt templates, default negatives.

use crate::request::{GenerationRequest, ImageStyle};

/// Sampling defaults for a style.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StylePreset {
    pub steps: u32,
    pub guidance_scale: f32,
}

pub const DEFAULT_PRESET: StylePreset = StylePreset {
    steps: 28,
    guidance_scale: 3.5,
};

/// Sampling defaults for `style`, or [`DEFAULT_PRESET`] when unstyled.
pub fn preset_for(style: Option<ImageStyle>) -> StylePreset {
    match style {
        Some(ImageStyle::FastDraft) => StylePreset {
            steps: 20,
            guidance_scale: 3.0,
        },
        Some(ImageStyle::Photoreal) => StylePreset {
            steps: 50,
            guidance_scale: 7.0,
        },
        _ => DEFAULT_PRESET,
    }
}

/// Prefix prepended to the user prompt for styles that carry one.
pub fn prompt_prefix(style: ImageStyle) -> Option<&'static str> {
    match style {
        ImageStyle::Product => Some(
            "E-commerce product photo on seamless white, soft studio light, crisp details, professional photography",
        ),
        ImageStyle::Portrait => Some(
            "Natural light portrait, shallow depth of field, realistic skin, 50mm lens, professional photography",
        ),
        ImageStyle::LogoText => Some(
            "Minimal vector logo, high legibility typography, flat design, SVG look, clean background",
        ),
        ImageStyle::BrandLayout => Some(
            "Brand visual design, clean layout, professional composition, marketing material",
        ),
        ImageStyle::Photoreal => Some(
            "Photorealistic, highly detailed, professional photography, 8k resolution",
        ),
        ImageStyle::Cinematic => Some(
            "Cinematic lighting, dramatic composition, film photography, cinematic quality",
        ),
        ImageStyle::FastDraft | ImageStyle::Artistic => None,
    }
}

const GENERAL_NEGATIVE: &str =
    "blurry, low quality, distorted, watermark, text, signature, bad anatomy, extra limbs";

fn style_negative(style: ImageStyle) -> Option<&'static str> {
    match style {
        ImageStyle::Photoreal => Some("cartoon, illustration, painting, drawing, anime, 3d render"),
        ImageStyle::Product => Some("cluttered background, shadows, reflections, busy composition"),
        _ => None,
    }
}

/// Rewrite the prompt through the style template and merge default
/// negatives ahead of the user's own negative prompt.
pub fn apply_style_templates(request: &GenerationRequest) -> GenerationRequest {
    let mut styled = request.clone();

    if let Some(prefix) = request.style.and_then(prompt_prefix) {
        styled.prompt = format!("{prefix}, {}", request.prompt.trim());
    }

    let mut negatives = vec![GENERAL_NEGATIVE];
    if let Some(extra) = request.style.and_then(style_negative) {
        negatives.push(extra);
    }
    if let Some(user) = request.negative_prompt.as_deref() {
        if !user.trim().is_empty() {
            negatives.push(user.trim());
        }
    }
    styled.negative_prompt = Some(negatives.join(", "));

    styled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_match_style() {
        assert_eq!(preset_for(None), DEFAULT_PRESET);
        assert_eq!(preset_for(Some(ImageStyle::FastDraft)).steps, 20);
        assert_eq!(preset_for(Some(ImageStyle::Photoreal)).guidance_scale, 7.0);
        assert_eq!(preset_for(Some(ImageStyle::Portrait)), DEFAULT_PRESET);
    }

    #[test]
    fn template_prefixes_prompt() {
        let req = GenerationRequest::new("a teapot").with_style(ImageStyle::Product);
        let styled = apply_style_templates(&req);
        assert!(styled.prompt.starts_with("E-commerce product photo"));
        assert!(styled.prompt.ends_with(", a teapot"));
    }

    #[test]
    fn unstyled_prompt_is_untouched() {
        let req = GenerationRequest::new("a teapot").with_style(ImageStyle::FastDraft);
        assert_eq!(apply_style_templates(&req).prompt, "a teapot");
    }

    #[test]
    fn negatives_are_merged_in_order() {
        let req = GenerationRequest::new("a face")
            .with_style(ImageStyle::Photoreal)
            .with_negative_prompt("hats");
        let negative = apply_style_templates(&req).negative_prompt.unwrap();
        assert!(negative.starts_with(GENERAL_NEGATIVE));
        assert!(negative.contains("anime"));
        assert!(negative.ends_with(", hats"));
    }
}
