//! Request fingerprints used as result-cache keys.
//!
//! The fingerprint hashes a canonical JSON document built from the
//! normalized request: keys are sorted, prompt whitespace is collapsed,
//! floats are rendered at fixed precision, and inputs that have no effect
//! on the output (strength without a source image, `use_cache`) are left
//! out. Any change to a field that does affect the output changes the
//! fingerprint.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::hashing::sha256_hex;
use crate::request::GenerationRequest;

/// Opaque hex digest identifying a normalized request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(request: &GenerationRequest) -> Self {
        let canonical = canonical_document(request);
        // BTreeMap keys serialize in sorted order.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Fingerprint(sha256_hex(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fixed(value: f32) -> String {
    format!("{value:.4}")
}

fn canonical_document(request: &GenerationRequest) -> BTreeMap<&'static str, Value> {
    let mut doc = BTreeMap::new();
    doc.insert("prompt", json!(collapse_whitespace(&request.prompt)));
    doc.insert(
        "negative_prompt",
        json!(request.negative_prompt.as_deref().map(collapse_whitespace)),
    );
    doc.insert("width", json!(request.width));
    doc.insert("height", json!(request.height));
    doc.insert("seed", json!(request.seed));
    doc.insert("style", json!(request.style.map(|s| s.as_str())));
    doc.insert("steps", json!(request.steps));
    doc.insert("guidance_scale", json!(request.guidance_scale.map(fixed)));
    doc.insert(
        "source_image",
        json!(request.source_image.as_ref().map(|s| s.identity())),
    );
    doc.insert(
        "mask_image",
        json!(request.mask_image.as_ref().map(|s| s.identity())),
    );
    doc.insert("strength", json!(request.effective_strength().map(fixed)));
    doc.insert("provider_override", json!(request.normalized_override()));
    doc
}
