//! Graph mutation: bind request parameters into a copy of a template.
//!
//! Each semantic [`Slot`] maps to one or more [`SlotBinding`]s naming the
//! node role it targets and the candidate input fields. The binding table
//! is the whole mutation policy; [`apply`] just walks it.

use std::fmt;

use serde_json::{json, Value};

use crate::request::GenerationRequest;
use crate::style::preset_for;
use crate::workflow::{GraphTemplate, NodeRole};

/// Mode-switch values understood by the bundled templates.
pub const MODE_TEXT_TO_IMAGE: &str = "T2I";
pub const MODE_IMAGE_TO_IMAGE: &str = "I2I";

// ---------------------------------------------------------------------------
// Slots and the binding table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    PositivePrompt,
    NegativePrompt,
    Seed,
    Steps,
    Guidance,
    Denoise,
    Width,
    Height,
    InputImage,
    InputMask,
    ModeSwitch,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Slot::PositivePrompt => "positive prompt",
            Slot::NegativePrompt => "negative prompt",
            Slot::Seed => "seed",
            Slot::Steps => "steps",
            Slot::Guidance => "guidance scale",
            Slot::Denoise => "denoise strength",
            Slot::Width => "width",
            Slot::Height => "height",
            Slot::InputImage => "input image",
            Slot::InputMask => "input mask",
            Slot::ModeSwitch => "mode switch",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Absence of the role is an error when the slot is needed.
    Required,
    /// Absence of the role silently skips the slot.
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    First,
    All,
}

/// How a binding writes into the candidate fields of a target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Every candidate field present is written; the first candidate is
    /// added when the node has none of them.
    Fill,
    /// Only the first candidate field present is written, and only when it
    /// already holds a string. Nodes without one are left alone.
    ReplaceText,
}

#[derive(Debug, Clone, Copy)]
pub struct SlotBinding {
    pub slot: Slot,
    pub role: NodeRole,
    /// Candidate field names, in preference order.
    pub fields: &'static [&'static str],
    pub requirement: Requirement,
    pub scope: Scope,
    /// Class names ranked ahead of template order. Empty keeps template order.
    pub prefer: &'static [&'static str],
    pub policy: FieldPolicy,
}

const PROMPT_FIELDS: &[&str] = &["text", "text_g", "text_l"];
const IMAGE_FIELDS: &[&str] = &["image", "filename"];

pub const SLOT_BINDINGS: &[SlotBinding] = &[
    SlotBinding {
        slot: Slot::PositivePrompt,
        role: NodeRole::PositiveTextEncoder,
        fields: PROMPT_FIELDS,
        requirement: Requirement::Required,
        scope: Scope::All,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::NegativePrompt,
        role: NodeRole::NegativeTextEncoder,
        fields: PROMPT_FIELDS,
        requirement: Requirement::Optional,
        scope: Scope::All,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::Seed,
        role: NodeRole::Sampler,
        fields: &["seed", "noise_seed"],
        requirement: Requirement::Required,
        scope: Scope::All,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::Steps,
        role: NodeRole::Sampler,
        fields: &["steps"],
        requirement: Requirement::Optional,
        scope: Scope::First,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::Guidance,
        role: NodeRole::Sampler,
        fields: &["cfg"],
        requirement: Requirement::Optional,
        scope: Scope::First,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::Guidance,
        role: NodeRole::Guidance,
        fields: &["guidance"],
        requirement: Requirement::Optional,
        scope: Scope::All,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::Denoise,
        role: NodeRole::Sampler,
        fields: &["denoise"],
        requirement: Requirement::Optional,
        scope: Scope::First,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::Width,
        role: NodeRole::LatentSource,
        fields: &["width"],
        requirement: Requirement::Optional,
        scope: Scope::First,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::Height,
        role: NodeRole::LatentSource,
        fields: &["height"],
        requirement: Requirement::Optional,
        scope: Scope::First,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::InputImage,
        role: NodeRole::ImageLoader,
        fields: IMAGE_FIELDS,
        requirement: Requirement::Required,
        scope: Scope::First,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::InputMask,
        role: NodeRole::MaskLoader,
        fields: IMAGE_FIELDS,
        requirement: Requirement::Required,
        scope: Scope::First,
        prefer: &[],
        policy: FieldPolicy::Fill,
    },
    SlotBinding {
        slot: Slot::ModeSwitch,
        role: NodeRole::ModeSwitch,
        fields: &["value", "text", "select"],
        requirement: Requirement::Optional,
        scope: Scope::First,
        prefer: &["AnySwitch", "Primitive"],
        policy: FieldPolicy::ReplaceText,
    },
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MutationError {
    #[error("Template '{template}' cannot bind {slot}: no {role} node")]
    UnsupportedGraphFeature {
        template: String,
        slot: Slot,
        role: NodeRole,
    },

    #[error("Graph '{template}' has no pending upload for {slot}")]
    NoPendingUpload { template: String, slot: Slot },
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Concrete values for every slot, resolved from a request.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationParams {
    pub positive_prompt: String,
    pub negative_prompt: Option<String>,
    pub seed: u64,
    pub steps: u32,
    pub guidance_scale: f32,
    pub denoise: Option<f32>,
    pub width: u32,
    pub height: u32,
    pub with_image: bool,
    pub with_mask: bool,
}

impl MutationParams {
    /// Resolve style defaults and draw a seed when the request has none.
    pub fn from_request(request: &GenerationRequest) -> Self {
        let preset = preset_for(request.style);
        Self {
            positive_prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            seed: request
                .seed
                .unwrap_or_else(|| u64::from(rand::random::<u32>())),
            steps: request.steps.unwrap_or(preset.steps),
            guidance_scale: request.guidance_scale.unwrap_or(preset.guidance_scale),
            denoise: request.effective_strength(),
            width: request.width,
            height: request.height,
            with_image: request.source_image.is_some(),
            with_mask: request.mask_image.is_some(),
        }
    }

    /// Value for `slot`, or `None` when the request does not need it.
    fn value_for(&self, slot: Slot) -> Option<Value> {
        match slot {
            Slot::PositivePrompt => Some(json!(self.positive_prompt)),
            Slot::NegativePrompt => self.negative_prompt.as_ref().map(|n| json!(n)),
            Slot::Seed => Some(json!(self.seed)),
            Slot::Steps => Some(json!(self.steps)),
            Slot::Guidance => Some(json!(self.guidance_scale)),
            Slot::Denoise => self.denoise.map(|d| json!(d)),
            Slot::Width => Some(json!(self.width)),
            Slot::Height => Some(json!(self.height)),
            // Bound later with the stored upload name.
            Slot::InputImage => self.with_image.then(|| Value::Null),
            Slot::InputMask => self.with_mask.then(|| Value::Null),
            Slot::ModeSwitch => Some(json!(if self.with_image {
                MODE_IMAGE_TO_IMAGE
            } else {
                MODE_TEXT_TO_IMAGE
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph instance
// ---------------------------------------------------------------------------

/// An image-loader field waiting for the renderer-side upload name.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub slot: Slot,
    pub node_id: String,
    pub fields: Vec<String>,
    pub bound: bool,
}

/// A request-specific copy of a template. Owns its nodes outright.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphInstance {
    pub graph: GraphTemplate,
    pub params: MutationParams,
    pub uploads: Vec<PendingUpload>,
}

impl GraphInstance {
    pub fn template_name(&self) -> &str {
        &self.graph.name
    }

    pub fn seed(&self) -> u64 {
        self.params.seed
    }

    /// Write the stored filename into every field waiting on `slot`.
    pub fn bind_upload(&mut self, slot: Slot, stored_name: &str) -> Result<(), MutationError> {
        let mut found = false;
        for upload in self.uploads.iter_mut().filter(|u| u.slot == slot) {
            if let Some(node) = self.graph.nodes.iter_mut().find(|n| n.id == upload.node_id) {
                for field in &upload.fields {
                    node.set_literal(field, json!(stored_name));
                }
                upload.bound = true;
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(MutationError::NoPendingUpload {
                template: self.graph.name.clone(),
                slot,
            })
        }
    }

    pub fn has_unbound_uploads(&self) -> bool {
        self.uploads.iter().any(|u| !u.bound)
    }

    pub fn to_json(&self) -> Value {
        self.graph.to_json()
    }
}

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// Copy `template` and bind the request's parameters into it.
pub fn apply(
    template: &GraphTemplate,
    request: &GenerationRequest,
) -> Result<GraphInstance, MutationError> {
    apply_params(template, MutationParams::from_request(request))
}

pub fn apply_params(
    template: &GraphTemplate,
    params: MutationParams,
) -> Result<GraphInstance, MutationError> {
    let mut graph = template.clone();
    let mut uploads = Vec::new();

    for binding in SLOT_BINDINGS {
        let Some(value) = params.value_for(binding.slot) else {
            continue;
        };

        let mut targets: Vec<usize> = graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.role == binding.role)
            .map(|(i, _)| i)
            .collect();
        // Stable sort keeps template order within a class rank.
        targets.sort_by_key(|&i| {
            binding
                .prefer
                .iter()
                .position(|class| *class == graph.nodes[i].class_type)
                .unwrap_or(binding.prefer.len())
        });
        if binding.scope == Scope::First {
            targets.truncate(1);
        }

        if targets.is_empty() {
            if binding.requirement == Requirement::Required {
                return Err(MutationError::UnsupportedGraphFeature {
                    template: template.name.clone(),
                    slot: binding.slot,
                    role: binding.role,
                });
            }
            continue;
        }

        for index in targets {
            let node = &mut graph.nodes[index];
            let fields: Vec<String> = match binding.policy {
                FieldPolicy::Fill => {
                    let present: Vec<String> = binding
                        .fields
                        .iter()
                        .filter(|f| node.has_field(f))
                        .map(|f| f.to_string())
                        .collect();
                    if present.is_empty() {
                        vec![binding.fields[0].to_string()]
                    } else {
                        present
                    }
                }
                FieldPolicy::ReplaceText => binding
                    .fields
                    .iter()
                    .find(|f| node.has_field(f))
                    .filter(|f| node.literal(f).is_some_and(Value::is_string))
                    .map(|f| vec![f.to_string()])
                    .unwrap_or_default(),
            };
            if fields.is_empty() {
                continue;
            }

            if matches!(binding.slot, Slot::InputImage | Slot::InputMask) {
                uploads.push(PendingUpload {
                    slot: binding.slot,
                    node_id: node.id.clone(),
                    fields,
                    bound: false,
                });
                continue;
            }
            for field in &fields {
                node.set_literal(field, value.clone());
            }
        }
    }

    Ok(GraphInstance {
        graph,
        params,
        uploads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SourceImage;
    use crate::workflow::tests::t2i_json;
    use assert_matches::assert_matches;

    fn t2i() -> GraphTemplate {
        GraphTemplate::parse("t2i", &t2i_json()).unwrap()
    }

    fn i2i() -> GraphTemplate {
        let mut raw = t2i_json();
        raw["10"] = json!({ "class_type": "LoadImage", "inputs": { "image": "example.png" } });
        raw["11"] = json!({ "class_type": "VAEEncode", "inputs": { "pixels": ["10", 0], "vae": ["4", 2] } });
        raw["12"] = json!({ "class_type": "AnySwitch", "inputs": { "value": "T2I" } });
        raw["13"] = json!({ "class_type": "FluxGuidance", "inputs": { "guidance": 1.0, "conditioning": ["7", 0] } });
        GraphTemplate::parse("i2i", &raw).unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("a red cube on a table")
            .with_size(512, 768)
            .with_seed(7)
    }

    fn field<'a>(instance: &'a GraphInstance, node: &str, name: &str) -> &'a Value {
        instance.graph.node(node).unwrap().literal(name).unwrap()
    }

    #[test]
    fn binds_core_parameters() {
        let instance = apply(&t2i(), &request().with_steps(12).with_guidance_scale(5.5)).unwrap();
        assert_eq!(field(&instance, "7", "text"), "a red cube on a table");
        assert_eq!(field(&instance, "3", "seed"), 7);
        assert_eq!(field(&instance, "3", "steps"), 12);
        assert_eq!(field(&instance, "3", "cfg"), 5.5);
        assert_eq!(field(&instance, "5", "width"), 512);
        assert_eq!(field(&instance, "5", "height"), 768);
        assert!(instance.uploads.is_empty());
    }

    #[test]
    fn template_is_left_untouched() {
        let template = t2i();
        let before = template.clone();
        let _ = apply(&template, &request()).unwrap();
        assert_eq!(template, before);
    }

    #[test]
    fn absent_negative_keeps_template_default() {
        let instance = apply(&t2i(), &request()).unwrap();
        assert_eq!(field(&instance, "6", "text"), "ugly");
    }

    #[test]
    fn explicit_empty_negative_overwrites() {
        let instance = apply(&t2i(), &request().with_negative_prompt("")).unwrap();
        assert_eq!(field(&instance, "6", "text"), "");
    }

    #[test]
    fn style_preset_supplies_sampling_defaults() {
        let req = request().with_style(crate::request::ImageStyle::FastDraft);
        let instance = apply(&t2i(), &req).unwrap();
        assert_eq!(field(&instance, "3", "steps"), 20);
        assert_eq!(field(&instance, "3", "cfg"), 3.0);
    }

    #[test]
    fn denoise_untouched_without_source_image() {
        let instance = apply(&t2i(), &request()).unwrap();
        assert_eq!(field(&instance, "3", "denoise"), 1.0);
    }

    #[test]
    fn source_image_without_loader_is_unsupported() {
        let req = request().with_source_image(SourceImage::url("https://x/a.png"), Some(0.5));
        assert_matches!(
            apply(&t2i(), &req),
            Err(MutationError::UnsupportedGraphFeature { slot: Slot::InputImage, role: NodeRole::ImageLoader, .. })
        );
    }

    #[test]
    fn mask_without_mask_loader_is_unsupported() {
        let req = request()
            .with_source_image(SourceImage::url("https://x/a.png"), None)
            .with_mask_image(SourceImage::url("https://x/m.png"));
        assert_matches!(
            apply(&i2i(), &req),
            Err(MutationError::UnsupportedGraphFeature { slot: Slot::InputMask, .. })
        );
    }

    #[test]
    fn image_to_image_binds_upload_and_mode() {
        let req = request().with_source_image(SourceImage::inline(vec![1, 2]), Some(0.4));
        let mut instance = apply(&i2i(), &req).unwrap();
        assert_eq!(field(&instance, "3", "denoise").as_f64().unwrap() as f32, 0.4);
        assert_eq!(field(&instance, "12", "value"), MODE_IMAGE_TO_IMAGE);
        assert_eq!(field(&instance, "13", "guidance").as_f64().unwrap() as f32, 3.5);
        assert!(instance.has_unbound_uploads());
        assert_eq!(field(&instance, "10", "image"), "example.png");

        instance.bind_upload(Slot::InputImage, "upload_123.png").unwrap();
        assert!(!instance.has_unbound_uploads());
        assert_eq!(field(&instance, "10", "image"), "upload_123.png");
    }

    #[test]
    fn text_mode_switch_without_image() {
        let instance = apply(&i2i(), &request()).unwrap();
        assert_eq!(field(&instance, "12", "value"), MODE_TEXT_TO_IMAGE);
        assert!(instance.uploads.is_empty());
    }

    #[test]
    fn mode_switch_prefers_any_switch_over_numeric_primitive() {
        let mut raw = t2i_json();
        raw["10"] = json!({ "class_type": "LoadImage", "inputs": { "image": "example.png" } });
        raw["20"] = json!({ "class_type": "Primitive", "inputs": { "value": 30 } });
        raw["21"] = json!({ "class_type": "AnySwitch", "inputs": { "value": "T2I" } });
        let template = GraphTemplate::parse("switched", &raw).unwrap();

        let req = request().with_source_image(SourceImage::url("https://x/a.png"), None);
        let instance = apply(&template, &req).unwrap();
        assert_eq!(field(&instance, "21", "value"), MODE_IMAGE_TO_IMAGE);
        assert_eq!(field(&instance, "20", "value"), 30);
    }

    #[test]
    fn mode_switch_never_adds_or_retypes_fields() {
        let mut raw = t2i_json();
        raw["20"] = json!({ "class_type": "Primitive", "inputs": { "value": 30 } });
        raw["21"] = json!({ "class_type": "Primitive", "inputs": {} });
        let template = GraphTemplate::parse("primitives", &raw).unwrap();

        let instance = apply(&template, &request()).unwrap();
        assert_eq!(field(&instance, "20", "value"), 30);
        assert!(!instance.graph.node("21").unwrap().has_field("value"));
    }

    #[test]
    fn bind_without_pending_upload_fails() {
        let mut instance = apply(&t2i(), &request()).unwrap();
        assert_matches!(
            instance.bind_upload(Slot::InputImage, "x.png"),
            Err(MutationError::NoPendingUpload { .. })
        );
    }

    #[test]
    fn sdxl_encoder_gets_both_prompt_fields() {
        let raw = json!({
            "1": { "class_type": "CLIPTextEncodeSDXL", "inputs": { "text_g": "", "text_l": "" } },
            "2": { "class_type": "KSamplerAdvanced", "inputs": { "noise_seed": 0, "positive": ["1", 0] } }
        });
        let template = GraphTemplate::parse("sdxl", &raw).unwrap();
        let instance = apply(&template, &request()).unwrap();
        assert_eq!(field(&instance, "1", "text_g"), "a red cube on a table");
        assert_eq!(field(&instance, "1", "text_l"), "a red cube on a table");
        assert_eq!(field(&instance, "2", "noise_seed"), 7);
        assert!(!instance.graph.node("1").unwrap().has_field("text"));
    }

    #[test]
    fn random_seed_is_drawn_when_absent() {
        let mut req = request();
        req.seed = None;
        let instance = apply(&t2i(), &req).unwrap();
        assert_eq!(field(&instance, "3", "seed"), instance.seed());
    }
}
