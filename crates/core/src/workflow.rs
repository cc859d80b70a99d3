//! Node-graph model for renderer templates.
//!
//! Templates use the renderer's API format: a JSON object keyed by node id
//! where each value carries a `class_type` and an `inputs` mapping. Inputs
//! are either literals or `[node_id, output_index]` references to another
//! node's output.
//!
//! ```json
//! {
//!   "3": { "class_type": "KSampler", "inputs": { "seed": 42, "positive": ["6", 0] } },
//!   "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "a cat" } }
//! }
//! ```
//!
//! Parsing assigns every node a [`NodeRole`] and validates the structure:
//! at least one sampler and one positive text encoder, no dangling
//! references, no out-of-range outputs on known classes, no cycles.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Renderer class names
// ---------------------------------------------------------------------------

const TEXT_ENCODER_CLASSES: &[&str] = &[
    "CLIPTextEncode",
    "CLIPTextEncodeSDXL",
    "CLIPTextEncodeSDXLRefiner",
];
const SAMPLER_CLASSES: &[&str] = &["KSampler", "KSamplerAdvanced"];
const LATENT_SOURCE_CLASSES: &[&str] = &["EmptyLatentImage", "EmptySD3LatentImage"];
const IMAGE_LOADER_CLASS: &str = "LoadImage";
const MASK_LOADER_CLASS: &str = "LoadImageMask";
const GUIDANCE_CLASS: &str = "FluxGuidance";
const MODE_SWITCH_CLASSES: &[&str] = &["AnySwitch", "Primitive"];

/// Output counts of the built-in classes templates commonly link to.
/// Links into other classes (custom nodes included) are not range-checked.
const KNOWN_OUTPUT_COUNTS: &[(&str, u64)] = &[
    ("CheckpointLoaderSimple", 3),
    ("CLIPTextEncode", 1),
    ("CLIPTextEncodeSDXL", 1),
    ("CLIPTextEncodeSDXLRefiner", 1),
    ("ConditioningCombine", 1),
    ("EmptyLatentImage", 1),
    ("EmptySD3LatentImage", 1),
    ("FluxGuidance", 1),
    ("KSampler", 1),
    ("KSamplerAdvanced", 1),
    ("LoadImage", 2),
    ("LoadImageMask", 1),
    ("VAEDecode", 1),
    ("VAEEncode", 1),
];

fn output_count(class_type: &str) -> Option<u64> {
    KNOWN_OUTPUT_COUNTS
        .iter()
        .find(|(class, _)| *class == class_type)
        .map(|(_, count)| *count)
}

/// Sampler inputs that carry conditioning, in polarity order.
const POSITIVE_INPUT: &str = "positive";
const NEGATIVE_INPUT: &str = "negative";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Graph JSON must be an object keyed by node id")]
    NotAnObject,

    #[error("Graph must contain at least one node")]
    Empty,

    #[error("Node '{0}' is missing required 'class_type' field")]
    MissingClassType(String),

    #[error("Node '{0}' has non-object 'inputs'")]
    InvalidInputs(String),

    #[error("Graph has no {0} node")]
    MissingRole(NodeRole),

    #[error("Node '{node}' input '{input}' references missing node '{target}'")]
    DanglingLink {
        node: String,
        input: String,
        target: String,
    },

    #[error("Node '{node}' input '{input}' references output {output} of '{target}' ({class_type} has {available})")]
    MissingOutput {
        node: String,
        input: String,
        target: String,
        class_type: String,
        output: u64,
        available: u64,
    },

    #[error("Graph contains a reference cycle through node '{0}'")]
    Cycle(String),
}

// ---------------------------------------------------------------------------
// Roles and values
// ---------------------------------------------------------------------------

/// Semantic function of a node, independent of its renderer class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    PositiveTextEncoder,
    NegativeTextEncoder,
    Sampler,
    LatentSource,
    ImageLoader,
    MaskLoader,
    Guidance,
    ModeSwitch,
    Other,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NodeRole::PositiveTextEncoder => "positive text-encoder",
            NodeRole::NegativeTextEncoder => "negative text-encoder",
            NodeRole::Sampler => "sampler",
            NodeRole::LatentSource => "latent-source",
            NodeRole::ImageLoader => "image-loader",
            NodeRole::MaskLoader => "mask-loader",
            NodeRole::Guidance => "guidance",
            NodeRole::ModeSwitch => "mode-switch",
            NodeRole::Other => "other",
        };
        f.write_str(label)
    }
}

pub fn is_text_encoder_class(class_type: &str) -> bool {
    TEXT_ENCODER_CLASSES.contains(&class_type)
}

/// Role implied by the class name alone. Text encoders come back as
/// `PositiveTextEncoder` until polarity is resolved against the samplers.
fn role_for_class(class_type: &str) -> NodeRole {
    if is_text_encoder_class(class_type) {
        NodeRole::PositiveTextEncoder
    } else if SAMPLER_CLASSES.contains(&class_type) {
        NodeRole::Sampler
    } else if LATENT_SOURCE_CLASSES.contains(&class_type) {
        NodeRole::LatentSource
    } else if class_type == IMAGE_LOADER_CLASS {
        NodeRole::ImageLoader
    } else if class_type == MASK_LOADER_CLASS {
        NodeRole::MaskLoader
    } else if class_type == GUIDANCE_CLASS {
        NodeRole::Guidance
    } else if MODE_SWITCH_CLASSES.contains(&class_type) {
        NodeRole::ModeSwitch
    } else {
        NodeRole::Other
    }
}

/// A node input value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Literal(Value),
    Link { node: String, output: u64 },
}

impl FieldValue {
    fn from_json(value: &Value) -> Self {
        if let Some([source, output]) = value.as_array().map(Vec::as_slice) {
            let node = match source {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) if n.is_u64() => Some(n.to_string()),
                _ => None,
            };
            if let (Some(node), Some(output)) = (node, output.as_u64()) {
                return FieldValue::Link { node, output };
            }
        }
        FieldValue::Literal(value.clone())
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Literal(value) => value.clone(),
            FieldValue::Link { node, output } => json!([node, output]),
        }
    }

    pub fn as_link(&self) -> Option<&str> {
        match self {
            FieldValue::Link { node, .. } => Some(node),
            FieldValue::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            FieldValue::Literal(value) => Some(value),
            FieldValue::Link { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes and templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub class_type: String,
    pub role: NodeRole,
    pub inputs: BTreeMap<String, FieldValue>,
}

impl GraphNode {
    pub fn has_field(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    pub fn literal(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(FieldValue::as_literal)
    }

    pub fn set_literal(&mut self, name: &str, value: Value) {
        self.inputs
            .insert(name.to_string(), FieldValue::Literal(value));
    }

    fn links(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inputs
            .iter()
            .filter_map(|(input, value)| value.as_link().map(|target| (input.as_str(), target)))
    }
}

/// A validated, immutable graph template.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphTemplate {
    pub name: String,
    /// Nodes in template order.
    pub nodes: Vec<GraphNode>,
}

/// Numeric ids ascending, then everything else lexicographically.
fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

impl GraphTemplate {
    /// Parse and validate a template from API-format JSON.
    pub fn parse(name: impl Into<String>, json: &Value) -> Result<Self, GraphError> {
        let obj = json.as_object().ok_or(GraphError::NotAnObject)?;
        if obj.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut nodes = Vec::with_capacity(obj.len());
        for (id, node_value) in obj {
            let class_type = node_value
                .get("class_type")
                .and_then(Value::as_str)
                .ok_or_else(|| GraphError::MissingClassType(id.clone()))?
                .to_string();

            let inputs = match node_value.get("inputs") {
                None => BTreeMap::new(),
                Some(Value::Object(map)) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                    .collect(),
                Some(_) => return Err(GraphError::InvalidInputs(id.clone())),
            };

            nodes.push(GraphNode {
                id: id.clone(),
                role: role_for_class(&class_type),
                class_type,
                inputs,
            });
        }
        nodes.sort_by(|a, b| compare_node_ids(&a.id, &b.id));

        let mut template = GraphTemplate {
            name: name.into(),
            nodes,
        };
        template.check_links()?;
        template.check_acyclic()?;
        template.resolve_polarity();
        template.check_required_roles()?;
        Ok(template)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn nodes_with_role(&self, role: NodeRole) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn has_role(&self, role: NodeRole) -> bool {
        self.nodes.iter().any(|n| n.role == role)
    }

    /// Serialize back into the renderer's API format.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for node in &self.nodes {
            let inputs: Map<String, Value> = node
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            out.insert(
                node.id.clone(),
                json!({ "class_type": node.class_type, "inputs": inputs }),
            );
        }
        Value::Object(out)
    }

    fn check_links(&self) -> Result<(), GraphError> {
        let by_id: HashMap<&str, &GraphNode> =
            self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        for node in &self.nodes {
            for (input, value) in &node.inputs {
                let FieldValue::Link { node: target, output } = value else {
                    continue;
                };
                let Some(source) = by_id.get(target.as_str()) else {
                    return Err(GraphError::DanglingLink {
                        node: node.id.clone(),
                        input: input.clone(),
                        target: target.clone(),
                    });
                };
                if let Some(available) = output_count(&source.class_type) {
                    if *output >= available {
                        return Err(GraphError::MissingOutput {
                            node: node.id.clone(),
                            input: input.clone(),
                            target: target.clone(),
                            class_type: source.class_type.clone(),
                            output: *output,
                            available,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a GraphNode>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), GraphError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(GraphError::Cycle(id.to_string())),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(node) = by_id.get(id).copied() {
                for (_, target) in node.links() {
                    visit(target, by_id, marks)?;
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let by_id: HashMap<&str, &GraphNode> =
            self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut marks = HashMap::new();
        for node in &self.nodes {
            visit(&node.id, &by_id, &mut marks)?;
        }
        Ok(())
    }

    /// Follow a conditioning link upstream until a text encoder is reached.
    fn trace_encoder(&self, start: &str, input_name: &str) -> Option<String> {
        let mut current = start.to_string();
        let mut seen = HashSet::new();
        while seen.insert(current.clone()) {
            let node = self.node(&current)?;
            if is_text_encoder_class(&node.class_type) {
                return Some(current);
            }
            let next = node
                .inputs
                .get(input_name)
                .and_then(FieldValue::as_link)
                .or_else(|| {
                    node.inputs
                        .iter()
                        .filter(|(name, _)| name.starts_with("conditioning"))
                        .find_map(|(_, value)| value.as_link())
                })?;
            current = next.to_string();
        }
        None
    }

    fn resolve_polarity(&mut self) {
        let mut positive = HashSet::new();
        let mut negative = HashSet::new();

        for sampler in self.nodes.iter().filter(|n| n.role == NodeRole::Sampler) {
            for (input, set) in [(POSITIVE_INPUT, &mut positive), (NEGATIVE_INPUT, &mut negative)] {
                if let Some(start) = sampler.inputs.get(input).and_then(FieldValue::as_link) {
                    if let Some(encoder) = self.trace_encoder(start, input) {
                        set.insert(encoder);
                    }
                }
            }
        }

        let mut have_positive = !positive.is_empty();
        let mut have_negative = !negative.is_empty();
        for node in &mut self.nodes {
            if !is_text_encoder_class(&node.class_type) {
                continue;
            }
            node.role = if positive.contains(&node.id) {
                NodeRole::PositiveTextEncoder
            } else if negative.contains(&node.id) {
                NodeRole::NegativeTextEncoder
            } else if !have_positive {
                have_positive = true;
                NodeRole::PositiveTextEncoder
            } else if !have_negative {
                have_negative = true;
                NodeRole::NegativeTextEncoder
            } else {
                NodeRole::Other
            };
        }
    }

    fn check_required_roles(&self) -> Result<(), GraphError> {
        for role in [NodeRole::Sampler, NodeRole::PositiveTextEncoder] {
            if !self.has_role(role) {
                return Err(GraphError::MissingRole(role));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Text-to-image graph where the negative encoder precedes the positive
    /// one in id order, so polarity must come from the sampler links.
    pub(crate) fn t2i_json() -> Value {
        json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": 1, "steps": 20, "cfg": 8.0, "denoise": 1.0,
                    "model": ["4", 0], "positive": ["7", 0],
                    "negative": ["6", 0], "latent_image": ["5", 0]
                }
            },
            "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "model.safetensors" } },
            "5": { "class_type": "EmptyLatentImage", "inputs": { "width": 1024, "height": 1024, "batch_size": 1 } },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "ugly", "clip": ["4", 1] } },
            "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "placeholder", "clip": ["4", 1] } },
            "8": { "class_type": "VAEDecode", "inputs": { "samples": ["3", 0], "vae": ["4", 2] } },
            "9": { "class_type": "SaveImage", "inputs": { "images": ["8", 0], "filename_prefix": "out" } }
        })
    }

    #[test]
    fn parses_nodes_in_numeric_order() {
        let mut raw = t2i_json();
        raw["10"] = json!({ "class_type": "PreviewImage", "inputs": { "images": ["8", 0] } });
        raw["aux"] = json!({ "class_type": "Note", "inputs": {} });
        let template = GraphTemplate::parse("t2i", &raw).unwrap();
        let ids: Vec<&str> = template.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["3", "4", "5", "6", "7", "8", "9", "10", "aux"]);
    }

    #[test]
    fn polarity_follows_sampler_links() {
        let template = GraphTemplate::parse("t2i", &t2i_json()).unwrap();
        assert_eq!(template.node("7").unwrap().role, NodeRole::PositiveTextEncoder);
        assert_eq!(template.node("6").unwrap().role, NodeRole::NegativeTextEncoder);
    }

    #[test]
    fn polarity_traces_through_conditioning_nodes() {
        let mut raw = t2i_json();
        raw["3"]["inputs"]["positive"] = json!(["20", 0]);
        raw["20"] = json!({
            "class_type": "ConditioningCombine",
            "inputs": { "conditioning_1": ["7", 0], "conditioning_2": ["7", 0] }
        });
        let template = GraphTemplate::parse("t2i", &raw).unwrap();
        assert_eq!(template.node("7").unwrap().role, NodeRole::PositiveTextEncoder);
        assert_eq!(template.node("6").unwrap().role, NodeRole::NegativeTextEncoder);
    }

    #[test]
    fn unlinked_encoders_fall_back_to_template_order() {
        let raw = json!({
            "1": { "class_type": "CLIPTextEncode", "inputs": { "text": "a" } },
            "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "b" } },
            "3": { "class_type": "CLIPTextEncode", "inputs": { "text": "c" } },
            "4": { "class_type": "KSampler", "inputs": { "seed": 0 } }
        });
        let template = GraphTemplate::parse("loose", &raw).unwrap();
        assert_eq!(template.node("1").unwrap().role, NodeRole::PositiveTextEncoder);
        assert_eq!(template.node("2").unwrap().role, NodeRole::NegativeTextEncoder);
        assert_eq!(template.node("3").unwrap().role, NodeRole::Other);
    }

    #[test]
    fn classifies_known_classes() {
        let raw = json!({
            "1": { "class_type": "CLIPTextEncodeSDXL", "inputs": { "text_g": "", "text_l": "" } },
            "2": { "class_type": "KSamplerAdvanced", "inputs": { "noise_seed": 0 } },
            "3": { "class_type": "EmptySD3LatentImage", "inputs": {} },
            "4": { "class_type": "LoadImage", "inputs": { "image": "x.png" } },
            "5": { "class_type": "LoadImageMask", "inputs": { "image": "m.png" } },
            "6": { "class_type": "FluxGuidance", "inputs": { "guidance": 3.5 } },
            "7": { "class_type": "AnySwitch", "inputs": { "value": "T2I" } }
        });
        let template = GraphTemplate::parse("mixed", &raw).unwrap();
        let roles: Vec<NodeRole> = template.nodes.iter().map(|n| n.role).collect();
        assert_eq!(
            roles,
            [
                NodeRole::PositiveTextEncoder,
                NodeRole::Sampler,
                NodeRole::LatentSource,
                NodeRole::ImageLoader,
                NodeRole::MaskLoader,
                NodeRole::Guidance,
                NodeRole::ModeSwitch,
            ]
        );
    }

    #[test]
    fn missing_sampler_is_rejected() {
        let raw = json!({ "1": { "class_type": "CLIPTextEncode", "inputs": { "text": "a" } } });
        assert_matches!(
            GraphTemplate::parse("x", &raw),
            Err(GraphError::MissingRole(NodeRole::Sampler))
        );
    }

    #[test]
    fn missing_text_encoder_is_rejected() {
        let raw = json!({ "1": { "class_type": "KSampler", "inputs": {} } });
        assert_matches!(
            GraphTemplate::parse("x", &raw),
            Err(GraphError::MissingRole(NodeRole::PositiveTextEncoder))
        );
    }

    #[test]
    fn dangling_link_is_rejected() {
        let mut raw = t2i_json();
        raw["8"]["inputs"]["vae"] = json!(["42", 2]);
        assert_matches!(
            GraphTemplate::parse("x", &raw),
            Err(GraphError::DanglingLink { target, .. }) if target == "42"
        );
    }

    #[test]
    fn out_of_range_output_is_rejected() {
        let mut raw = t2i_json();
        raw["8"]["inputs"]["vae"] = json!(["4", 5]);
        assert_matches!(
            GraphTemplate::parse("x", &raw),
            Err(GraphError::MissingOutput { target, output: 5, available: 3, .. }) if target == "4"
        );
    }

    #[test]
    fn custom_node_outputs_are_not_range_checked() {
        let mut raw = t2i_json();
        raw["20"] = json!({ "class_type": "CustomUpscaler", "inputs": {} });
        raw["9"]["inputs"]["images"] = json!(["20", 7]);
        assert!(GraphTemplate::parse("x", &raw).is_ok());
    }

    #[test]
    fn cycle_is_rejected() {
        let mut raw = t2i_json();
        raw["4"]["inputs"]["loop"] = json!(["9", 0]);
        assert_matches!(GraphTemplate::parse("x", &raw), Err(GraphError::Cycle(_)));
    }

    #[test]
    fn structural_errors() {
        assert_matches!(GraphTemplate::parse("x", &json!([])), Err(GraphError::NotAnObject));
        assert_matches!(GraphTemplate::parse("x", &json!({})), Err(GraphError::Empty));
        assert_matches!(
            GraphTemplate::parse("x", &json!({ "1": { "inputs": {} } })),
            Err(GraphError::MissingClassType(id)) if id == "1"
        );
        assert_matches!(
            GraphTemplate::parse("x", &json!({ "1": { "class_type": "KSampler", "inputs": 3 } })),
            Err(GraphError::InvalidInputs(_))
        );
    }

    #[test]
    fn json_round_trip_preserves_links() {
        let template = GraphTemplate::parse("t2i", &t2i_json()).unwrap();
        let out = template.to_json();
        assert_eq!(out["3"]["inputs"]["positive"], json!(["7", 0]));
        assert_eq!(out["5"]["inputs"]["width"], json!(1024));
        assert_eq!(out["9"]["class_type"], "SaveImage");
    }

    #[test]
    fn numeric_link_sources_are_normalized() {
        let mut raw = t2i_json();
        raw["8"]["inputs"]["samples"] = json!([3, 0]);
        let template = GraphTemplate::parse("t2i", &raw).unwrap();
        assert_eq!(
            template.node("8").unwrap().inputs["samples"],
            FieldValue::Link { node: "3".into(), output: 0 }
        );
    }
}
