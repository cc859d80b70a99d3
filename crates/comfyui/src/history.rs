//! Interpretation of `/history/{prompt_id}` payloads.
//!
//! ```json
//! {
//!   "<prompt_id>": {
//!     "outputs": { "9": { "images": [{ "filename": "out_0001.png", "subfolder": "", "type": "output" }] } },
//!     "status": { "status_str": "success", "completed": true, "messages": [] }
//!   }
//! }
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a renderer-side file, as listed in history outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_storage_class")]
    pub storage_class: String,
}

fn default_storage_class() -> String {
    "output".to_string()
}

/// What the renderer's history says about one prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStatus {
    /// Not in history yet, or still executing.
    Pending,
    Succeeded { outputs: Vec<ArtifactRef> },
    Failed { message: String },
}

impl HistoryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HistoryStatus::Pending)
    }
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Declared image outputs, in node-id order.
pub fn collect_outputs(outputs: &Value) -> Vec<ArtifactRef> {
    let Some(map) = outputs.as_object() else {
        return Vec::new();
    };
    let mut nodes: Vec<(&String, &Value)> = map.iter().collect();
    nodes.sort_by(|(a, _), (b, _)| compare_ids(a, b));

    nodes
        .into_iter()
        .filter_map(|(_, node)| node.get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|image| serde_json::from_value::<ArtifactRef>(image.clone()).ok())
        .collect()
}

/// Pull the renderer's exception text out of the status messages.
fn error_message(status: &Value) -> String {
    status
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.as_array())
        .find(|entry| entry.first().and_then(Value::as_str) == Some("execution_error"))
        .and_then(|entry| entry.get(1))
        .and_then(|data| data.get("exception_message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "Renderer reported an execution error".to_string())
}

pub fn parse_history(prompt_id: &str, payload: &Value) -> HistoryStatus {
    let Some(entry) = payload.get(prompt_id) else {
        return HistoryStatus::Pending;
    };

    let outputs = entry
        .get("outputs")
        .map(collect_outputs)
        .unwrap_or_default();

    match entry.get("status") {
        Some(status) => {
            let status_str = status.get("status_str").and_then(Value::as_str);
            let completed = status
                .get("completed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if status_str == Some("error") {
                HistoryStatus::Failed {
                    message: error_message(status),
                }
            } else if completed || status_str == Some("success") {
                HistoryStatus::Succeeded { outputs }
            } else {
                HistoryStatus::Pending
            }
        }
        // Older servers omit status; listed outputs mean the prompt finished.
        None if !outputs.is_empty() => HistoryStatus::Succeeded { outputs },
        None => HistoryStatus::Pending,
    }
}
