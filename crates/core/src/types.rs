/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a registered generation backend, e.g. `"comfyui"`.
pub type ProviderId = String;
