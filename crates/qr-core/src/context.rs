//! # Request context
//!
//! The decoded wire envelope: one client submission carrying a batch of
//! pipeline strings plus the diff-tracking knobs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client-chosen correlation id, echoed back on the reply.
    #[serde(default)]
    pub request_id: String,

    /// The pipeline strings to execute.
    #[serde(default)]
    pub queries: Vec<String>,

    /// When true, the reply carries diff metadata.
    #[serde(default)]
    pub diffs: bool,

    /// The last diff tag the client saw; deltas are pulled from here.
    #[serde(default)]
    pub diff_tag: String,

    /// Restrict reported deltas to these record keys.
    #[serde(default)]
    pub diff_watch: Vec<String>,

    /// When true, skip the JSON-shape layer and write raw replies.
    #[serde(default)]
    pub no_json: bool,
}
