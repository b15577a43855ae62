//! Sync configuration.
//!
//! A single explicit value handed to the [`Transformer`](crate::transform::Transformer)
//! and the [`Reconciler`](crate::reconcile::Reconciler) by whichever driver
//! owns the pipeline. Nothing here is read from process-global state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// What the transform stage does when a row fails to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First bad row fails the whole batch.
    #[default]
    AbortBatch,
    /// Bad rows are recorded on the report; the rest of the batch proceeds.
    ReportAndContinue,
}

/// Configuration for the transform and reconcile stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Column-name separator for nested properties.
    pub path_separator: char,
    /// Namespace of synthesized model references (`"<ns>:<name>;<version>"`).
    pub model_namespace: String,
    /// Version used when the batch carries none.
    pub default_version: String,
    /// Columns whose text is never parsed as JSON.
    pub json_exempt_columns: Vec<String>,
    pub failure_policy: FailurePolicy,
    /// Pre-call delay for twin store calls.
    pub twin_call_delay_ms: u64,
    /// Pre-call delay for relationship store calls.
    pub relationship_call_delay_ms: u64,
    /// Upper bound on an encoded queue message.
    pub max_message_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            path_separator: '.',
            model_namespace: "dtmi".into(),
            default_version: "1".into(),
            json_exempt_columns: vec!["CriteriaFormula".into()],
            failure_policy: FailurePolicy::AbortBatch,
            twin_call_delay_ms: 20,
            relationship_call_delay_ms: 100,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Defaults with both call delays zeroed; convenient for tests and dry runs.
    pub fn without_throttle() -> Self {
        Self { twin_call_delay_ms: 0, relationship_call_delay_ms: 0, ..Self::default() }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn twin_call_delay(&self) -> Duration {
        Duration::from_millis(self.twin_call_delay_ms)
    }

    pub fn relationship_call_delay(&self) -> Duration {
        Duration::from_millis(self.relationship_call_delay_ms)
    }

    pub fn is_json_exempt(&self, column: &str) -> bool {
        self.json_exempt_columns.iter().any(|c| c == column)
    }
}
