//! Recognized sandbox ops.
//!
//! A [`SandboxOp`] is the only effect a script can have on the host. Values
//! coming out of the engine are matched against the four shapes through serde's
//! tagged-enum parsing; anything that does not deserialize is simply not an op.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recognized mutation request, tagged by its `op` field.
///
/// ```json
/// {"op": "setRule", "path": "physics.gravity", "value": 50}
/// {"op": "setAbility", "name": "doubleJump", "active": true}
/// {"op": "removeEntities", "filter": {"kind": "coin"}}
/// {"op": "emit", "payload": {"event": "banner", "text": "hi"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum SandboxOp {
    SetRule { path: String, value: f64 },
    SetAbility { name: String, active: bool },
    RemoveEntities { filter: Value },
    Emit { payload: Value },
}

impl SandboxOp {
    /// Structurally match a JSON value against the recognized shapes.
    ///
    /// Returns `None` for unrecognized shapes; dropping them is not an error.
    pub fn recognize(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let op: SandboxOp = serde_json::from_value(value.clone()).ok()?;
        match &op {
            SandboxOp::SetRule { path, value } if path.is_empty() || !value.is_finite() => None,
            SandboxOp::SetAbility { name, .. } if name.is_empty() => None,
            _ => Some(op),
        }
    }

    /// Stable label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            SandboxOp::SetRule { .. } => "setRule",
            SandboxOp::SetAbility { .. } => "setAbility",
            SandboxOp::RemoveEntities { .. } => "removeEntities",
            SandboxOp::Emit { .. } => "emit",
        }
    }
}

/// Collect the declarative `ops` array of a program's completion value.
///
/// Only a plain object carrying an `ops` array contributes; unrecognized
/// entries are skipped and the remaining ones keep their array order.
pub fn declared_ops(output: &Value) -> Vec<SandboxOp> {
    match output.get("ops") {
        Some(Value::Array(entries)) if output.is_object() => {
            entries.iter().filter_map(SandboxOp::recognize).collect()
        }
        _ => Vec::new(),
    }
}
