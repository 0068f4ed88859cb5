//! Messages exchanged between the host session and its worker.
//!
//! The contract is transport-agnostic; in-process the values travel over
//! channels, but both enums serialize to tagged JSON so the same shapes can
//! cross a process boundary.

use serde::{Deserialize, Serialize};

use crate::core::modules::ModuleMap;
use crate::core::types::EvalOutput;

/// Correlation id, unique per outstanding request within one session.
pub type RequestId = u64;

/// Host → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxRequest {
    Init,
    Eval {
        id: RequestId,
        code: String,
    },
    EvalModule {
        id: RequestId,
        entry: String,
        modules: ModuleMap,
    },
}

impl SandboxRequest {
    pub fn id(&self) -> Option<RequestId> {
        match self {
            SandboxRequest::Init => None,
            SandboxRequest::Eval { id, .. } | SandboxRequest::EvalModule { id, .. } => Some(*id),
        }
    }
}

/// Worker → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxResponse {
    Ready,
    /// The engine failed to initialize; the worker keeps answering requests
    /// with errors.
    InitFailed {
        message: String,
    },
    Result {
        id: RequestId,
        payload: EvalOutput,
    },
    Error {
        id: RequestId,
        message: String,
        logs: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape_is_tagged() {
        let request = SandboxRequest::EvalModule {
            id: 7,
            entry: "main.js".to_string(),
            modules: ModuleMap::normalize([("./main.js", "'use strict';")]),
        };
        assert_eq!(
            serde_json::to_value(&request).expect("serialize"),
            json!({
                "type": "eval_module",
                "id": 7,
                "entry": "main.js",
                "modules": {"main.js": "'use strict';"}
            })
        );
        assert_eq!(request.id(), Some(7));
        assert_eq!(SandboxRequest::Init.id(), None);
    }

    #[test]
    fn error_response_carries_logs() {
        let response: SandboxResponse = serde_json::from_value(json!({
            "type": "error",
            "id": 3,
            "message": "boom",
            "logs": ["before"]
        }))
        .expect("deserialize");
        assert_eq!(
            response,
            SandboxResponse::Error {
                id: 3,
                message: "boom".to_string(),
                logs: vec!["before".to_string()],
            }
        );
    }
}
