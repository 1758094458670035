//! Wire envelope for the hub's request/response protocol.
//!
//! Every frame on a hub's transport is one JSON object with these
//! optional fields. Exactly one of `itx`/`otx` is present on a
//! well-formed message; `method` is required alongside `itx`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub itx: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub otx: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    pub fn request(method: impl Into<String>, itx: u32, payload: serde_json::Value) -> Self {
        Self {
            method: Some(method.into()),
            itx: Some(itx),
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn response(otx: u32, payload: serde_json::Value) -> Self {
        Self {
            otx: Some(otx),
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn error_response(otx: u32, error: impl Into<String>) -> Self {
        Self {
            otx: Some(otx),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
