//! Wire frames
//!
//! Every WebSocket text message carries exactly one frame:
//!
//! ```text
//! {"type":"request","id":"<uuid>","route":"shard.pool.acquire","args":["main",3]}
//! {"type":"response","id":"<uuid>","status":"ok","result":["main_…",[0,1,2]]}
//! {"type":"response","id":"<uuid>","status":"error","kind":"no_capacity","message":"…"}
//! ```

use crate::error::BeaconError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// Call of `route` with positional `args`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub route: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Request {
    /// New request with a fresh UUID v4 id
    pub fn new(route: &str, args: Vec<Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            route: route.to_string(),
            args,
        }
    }
}

/// Reply to the request with the same `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        #[serde(default)]
        result: Value,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl Response {
    pub fn ok(id: String, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Ok { result },
        }
    }

    pub fn error(id: String, error: &BeaconError) -> Self {
        Self {
            id,
            outcome: Outcome::Error {
                kind: error.error_type_label().to_string(),
                message: error.to_string(),
            },
        }
    }
}
