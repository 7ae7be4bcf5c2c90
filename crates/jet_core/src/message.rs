//! Jet message shapes: JSON-RPC-like requests, notifications and replies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{JetError, Result};

/// The `error` member of an error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An inbound message, already decoded from its transport frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Has an id: the sender expects exactly one reply.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// No id: executed, never answered.
    Notification { method: String, params: Value },
    /// A reply to a request the broker forwarded to this peer.
    Response {
        id: Value,
        outcome: std::result::Result<Value, Value>,
    },
}

impl Inbound {
    /// Classify a decoded JSON object.
    pub fn parse(value: Value) -> Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(JetError::InvalidRequest("message is not an object".into()));
        };

        let id = object.remove("id").filter(|id| !id.is_null());
        match object.remove("method") {
            Some(Value::String(method)) => {
                let params = object.remove("params").unwrap_or(Value::Null);
                Ok(match id {
                    Some(id) => Self::Request { id, method, params },
                    None => Self::Notification { method, params },
                })
            }
            Some(_) => Err(JetError::InvalidRequest("method must be a string".into())),
            None => {
                let Some(id) = id else {
                    return Err(JetError::InvalidRequest("missing method and id".into()));
                };
                if let Some(error) = object.remove("error") {
                    Ok(Self::Response {
                        id,
                        outcome: Err(error),
                    })
                } else if let Some(result) = object.remove("result") {
                    Ok(Self::Response {
                        id,
                        outcome: Ok(result),
                    })
                } else {
                    Err(JetError::InvalidRequest("response without result or error".into()))
                }
            }
        }
    }

    /// Pull the id out of a raw message, if it has a usable one. Used to
    /// answer messages that failed to parse.
    pub fn peek_id(value: &Value) -> Option<Value> {
        value.get("id").filter(|id| !id.is_null()).cloned()
    }
}

/// Something the broker hands to a peer's connection for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A single message object.
    Message(Value),
    /// Several messages that must reach the peer as one unit.
    Batch(Vec<Value>),
}

impl Outbound {
    /// Wrap a list of messages, collapsing a one-element batch.
    pub fn from_messages(mut messages: Vec<Value>) -> Self {
        if messages.len() == 1 {
            Self::Message(messages.remove(0))
        } else {
            Self::Batch(messages)
        }
    }

    /// The messages carried, in delivery order.
    pub fn messages(&self) -> &[Value] {
        match self {
            Self::Message(message) => std::slice::from_ref(message),
            Self::Batch(messages) => messages,
        }
    }

    /// Serialize for a text transport. A batch is a JSON array.
    pub fn to_json(&self) -> String {
        match self {
            Self::Message(message) => message.to_string(),
            Self::Batch(messages) => Value::Array(messages.clone()).to_string(),
        }
    }
}

/// `{id, result}`
pub fn result_reply(id: Value, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

/// `{id, error}`
pub fn error_reply(id: Value, error: &JetError) -> Value {
    json!({ "id": id, "error": error.to_error_object() })
}

/// `{method, params}`, plus `id` when the sender expects a reply.
pub fn request(id: Option<Value>, method: &str, params: Value) -> Value {
    let mut object = Map::new();
    if let Some(id) = id {
        object.insert("id".into(), id);
    }
    object.insert("method".into(), Value::String(method.to_string()));
    if !params.is_null() {
        object.insert("params".into(), params);
    }
    Value::Object(object)
}
