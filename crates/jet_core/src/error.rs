//! Broker error types and their JSON-RPC error objects.

use serde_json::{Value, json};

use crate::message::ErrorObject;

/// JSON-RPC: the message is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC: the method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC: invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC: internal error.
pub const INTERNAL_ERROR: i64 = -32603;
/// The owning peer's handler reported a failure without a structured error.
pub const HANDLER_FAILURE: i64 = -32000;
/// A routed call/set got no response in time.
pub const RESPONSE_TIMEOUT: i64 = -32001;
/// A peer involved in a routed call/set disconnected.
pub const PEER_GONE: i64 = -32002;

/// Errors produced by the registry, the fetch engine and the router.
///
/// None of these are fatal to the broker: each one is turned into the error
/// reply of the single request that caused it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JetError {
    /// An element with this path is already registered.
    #[error("Path already exists: {0}")]
    DuplicatePath(String),

    /// No element is registered under this path.
    #[error("Path not found: {0}")]
    NotFound(String),

    /// The element exists but belongs to another peer.
    #[error("Path {0} is owned by another peer")]
    NotOwner(String),

    /// The peer already has a fetch with this id.
    #[error("Already fetching: {0}")]
    AlreadyFetching(String),

    /// The peer has no fetch with this id.
    #[error("Not fetching: {0}")]
    NotFetching(String),

    /// Parameters are missing or malformed.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The inbound object is not a request, notification or response.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The method name is not served by the broker.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// The owning peer did not answer a routed call/set in time.
    #[error("Response timeout for {path}")]
    ResponseTimeout { path: String },

    /// A peer on either end of a routed call/set went away.
    #[error("Peer gone while routing {path}")]
    PeerGone { path: String },

    /// The owning peer answered a routed call/set with an error.
    #[error("Handler failure: {}", .0.message)]
    HandlerFailure(ErrorObject),

    /// The broker task is no longer running.
    #[error("Broker stopped")]
    Stopped,
}

impl JetError {
    /// Wrap a handler's raw error reply. Structured `{code, message}` errors
    /// are kept as-is, anything else becomes the `data` of a generic failure.
    pub fn handler_failure(raw: Value) -> Self {
        match serde_json::from_value::<ErrorObject>(raw.clone()) {
            Ok(object) => Self::HandlerFailure(object),
            Err(_) => Self::HandlerFailure(ErrorObject {
                code: HANDLER_FAILURE,
                message: "Handler failure".to_string(),
                data: Some(raw),
            }),
        }
    }

    /// The JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::DuplicatePath(_)
            | Self::NotFound(_)
            | Self::NotOwner(_)
            | Self::AlreadyFetching(_)
            | Self::NotFetching(_)
            | Self::InvalidParams(_) => INVALID_PARAMS,
            Self::ResponseTimeout { .. } => RESPONSE_TIMEOUT,
            Self::PeerGone { .. } => PEER_GONE,
            Self::HandlerFailure(object) => object.code,
            Self::Stopped => INTERNAL_ERROR,
        }
    }

    /// Build the error object sent back to the requesting peer.
    pub fn to_error_object(&self) -> ErrorObject {
        if let Self::HandlerFailure(object) = self {
            return object.clone();
        }
        let message = match self.code() {
            INVALID_REQUEST => "Invalid Request",
            METHOD_NOT_FOUND => "Method not found",
            INVALID_PARAMS => "Invalid params",
            RESPONSE_TIMEOUT => "Response Timeout",
            PEER_GONE => "Peer Gone",
            _ => "Internal error",
        };
        let data = match self {
            Self::DuplicatePath(path) => Some(json!({ "pathAlreadyExists": path })),
            Self::NotFound(path) => Some(json!({ "pathNotExists": path })),
            Self::NotOwner(path) => Some(json!({ "notOwner": path })),
            Self::AlreadyFetching(id) => Some(json!({ "alreadyFetching": id })),
            Self::NotFetching(id) => Some(json!({ "notFetching": id })),
            Self::InvalidParams(reason) | Self::InvalidRequest(reason) => {
                Some(json!({ "reason": reason }))
            }
            Self::MethodNotFound(method) => Some(json!({ "method": method })),
            Self::ResponseTimeout { path } | Self::PeerGone { path } => {
                Some(json!({ "path": path }))
            }
            Self::HandlerFailure(_) | Self::Stopped => None,
        };
        ErrorObject {
            code: self.code(),
            message: message.to_string(),
            data,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, JetError>;
