//! Batch JSON-RPC wire types
//!
//! The server speaks the bitcoind dialect of JSON-RPC: a batch request is a
//! JSON array of call objects and the reply is a JSON array of result objects,
//! correlated by `id`.
//!
//! - Request element: `{"method": "...", "params": [...], "id": 7}`
//! - Response element: `{"id": 7, "result": ...}` or `{"id": 7, "error": {"code": ..., "message": "..."}}`
//!
//! # Result presence
//!
//! A `"result": null` member is a valid result (several bitcoind methods return
//! null on success). Only a *missing* `result` member is an error, so the field
//! is deserialized with [`deserialize_present`] which keeps the two cases apart.
//!
//! # Example
//!
//! ```
//! use coinrpc_common::protocol::jsonrpc::{RpcRequest, RpcResponse};
//! use serde_json::json;
//!
//! let request = RpcRequest::new("getblockhash", vec![json!(0)], 1);
//! let body = serde_json::to_string(&vec![request]).unwrap();
//! assert_eq!(body, r#"[{"method":"getblockhash","params":[0],"id":1}]"#);
//!
//! let response: RpcResponse = serde_json::from_str(r#"{"id":1,"result":null,"error":null}"#).unwrap();
//! assert_eq!(response.result, Some(json!(null)));
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::error::CoinrpcError;

/// One call inside a batch request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    /// Name of the remote method
    pub method: String,
    /// Positional parameters, order-significant
    pub params: Vec<Value>,
    /// Correlation identifier
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: u64) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }
}

/// One element of a batch response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    /// Identifier of the request this answers (null when the server could
    /// not parse the request)
    #[serde(default)]
    pub id: Option<u64>,
    /// `Some(Value::Null)` when the member is present but null, `None` when absent
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Error object reported by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// Error object inside a response element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    pub code: i64,
    /// bitcoind forks sometimes send `null` or omit the member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC 2.0 error codes
/// Invalid JSON was received by the server
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i64 = -32603;

// bitcoind application codes the facade inspects
/// Invalid, missing or duplicate parameter (e.g. block height out of range)
pub const RPC_INVALID_PARAMETER: i64 = -8;
/// Invalid address or key (e.g. unknown transaction id)
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Create a method not found error (-32601)
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    /// Converts the wire object into the caller-facing error.
    ///
    /// A missing, null or empty message falls back to the code so the error
    /// never displays blank.
    pub fn into_error(self) -> CoinrpcError {
        let message = self
            .message
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| self.code.to_string());
        CoinrpcError::Remote {
            code: self.code,
            message,
        }
    }
}

impl RpcResponse {
    /// Create a success response
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: u64, error: RpcErrorObject) -> Self {
        Self {
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    /// Resolves this element into the value or error the caller sees.
    ///
    /// An error object wins over a result; a missing result is
    /// [`CoinrpcError::MissingResult`].
    pub fn into_result(self) -> Result<Value, CoinrpcError> {
        if let Some(error) = self.error {
            return Err(error.into_error());
        }
        self.result.ok_or(CoinrpcError::MissingResult)
    }
}

/// Deserializes a present member (including `null`) as `Some`.
///
/// Combined with `#[serde(default)]`, an absent member stays `None`.
pub fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
