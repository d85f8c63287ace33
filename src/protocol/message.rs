use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Error, Result};

/// RPC request carried in an encrypted packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request id assigned by the outbound transport
    pub id: u32,
    /// Method name, e.g. `get_prop`
    pub method: String,
    /// Positional parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Error object a device returns instead of a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// RPC response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response<T = Value> {
    /// Id of the request this answers
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl<T> Response<T> {
    /// Successful response
    pub fn ok(id: u32, result: T) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Unwraps the result, surfacing a device-reported error
    pub fn into_result(self) -> Result<T> {
        if let Some(err) = self.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        self.result
            .ok_or_else(|| Error::format(format!("Response {} carries no result", self.id)))
    }
}

/// Just enough of a response to correlate it with a pending call
#[derive(Debug, Deserialize)]
pub(crate) struct ResponseId {
    pub id: u32,
}
