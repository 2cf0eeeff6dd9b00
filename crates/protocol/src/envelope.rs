use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ErrorCode};
use crate::jsep::{Jsep, JsepType};

/// A parsed control request: the `janus` verb plus the optional elements the
/// individual commands consume. Scope validation (which verb is legal at which
/// path depth) is the dispatcher's job.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub verb: String,
    pub transaction: String,
    pub plugin: Option<String>,
    pub body: Option<Value>,
    pub jsep: Option<Jsep>,
}

impl Request {
    /// Parse a POST body into a `Request`, mapping every malformation onto
    /// its protocol error code.
    pub fn parse(raw: &[u8]) -> Result<Self, ApiError> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| {
            ApiError::with_reason(
                ErrorCode::InvalidJson,
                format!("Invalid JSON (line {}, column {})", e.line(), e.column()),
            )
        })?;
        let obj = value.as_object().ok_or_else(|| {
            ApiError::with_reason(ErrorCode::InvalidJsonObject, "Request is not a JSON object")
        })?;

        let transaction = match obj.get("transaction") {
            Some(Value::String(t)) => t.clone(),
            Some(_) => {
                return Err(ApiError::with_reason(
                    ErrorCode::InvalidJsonObject,
                    "transaction is not a string",
                ));
            }
            None => {
                return Err(ApiError::with_reason(
                    ErrorCode::MissingMandatoryElement,
                    "Missing mandatory element (transaction)",
                ));
            }
        };

        let verb = match obj.get("janus") {
            Some(Value::String(v)) => v.clone(),
            Some(_) => {
                return Err(ApiError::with_reason(
                    ErrorCode::InvalidJsonObject,
                    "janus is not a string",
                ));
            }
            None => {
                return Err(ApiError::with_reason(
                    ErrorCode::MissingRequest,
                    "Missing mandatory element (janus)",
                ));
            }
        };

        let plugin = match obj.get("plugin") {
            Some(Value::String(p)) => Some(p.clone()),
            Some(_) => {
                return Err(ApiError::with_reason(
                    ErrorCode::InvalidJsonObject,
                    "plugin is not a string",
                ));
            }
            None => None,
        };

        let body = match obj.get("body") {
            Some(b @ Value::Object(_)) => Some(b.clone()),
            Some(_) => {
                return Err(ApiError::with_reason(
                    ErrorCode::InvalidJsonObject,
                    "body is not a JSON object",
                ));
            }
            None => None,
        };

        let jsep = match obj.get("jsep") {
            Some(Value::Object(j)) => Some(parse_jsep(j)?),
            Some(_) => {
                return Err(ApiError::with_reason(
                    ErrorCode::InvalidJsonObject,
                    "jsep is not a JSON object",
                ));
            }
            None => None,
        };

        Ok(Request {
            verb,
            transaction,
            plugin,
            body,
            jsep,
        })
    }
}

fn parse_jsep(obj: &serde_json::Map<String, Value>) -> Result<Jsep, ApiError> {
    let kind = match obj.get("type") {
        Some(Value::String(t)) => JsepType::parse(t).ok_or_else(|| {
            ApiError::with_reason(ErrorCode::JsepUnknownType, format!("Unknown JSEP type '{t}'"))
        })?,
        Some(_) => {
            return Err(ApiError::with_reason(
                ErrorCode::InvalidJsonObject,
                "jsep.type is not a string",
            ));
        }
        None => {
            return Err(ApiError::with_reason(
                ErrorCode::MissingMandatoryElement,
                "Missing mandatory element (jsep.type)",
            ));
        }
    };
    let sdp = match obj.get("sdp") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(ApiError::with_reason(
                ErrorCode::InvalidJsonObject,
                "jsep.sdp is not a string",
            ));
        }
        None => {
            return Err(ApiError::with_reason(
                ErrorCode::MissingMandatoryElement,
                "Missing mandatory element (jsep.sdp)",
            ));
        }
    };
    Ok(Jsep { kind, sdp })
}

/// The opaque plugin payload inside an asynchronous event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginData {
    pub plugin: String,
    pub data: Value,
}

/// The numeric code + reason pair inside an error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub reason: String,
}

/// Every reply the gateway emits, tagged on the `janus` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "janus", rename_all = "snake_case")]
pub enum Reply {
    Success {
        transaction: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Ack {
        transaction: String,
    },
    Event {
        sender: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction: Option<String>,
        plugindata: PluginData,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep>,
    },
    ServerInfo {
        transaction: String,
        name: String,
        version: u32,
        version_string: String,
        plugins: Value,
    },
    Keepalive,
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction: Option<String>,
        error: ErrorBody,
    },
}

impl Reply {
    pub fn success(transaction: impl Into<String>, data: Value) -> Self {
        Reply::Success {
            transaction: transaction.into(),
            data: Some(data),
        }
    }

    pub fn ack(transaction: impl Into<String>) -> Self {
        Reply::Ack {
            transaction: transaction.into(),
        }
    }

    pub fn event(
        sender: u64,
        transaction: Option<String>,
        plugin: impl Into<String>,
        data: Value,
        jsep: Option<Jsep>,
    ) -> Self {
        Reply::Event {
            sender,
            transaction,
            plugindata: PluginData {
                plugin: plugin.into(),
                data,
            },
            jsep,
        }
    }

    pub fn error(err: &ApiError, transaction: Option<String>) -> Self {
        Reply::Error {
            transaction,
            error: ErrorBody {
                code: err.code.code(),
                reason: err.reason.clone(),
            },
        }
    }
}
