use thiserror::Error;

/// Protocol-level error codes, reserved as a contiguous range.
///
/// These are carried inside the JSON error envelope; the HTTP status for a
/// protocol error is always 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unknown,
    UsePost,
    MissingRequest,
    InvalidJson,
    InvalidJsonObject,
    MissingMandatoryElement,
    InvalidRequestPath,
    UnknownRequest,
    SessionNotFound,
    HandleNotFound,
    PluginNotFound,
    PluginAttach,
    PluginDetach,
    PluginMessage,
    JsepUnknownType,
    JsepInvalidSdp,
}

impl ErrorCode {
    pub const fn code(self) -> u16 {
        match self {
            ErrorCode::Unknown => 450,
            ErrorCode::UsePost => 451,
            ErrorCode::MissingRequest => 452,
            ErrorCode::InvalidJson => 453,
            ErrorCode::InvalidJsonObject => 454,
            ErrorCode::MissingMandatoryElement => 455,
            ErrorCode::InvalidRequestPath => 456,
            ErrorCode::UnknownRequest => 457,
            ErrorCode::SessionNotFound => 458,
            ErrorCode::HandleNotFound => 459,
            ErrorCode::PluginNotFound => 460,
            ErrorCode::PluginAttach => 461,
            ErrorCode::PluginDetach => 462,
            ErrorCode::PluginMessage => 463,
            ErrorCode::JsepUnknownType => 464,
            ErrorCode::JsepInvalidSdp => 465,
        }
    }

    /// Fallback human-readable reason when the caller has nothing better.
    pub const fn default_reason(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Unknown error",
            ErrorCode::UsePost => "Use POST",
            ErrorCode::MissingRequest => "Missing request",
            ErrorCode::InvalidJson => "Invalid JSON",
            ErrorCode::InvalidJsonObject => "Invalid JSON object",
            ErrorCode::MissingMandatoryElement => "Missing mandatory element",
            ErrorCode::InvalidRequestPath => "Invalid path for this request",
            ErrorCode::UnknownRequest => "Unknown request",
            ErrorCode::SessionNotFound => "Session not found",
            ErrorCode::HandleNotFound => "Handle not found",
            ErrorCode::PluginNotFound => "Plugin not found",
            ErrorCode::PluginAttach => "Error attaching to plugin",
            ErrorCode::PluginDetach => "Error detaching from plugin",
            ErrorCode::PluginMessage => "Error delivering message to plugin",
            ErrorCode::JsepUnknownType => "Unknown JSEP type",
            ErrorCode::JsepInvalidSdp => "Invalid SDP",
        }
    }
}

/// A protocol error: numeric code plus human-readable reason.
///
/// Never fatal to the process; the dispatcher formats it into the JSON error
/// envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (error {number})", number = .code.code())]
pub struct ApiError {
    pub code: ErrorCode,
    pub reason: String,
}

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            reason: code.default_reason().to_string(),
        }
    }

    pub fn with_reason(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl From<ErrorCode> for ApiError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}
