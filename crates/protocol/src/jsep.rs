use std::fmt;

use serde::{Deserialize, Serialize};

/// A JSEP envelope: an SDP offer or answer in transit between a browser and a
/// plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepType,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepType {
    Offer,
    Answer,
}

impl JsepType {
    pub fn is_offer(self) -> bool {
        matches!(self, JsepType::Offer)
    }

    /// Parse the wire-level `type` string; anything but `offer`/`answer` is
    /// rejected by the caller with `JSEP_UNKNOWN_TYPE`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "offer" => Some(JsepType::Offer),
            "answer" => Some(JsepType::Answer),
            _ => None,
        }
    }
}

impl fmt::Display for JsepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsepType::Offer => write!(f, "offer"),
            JsepType::Answer => write!(f, "answer"),
        }
    }
}
