//! Messages exchanged with the signaling service.
//!
//! Everything here is plain serde data. Framing and request correlation live in
//! [`crate::signaling::ws`]; the meaning of each message lives in the exchanges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::IceServer;

/// Status codes carried by error responses and error terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "ok",
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::FailedPrecondition => "failed_precondition",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Wire form of an ICE candidate. Optional fields stay optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Negotiation settings the signaling service advises for its peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisedWebRtcConfig {
    #[serde(default)]
    pub additional_ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalWebRtcConfigResponse {
    #[serde(default)]
    pub config: AdvisedWebRtcConfig,
}

/// Initial request of an offer-side exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub sdp: String,
    #[serde(default)]
    pub disable_trickle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallResponseStage {
    Init { sdp: String },
    Update { candidate: IceCandidate },
}

/// Inbound message of an offer-side exchange. `stage` is `None` when the
/// service sent a shape this client does not understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    pub uuid: String,
    #[serde(default, deserialize_with = "lenient_stage")]
    pub stage: Option<CallResponseStage>,
}

impl CallResponse {
    pub fn init(uuid: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            stage: Some(CallResponseStage::Init { sdp: sdp.into() }),
        }
    }

    pub fn update(uuid: impl Into<String>, candidate: IceCandidate) -> Self {
        Self {
            uuid: uuid.into(),
            stage: Some(CallResponseStage::Update { candidate }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallUpdate {
    Candidate { candidate: IceCandidate },
    Done,
    Error { status: Status },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUpdateRequest {
    pub uuid: String,
    pub update: CallUpdate,
}

impl CallUpdateRequest {
    pub fn is_terminal(&self) -> bool {
        matches!(self.update, CallUpdate::Done | CallUpdate::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerRequestStage {
    Init {
        sdp: String,
        #[serde(default)]
        disable_trickle: bool,
    },
    Update {
        candidate: IceCandidate,
    },
    Done,
    Error {
        status: Status,
    },
}

/// Message the signaling service forwards to an answerer on behalf of a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub uuid: String,
    #[serde(default, deserialize_with = "lenient_stage")]
    pub stage: Option<AnswerRequestStage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerResponseStage {
    Init { sdp: String },
    Update { candidate: IceCandidate },
    Done,
    Error { status: Status },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub uuid: String,
    pub stage: AnswerResponseStage,
}

impl AnswerResponse {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.stage,
            AnswerResponseStage::Done | AnswerResponseStage::Error { .. }
        )
    }
}

// Unknown stage tags decode to `None` instead of failing the whole frame, so
// the exchange can reject them as a protocol violation.
fn lenient_stage<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn unknown_call_stage_decodes_as_none() {
        let response: CallResponse = serde_json::from_value(json!({
            "uuid": "abc",
            "stage": { "type": "renegotiate", "sdp": "x" }
        }))
        .expect("decode");
        assert_eq!(response.uuid, "abc");
        assert!(response.stage.is_none());

        let missing: CallResponse =
            serde_json::from_value(json!({ "uuid": "abc" })).expect("decode");
        assert!(missing.stage.is_none());
    }

    #[test_timeout::timeout]
    fn candidate_omits_absent_fields() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).expect("encode");
        assert_eq!(
            value,
            json!({
                "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                "sdp_mline_index": 0
            })
        );
    }

    #[test_timeout::timeout]
    fn call_update_tags() {
        let request = CallUpdateRequest {
            uuid: "u".into(),
            update: CallUpdate::Error {
                status: Status::new(Code::Canceled, "bye"),
            },
        };
        assert!(request.is_terminal());
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["update"]["type"], "error");
        assert_eq!(value["update"]["status"]["code"], "canceled");
    }

    #[test_timeout::timeout]
    fn status_display() {
        assert_eq!(Status::new(Code::Unimplemented, "").to_string(), "unimplemented");
        assert_eq!(
            Status::new(Code::Internal, "boom").to_string(),
            "internal: boom"
        );
    }
}
