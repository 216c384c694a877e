//! Transport encoding of session descriptions.
//!
//! A description travels as base64 of its JSON form (`{"type": .., "sdp": ..}`),
//! which is what browser peers produce from `RTCSessionDescription.toJSON()`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::DialError;

pub fn encode_sdp(description: &RTCSessionDescription) -> Result<String, DialError> {
    let json = serde_json::to_vec(description)
        .map_err(|err| DialError::Codec(format!("encode description: {err}")))?;
    Ok(STANDARD.encode(json))
}

pub fn decode_sdp(encoded: &str) -> Result<RTCSessionDescription, DialError> {
    let json = STANDARD
        .decode(encoded.trim())
        .map_err(|err| DialError::Codec(format!("invalid base64: {err}")))?;
    serde_json::from_slice(&json)
        .map_err(|err| DialError::Codec(format!("decode description: {err}")))
}
