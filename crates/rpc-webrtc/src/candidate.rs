use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::DialError;
use crate::proto::IceCandidate;

/// Converts a locally gathered candidate to its signaling form.
pub fn to_wire(candidate: &RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_mline_index.map(u32::from),
        username_fragment: candidate.username_fragment.clone(),
    }
}

/// Converts a remote candidate received over signaling. A line index that does
/// not fit the engine's representation is a protocol violation.
pub fn from_wire(candidate: &IceCandidate) -> Result<RTCIceCandidateInit, DialError> {
    let sdp_mline_index = candidate
        .sdp_mline_index
        .map(u16::try_from)
        .transpose()
        .map_err(|_| {
            DialError::protocol(format!(
                "candidate line index {:?} out of range",
                candidate.sdp_mline_index
            ))
        })?;
    Ok(RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index,
        username_fragment: candidate.username_fragment.clone(),
    })
}
