use crate::error::WebrtcError;
use myfi_protocol::{IceCandidate, SdpKind, SessionDescription};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub(crate) const PEER_EVENTS_CAPACITY: usize = 64;
pub(crate) const WEBRTC_CHANNELS: u16 = 1;
pub(crate) const WEBRTC_TRACK_ID: &str = "audio";
pub(crate) const WEBRTC_TRACK_STREAM_ID: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
            ],
        }
    }
}

pub(crate) trait IntoRtc<T> {
    fn into_rtc(self) -> T;
}

impl IntoRtc<RTCConfiguration> for IceConfig {
    fn into_rtc(self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .into_iter()
                .map(|server| RTCIceServer {
                    urls: server.urls,
                    username: server.username.unwrap_or_default(),
                    credential: server.credential.unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl IntoRtc<RTCIceCandidateInit> for IceCandidate {
    fn into_rtc(self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_m_line_index,
            username_fragment: self.username_fragment,
        }
    }
}

pub(crate) fn candidate_from_rtc(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

pub(crate) fn description_to_rtc(
    desc: SessionDescription,
) -> Result<RTCSessionDescription, WebrtcError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(WebrtcError::InvalidSessionDescription(
                "rollback is not supported".to_string(),
            ));
        }
    };
    rtc.map_err(|err| WebrtcError::InvalidSessionDescription(err.to_string()))
}

pub(crate) fn description_from_rtc(
    desc: RTCSessionDescription,
) -> Result<SessionDescription, WebrtcError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(WebrtcError::InvalidSessionDescription(
                "unspecified sdp type".to_string(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::{assert_eq, assert_matches};

    #[test]
    fn default_ice_servers() {
        let rtc: RTCConfiguration = IceConfig::default().into_rtc();
        let urls: Vec<_> = rtc
            .ice_servers
            .iter()
            .flat_map(|s| s.urls.iter().cloned())
            .collect();
        assert_eq!(
            urls,
            vec![
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
                "stun:stun2.l.google.com:19302",
            ]
        );
    }

    #[test]
    fn candidate_fields_are_carried_over() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        let rtc: RTCIceCandidateInit = candidate.clone().into_rtc();
        assert_eq!(rtc.sdp_mline_index, Some(0));
        assert_eq!(candidate_from_rtc(rtc), candidate);
    }

    #[test]
    fn rollback_is_rejected() {
        let desc = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert_matches!(
            description_to_rtc(desc),
            Err(WebrtcError::InvalidSessionDescription(_))
        );
    }
}
