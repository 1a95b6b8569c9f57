use serde::{Deserialize, Deserializer, Serialize};

/// Kind of a [`SessionDescription`], matching the `type` values used by browser peers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// A session description exchanged during offer/answer negotiation.
///
/// Serialized the same way a browser serializes an `RTCSessionDescription`, so both native and
/// browser peers can share a relay.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate, in the JSON shape of a browser `RTCIceCandidateInit`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Details about the calling user, attached by the relay to [`SignalingMessage::IncomingCall`].
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub caller_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_avatar: Option<String>,
}

impl CallerInfo {
    /// Name to show for the caller, falling back to the phone number.
    pub fn display_name(&self) -> Option<&str> {
        self.caller_name
            .as_deref()
            .or(self.caller_phone.as_deref())
    }
}

/// Represents a call-control message exchanged between a client and the signaling relay.
///
/// Messages are addressed by user ID. Outgoing messages name the recipient explicitly
/// (`callee_id`, `caller_id`, `recipient_id`, `other_user_id`); the relay resolves the recipient's
/// connection and forwards a corresponding inbound message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Sent by the caller to start a call.
    ///
    /// The relay forwards it to the callee as [`SignalingMessage::IncomingCall`], or answers with
    /// [`SignalingMessage::CallFailed`] if the callee is not connected.
    CallUser {
        /// ID of the user to call.
        callee_id: String,
        /// WebRTC offer created by the caller.
        offer: SessionDescription,
    },
    /// Received by the callee when another user calls.
    IncomingCall {
        /// ID of the calling user.
        caller_id: String,
        #[serde(flatten)]
        caller: CallerInfo,
        /// Call record ID assigned by the relay, if it could create one.
        #[serde(default, deserialize_with = "deserialize_call_id")]
        call_id: Option<String>,
        /// WebRTC offer created by the caller.
        offer: SessionDescription,
    },
    /// Sent by the callee after accepting a call, containing the WebRTC answer.
    AnswerCall {
        /// ID of the calling user.
        caller_id: String,
        /// WebRTC answer based on the received offer.
        answer: SessionDescription,
        /// Call record ID received with the [`SignalingMessage::IncomingCall`].
        call_id: Option<String>,
    },
    /// Received by the caller once the callee answered.
    CallAnswered {
        /// ID of the answering user.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callee_id: Option<String>,
        /// Call record ID assigned by the relay.
        #[serde(default, deserialize_with = "deserialize_call_id")]
        call_id: Option<String>,
        /// WebRTC answer created by the callee.
        answer: SessionDescription,
    },
    /// A trickled ICE candidate. Sent with `recipient_id`, received with `sender_id`.
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        candidate: IceCandidate,
    },
    /// Sent by the callee to decline an incoming call.
    RejectCall {
        /// ID of the calling user.
        caller_id: String,
        /// Call record ID received with the [`SignalingMessage::IncomingCall`].
        call_id: Option<String>,
    },
    /// Received by the caller when the callee declined the call.
    CallRejected {},
    /// Sent by either side to end a call.
    HangUp {
        /// ID of the other participant.
        other_user_id: String,
        /// Call record ID, if one is known.
        call_id: Option<String>,
        /// Duration of the call in whole seconds, `0` if it never became active.
        duration: u64,
    },
    /// Received when the other participant ended the call.
    CallEnded {
        /// ID of the user who ended the call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// Received when the relay could not place or continue the call.
    CallFailed {
        /// Human-readable reason, e.g. `User is offline`.
        reason: String,
    },
}

impl SignalingMessage {
    /// Serializes a [`SignalingMessage`] into a JSON string.
    pub fn serialize(message: &Self) -> serde_json::error::Result<String> {
        serde_json::to_string(message)
    }

    /// Deserializes a JSON string into a [`SignalingMessage`].
    pub fn deserialize(message: &str) -> serde_json::error::Result<Self> {
        serde_json::from_str(message)
    }

    /// Wire name of the message type.
    pub fn message_type(&self) -> &'static str {
        match self {
            SignalingMessage::CallUser { .. } => "call_user",
            SignalingMessage::IncomingCall { .. } => "incoming_call",
            SignalingMessage::AnswerCall { .. } => "answer_call",
            SignalingMessage::CallAnswered { .. } => "call_answered",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::RejectCall { .. } => "reject_call",
            SignalingMessage::CallRejected {} => "call_rejected",
            SignalingMessage::HangUp { .. } => "hang_up",
            SignalingMessage::CallEnded { .. } => "call_ended",
            SignalingMessage::CallFailed { .. } => "call_failed",
        }
    }
}

/// The relay stores call records in a database and forwards their IDs verbatim, which may be
/// numeric or textual depending on the backend.
fn deserialize_call_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawCallId {
        Text(String),
        Number(i64),
    }

    Ok(
        Option::<RawCallId>::deserialize(deserializer)?.map(|raw| match raw {
            RawCallId::Text(id) => id,
            RawCallId::Number(id) => id.to_string(),
        }),
    )
}
