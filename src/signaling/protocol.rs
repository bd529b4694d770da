#![forbid(unsafe_code)]

// Signaling protocol - WebSocket envelope types

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One signaling message as carried on the wire.
///
/// Every envelope has `type` (the body tag), `roomId`, `participantId` and
/// `timestamp`; the body contributes the variant-specific fields at the same
/// JSON level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub participant_id: String,
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    /// Builds a server-originated envelope with a fresh timestamp.
    pub fn server(
        room_id: impl Into<String>,
        participant_id: impl Into<String>,
        body: MessageBody,
    ) -> Self {
        Self {
            body,
            room_id: room_id.into(),
            participant_id: participant_id.into(),
            timestamp: now_ms(),
        }
    }

    /// Builds an `error` envelope. Room and participant ids are left empty —
    /// clients correlate errors with their last request, not with a room.
    pub fn error(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self::server(
            "",
            "",
            MessageBody::Error {
                message: message.into(),
                code,
            },
        )
    }
}

/// The closed set of message kinds.
///
/// Tags are kebab-case on the wire (`ice-candidate`, `participant-joined`);
/// fields are camelCase. Unknown tags and missing required fields fail
/// decoding, which the connection handler reports as a protocol error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageBody {
    /// Join a room (or create it as first joiner).
    #[serde(rename_all = "camelCase")]
    Join {
        name: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        is_host: bool,
        #[serde(default)]
        creator_token: Option<String>,
    },
    /// Leave the current room. The socket stays open.
    Leave,
    /// SDP offer, relayed to `targetId`.
    #[serde(rename_all = "camelCase")]
    Offer { target_id: String, sdp: String },
    /// SDP answer, relayed to `targetId`.
    #[serde(rename_all = "camelCase")]
    Answer { target_id: String, sdp: String },
    /// ICE candidate, relayed to `targetId`. The candidate object is opaque
    /// to the server.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_id: String,
        candidate: serde_json::Value,
    },
    /// File transfer offer, relayed to `targetId`.
    #[serde(rename_all = "camelCase")]
    FileOffer {
        target_id: String,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    /// Accept/decline for a file offer, relayed to `targetId`.
    #[serde(rename_all = "camelCase")]
    FileAnswer { target_id: String, accepted: bool },
    /// One base64 chunk of a file, relayed to `targetId`.
    #[serde(rename_all = "camelCase")]
    FileChunk {
        target_id: String,
        chunk: String,
        index: u32,
        total: u32,
    },
    /// Requested video quality for a peer's stream, relayed to `targetId`.
    #[serde(rename_all = "camelCase")]
    QualityChange {
        target_id: String,
        quality: QualityLevel,
    },
    /// Chat message; broadcast to the room and echoed to the sender.
    #[serde(rename_all = "camelCase")]
    Chat {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    /// Media-state delta from a client; the merged state is broadcast.
    #[serde(rename_all = "camelCase")]
    ParticipantUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_muted: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_video_off: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_hand_raised: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_moderator: Option<bool>,
    },
    RaiseHand,
    LowerHand,
    /// Moderator command against `targetId`.
    #[serde(rename_all = "camelCase")]
    ModeratorAction {
        target_id: String,
        action: ModerationAction,
    },
    /// Lock the room (inbound) / room was locked (outbound).
    #[serde(rename_all = "camelCase")]
    RoomLocked {
        #[serde(default)]
        locked_by: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomUnlocked {
        #[serde(default)]
        unlocked_by: String,
    },
    /// Admit a waiting participant (moderator only).
    #[serde(rename_all = "camelCase")]
    AdmitUser { target_id: String },
    /// Reject a waiting participant (moderator only).
    #[serde(rename_all = "camelCase")]
    RejectUser {
        target_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Outbound: a participant joined; `participantId` is the newcomer.
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        name: String,
        is_moderator: bool,
        is_muted: bool,
        is_video_off: bool,
    },
    /// Outbound: `participantId` identifies who left.
    ParticipantLeft,
    /// Outbound: a candidate is waiting; `participantId` carries their id.
    #[serde(rename_all = "camelCase")]
    WaitingRoom { name: String },
    /// Outbound error report.
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl MessageBody {
    /// For relay messages, the peer the envelope is addressed to.
    /// `None` for everything that is not point-to-point.
    pub fn relay_target(&self) -> Option<&str> {
        match self {
            MessageBody::Offer { target_id, .. }
            | MessageBody::Answer { target_id, .. }
            | MessageBody::IceCandidate { target_id, .. }
            | MessageBody::FileOffer { target_id, .. }
            | MessageBody::FileAnswer { target_id, .. }
            | MessageBody::FileChunk { target_id, .. }
            | MessageBody::QualityChange { target_id, .. } => Some(target_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModerationAction {
    Mute,
    Unmute,
    Kick,
    MakeModerator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    High,
    Medium,
    Low,
}

/// Stable error codes clients can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    InvalidPassword,
}
