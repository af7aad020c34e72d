//! Wire protocol for the signaling connection.
//!
//! Every frame is a `{"type": ..., "payload": ...}` JSON envelope. The
//! adjacently-tagged enums below are the single source of truth for both
//! directions; the transport never touches untyped JSON.

use crate::models::{CallType, CallerMeta, MessageType};
use serde::{Deserialize, Serialize};

/// An ICE candidate as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// SDP payload routed through the server to the other call participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    pub call_id: String,
    pub target_id: String,
    pub payload: String,
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
        user_id: String,
    },
    SendMessage {
        recipient_id: String,
        content: String,
        #[serde(rename = "type")]
        message_type: MessageType,
    },
    TypingStart {
        recipient_id: String,
    },
    TypingStop {
        recipient_id: String,
    },
    LeaveConversation {
        recipient_id: String,
    },
    CallInitiate {
        recipient_id: String,
        call_type: CallType,
        caller_meta: CallerMeta,
    },
    CallAccept {
        call_id: String,
        caller_id: String,
    },
    CallReject {
        call_id: String,
        caller_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CallEnd {
        call_id: String,
        other_participant_id: String,
    },
    CallTimeout {
        call_id: String,
        recipient_id: String,
    },
    WebrtcOffer(SignalPayload),
    WebrtcAnswer(SignalPayload),
    WebrtcIce {
        call_id: String,
        target_id: String,
        candidate: IceCandidate,
    },
}

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Auth handshake acknowledged; the connection is usable.
    Connected,
    ConnectError {
        message: String,
    },
    /// Synthesized by the transport when the socket closes or errors.
    Disconnected,
    ReceiveMessage {
        sender_id: String,
        recipient_id: String,
        content: String,
        #[serde(rename = "type")]
        message_type: MessageType,
        timestamp: i64,
    },
    /// Best-effort delivery confirmation; bookkeeping only.
    MessageSent {
        recipient_online: bool,
    },
    UserTyping {
        user_id: String,
        is_typing: bool,
    },
    ConversationJoined {
        is_other_user_online: bool,
    },
    UserJoinedConversation {
        connected_users: Vec<String>,
    },
    UserLeftConversation {
        user_id: String,
    },
    /// Server ack of call_initiate, carrying the assigned call id.
    CallInitiated {
        call_id: String,
    },
    CallIncoming {
        call_id: String,
        caller_id: String,
        call_type: CallType,
        caller_meta: CallerMeta,
    },
    CallAccepted {
        call_id: String,
        recipient_id: String,
    },
    CallRejected {
        call_id: String,
        reason: Option<String>,
    },
    CallEnded {
        call_id: String,
    },
    CallTimeout {
        call_id: String,
    },
    WebrtcOffer {
        call_id: String,
        sender_id: String,
        payload: String,
    },
    WebrtcAnswer {
        call_id: String,
        sender_id: String,
        payload: String,
    },
    WebrtcIce {
        call_id: String,
        sender_id: String,
        candidate: IceCandidate,
    },
}

/// Subscription key for the connection manager's wire-event registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Connected,
    ConnectError,
    Disconnected,
    ReceiveMessage,
    MessageSent,
    UserTyping,
    ConversationJoined,
    UserJoinedConversation,
    UserLeftConversation,
    CallInitiated,
    CallIncoming,
    CallAccepted,
    CallRejected,
    CallEnded,
    CallTimeout,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcIce,
}

impl ServerEvent {
    pub fn kind(&self) -> ServerEventKind {
        match self {
            Self::Connected => ServerEventKind::Connected,
            Self::ConnectError { .. } => ServerEventKind::ConnectError,
            Self::Disconnected => ServerEventKind::Disconnected,
            Self::ReceiveMessage { .. } => ServerEventKind::ReceiveMessage,
            Self::MessageSent { .. } => ServerEventKind::MessageSent,
            Self::UserTyping { .. } => ServerEventKind::UserTyping,
            Self::ConversationJoined { .. } => ServerEventKind::ConversationJoined,
            Self::UserJoinedConversation { .. } => ServerEventKind::UserJoinedConversation,
            Self::UserLeftConversation { .. } => ServerEventKind::UserLeftConversation,
            Self::CallInitiated { .. } => ServerEventKind::CallInitiated,
            Self::CallIncoming { .. } => ServerEventKind::CallIncoming,
            Self::CallAccepted { .. } => ServerEventKind::CallAccepted,
            Self::CallRejected { .. } => ServerEventKind::CallRejected,
            Self::CallEnded { .. } => ServerEventKind::CallEnded,
            Self::CallTimeout { .. } => ServerEventKind::CallTimeout,
            Self::WebrtcOffer { .. } => ServerEventKind::WebrtcOffer,
            Self::WebrtcAnswer { .. } => ServerEventKind::WebrtcAnswer,
            Self::WebrtcIce { .. } => ServerEventKind::WebrtcIce,
        }
    }
}
