//! Data models for Parley

use serde::{Deserialize, Serialize};

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Audio,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Echoed,
    Failed,
}

/// A locally-originated message, inserted optimistically before the server
/// confirms anything about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Client-generated temporary id; the server never sees it.
    pub local_id: String,
    pub message_type: MessageType,
    /// Text content, or the uploaded media URL for image/audio.
    pub content: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub created_at: i64,
    pub delivery: DeliveryState,
}

impl OutboundMessage {
    pub fn new(
        message_type: MessageType,
        content: String,
        sender_id: &str,
        recipient_id: &str,
    ) -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            message_type,
            content,
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            delivery: DeliveryState::Pending,
        }
    }
}

/// A message received from a peer over the live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub timestamp: i64,
}

/// One entry of the conversation log kept by the message pipeline.
#[derive(Debug, Clone)]
pub enum ChatEntry {
    Outbound(OutboundMessage),
    Inbound(InboundMessage),
}

/// A message fetched from the message store service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub timestamp: i64,
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Idle,
    Initiating,
    Ringing,
    Accepted,
    Negotiating,
    Active,
    Ended,
    Rejected,
    TimedOut,
    Failed,
}

impl CallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Rejected | Self::TimedOut | Self::Failed
        )
    }
}

/// One logical call. Exists only while the call is live; terminal transitions
/// tear it down and return the controller to idle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Server-assigned; absent until the initiation ack arrives.
    pub call_id: Option<String>,
    pub call_type: CallType,
    pub caller_id: String,
    pub recipient_id: String,
    pub created_at: i64,
    pub phase: CallPhase,
}

impl CallSession {
    pub fn outbound(call_type: CallType, caller_id: &str, recipient_id: &str) -> Self {
        Self {
            call_id: None,
            call_type,
            caller_id: caller_id.to_string(),
            recipient_id: recipient_id.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            phase: CallPhase::Initiating,
        }
    }

    pub fn inbound(call_id: String, call_type: CallType, caller_id: &str, local_id: &str) -> Self {
        Self {
            call_id: Some(call_id),
            call_type,
            caller_id: caller_id.to_string(),
            recipient_id: local_id.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            phase: CallPhase::Ringing,
        }
    }

    /// The side that created the session by calling out makes the SDP offer.
    pub fn is_initiator(&self, local_user_id: &str) -> bool {
        self.caller_id == local_user_id
    }

    /// The other participant, seen from the local user.
    pub fn peer_id(&self, local_user_id: &str) -> String {
        if self.caller_id == local_user_id {
            self.recipient_id.clone()
        } else {
            self.caller_id.clone()
        }
    }
}

/// Display metadata riding along with call initiation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerMeta {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

// ============================================================================
// Auth / TURN
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    /// Unix millis.
    pub expires_at: i64,
}

impl AuthToken {
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp_millis() >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}
