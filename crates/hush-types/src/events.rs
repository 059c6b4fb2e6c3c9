use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::RevealedIdentity;

/// Events pushed to a user over the WebSocket gateway.
///
/// Every event is targeted at one user. None of them carry the identity of
/// the other party except `UnmaskingCompleted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A new whisper landed in the inbox
    WhisperReceived {
        whisper_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The recipient of one of your whispers wants to talk
    EchoRequested { conversation_id: Uuid, whisper_id: Uuid },

    /// A conversation became active (direct echo or accepted request)
    ConversationActivated { conversation_id: Uuid },

    /// A conversation was rejected or closed
    ConversationClosed { conversation_id: Uuid },

    /// A message was posted in one of your conversations
    MessageCreate {
        id: Uuid,
        conversation_id: Uuid,
        content: String,
        image_url: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The other participant asked to unmask
    UnmaskingRequested { conversation_id: Uuid, request_id: Uuid },

    /// Both participants asked to unmask before either responded
    UnmaskingMutual { conversation_id: Uuid },

    /// Your unmasking request was accepted and is ready to complete
    UnmaskingAccepted { conversation_id: Uuid },

    /// Your unmasking request was declined
    UnmaskingDeclined { conversation_id: Uuid },

    /// Identities were revealed
    UnmaskingCompleted {
        conversation_id: Uuid,
        identity: RevealedIdentity,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format_is_tagged() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(GatewayEvent::ConversationClosed { conversation_id: id }).unwrap();
        assert_eq!(json["type"], "ConversationClosed");
        assert_eq!(json["data"]["conversation_id"], id.to_string());
    }

    #[test]
    fn identify_command_parses() {
        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"type":"Identify","data":{"token":"abc"}}"#).unwrap();
        match cmd {
            GatewayCommand::Identify { token } => assert_eq!(token, "abc"),
        }
    }
}
