use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::hub::Frame;
use crate::core::pet::PetSnapshot;

/// Threat details as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatNotice {
    pub threat_type: String,
    pub confidence: u8,
    pub explanation: String,
    pub user_friendly_message: String,
}

impl ThreatNotice {
    /// Notice for a report that arrived without human-readable text.
    pub fn from_type(threat_type: &str, confidence: u8, explanation: Option<String>) -> Self {
        Self {
            threat_type: threat_type.to_string(),
            confidence,
            explanation: explanation.unwrap_or_else(|| "Threat detected".to_string()),
            user_friendly_message: format!("⚠️ {}!", title_case(threat_type)),
        }
    }
}

/// `phishing_email` → `Phishing Email`
pub fn title_case(label: &str) -> String {
    label
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HealthUpdate {
        pet_state: PetSnapshot,
    },
    PetSnapshot {
        data: PetSnapshot,
    },
    ThreatDetected {
        threat: ThreatNotice,
        pet_state: PetSnapshot,
    },
    Echo {
        echo: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn to_frame(&self) -> Frame {
        // Every variant is plain data; serialization cannot fail.
        let text = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        Arc::from(text)
    }
}

/// Client → server text. Anything that isn't a recognised command is echoed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Ping,
}

pub fn reply_to_client(text: &str) -> ServerMessage {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(ClientCommand::Ping) => ServerMessage::Pong,
        Err(_) => ServerMessage::Echo {
            echo: text.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pet::PetState;
    use serde_json::Value;

    #[test]
    fn test_wire_shapes() {
        let snap = PetState::default().snapshot();

        let v: Value = serde_json::from_str(
            &ServerMessage::HealthUpdate { pet_state: snap.clone() }.to_frame(),
        )
        .unwrap();
        assert_eq!(v["type"], "health_update");
        assert_eq!(v["pet_state"]["health"], 100);
        assert_eq!(v["pet_state"]["mood"], "happy");

        let v: Value =
            serde_json::from_str(&ServerMessage::PetSnapshot { data: snap.clone() }.to_frame())
                .unwrap();
        assert_eq!(v["type"], "pet_snapshot");
        assert_eq!(v["data"]["evolution_stage"], 1);

        let msg = ServerMessage::ThreatDetected {
            threat: ThreatNotice::from_type("phishing_email", 90, None),
            pet_state: snap,
        };
        let v: Value = serde_json::from_str(&msg.to_frame()).unwrap();
        assert_eq!(v["type"], "threat_detected");
        assert_eq!(v["threat"]["confidence"], 90);
        assert_eq!(v["threat"]["user_friendly_message"], "⚠️ Phishing Email!");
    }

    #[test]
    fn test_client_replies() {
        assert_eq!(reply_to_client(r#"{"type":"ping"}"#), ServerMessage::Pong);
        assert_eq!(
            reply_to_client("hi there"),
            ServerMessage::Echo { echo: "hi there".to_string() }
        );
        let v: Value = serde_json::from_str(&reply_to_client("x").to_frame()).unwrap();
        assert_eq!(v["type"], "echo");
        assert_eq!(v["echo"], "x");
    }
}
