//! Socket wire protocol
//!
//! All frames are JSON objects with a `type` tag. Server frames also carry
//! a `timestamp`.

use chrono::{DateTime, Utc};
use fleet_common::DevicePosition;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames accepted from clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    SubscribeVehicles {
        #[serde(default, alias = "vehicleIds")]
        vehicle_ids: Vec<String>,
    },
    Ping,
    RequestPositionUpdate,
}

/// Frames sent to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        connection_id: Uuid,
    },
    Authenticated {
        user_id: String,
    },
    AuthError {
        message: String,
    },
    SubscriptionUpdated {
        vehicle_ids: Vec<String>,
    },
    Pong,
    /// Reply to `request_position_update`
    PositionUpdate {
        positions: Vec<DevicePosition>,
    },
    /// Pushed when a position is persisted
    LivePositionUpdate {
        position: DevicePosition,
    },
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: DateTime<Utc>,
}

impl From<ServerMessage> for ServerFrame {
    fn from(message: ServerMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
        }
    }
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_vehicles","vehicle_ids":["A","B"]}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeVehicles {
                vehicle_ids: vec!["A".into(), "B".into()]
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe_vehicles"}"#).unwrap();
        assert_eq!(msg, ClientMessage::SubscribeVehicles { vehicle_ids: vec![] });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shutdown"}"#).is_err());
    }

    #[test]
    fn test_server_frame_carries_type_and_timestamp() {
        let frame = ServerFrame::from(ServerMessage::Pong);
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], json!("pong"));
        assert!(value["timestamp"].is_string());

        let frame = ServerFrame::from(ServerMessage::error("AUTH_REQUIRED", "authenticate first"));
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], json!("error"));
        assert_eq!(value["code"], json!("AUTH_REQUIRED"));
    }
}
