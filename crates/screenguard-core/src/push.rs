//! Push channel protocol
//!
//! Frames flow server to client, control messages client to server. Both are
//! JSON objects tagged by a `type` field.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    error::TransportError,
    settings::{ConfigAck, ConfigUpdate, DetectionStatus},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionUpdate {
    pub detection_id: String,
    pub is_peeking: bool,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub is_active: bool,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    #[must_use]
    pub fn now(is_active: bool) -> Self {
        Self {
            is_active,
            timestamp: Utc::now(),
        }
    }
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    DetectionUpdate(DetectionUpdate),
    StatusUpdate(StatusUpdate),
    StatusSnapshot { status: Box<DetectionStatus> },
    ConfigUpdated { ack: ConfigAck },
    Pong { timestamp: DateTime<Utc> },
    Error { message: String },
}

/// Client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message on a connection, binds it to a user
    Hello { user_id: String },
    StartDetection,
    StopDetection,
    UpdateConfig { config: ConfigUpdate },
    GetStatus,
    Ping {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl ControlMessage {
    /// Decode one line of input
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Codec` for anything that is not a known message
    pub fn decode(line: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Decode one raw line; bytes that are not UTF-8 are a codec error like any other
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Codec` for anything that is not a known message
    pub fn decode_bytes(line: &[u8]) -> Result<Self, TransportError> {
        Ok(serde_json::from_slice(line)?)
    }
}

/// Destination for a user's frames
#[async_trait]
pub trait PushSink: Send + Sync {
    /// # Errors
    ///
    /// Returns a transport error if the frame cannot be delivered; the caller treats it as a disconnect
    async fn push(&self, frame: PushFrame) -> Result<(), TransportError>;
}

#[async_trait]
impl PushSink for mpsc::Sender<PushFrame> {
    async fn push(&self, frame: PushFrame) -> Result<(), TransportError> {
        self.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_are_tagged_by_type() {
        let timestamp = Utc::now();
        let frame = PushFrame::DetectionUpdate(DetectionUpdate {
            detection_id: "d1".into(),
            is_peeking: true,
            confidence: 0.9,
            timestamp,
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "detection_update");
        assert_eq!(value["detection_id"], "d1");
        assert_eq!(value["is_peeking"], true);

        let value = serde_json::to_value(PushFrame::StatusUpdate(StatusUpdate::now(false))).unwrap();
        assert_eq!(value["type"], "status_update");
        assert_eq!(value["is_active"], false);
    }

    #[test]
    fn test_decode_control_messages() {
        assert_eq!(
            ControlMessage::decode(r#"{"type":"start_detection"}"#).unwrap(),
            ControlMessage::StartDetection
        );
        assert_eq!(
            ControlMessage::decode(" {\"type\":\"stop_detection\"}\n").unwrap(),
            ControlMessage::StopDetection
        );

        let update = ControlMessage::decode(
            &json!({"type": "update_config", "config": {"alert_floor": 0.5}}).to_string(),
        )
        .unwrap();
        match update {
            ControlMessage::UpdateConfig { config } => {
                assert_eq!(config.alert_floor, Some(0.5));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(ControlMessage::decode("not json").is_err());
        assert!(ControlMessage::decode(r#"{"type":"reboot"}"#).is_err());
        assert!(ControlMessage::decode(r#"{"type":"hello"}"#).is_err());
        assert!(ControlMessage::decode_bytes(b"\xff\xfe garbage\n").is_err());
        assert!(matches!(
            ControlMessage::decode_bytes(b"{\"type\":\"get_status\"}\r\n"),
            Ok(ControlMessage::GetStatus)
        ));
    }

    #[tokio::test]
    async fn test_mpsc_sink_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = tx.push(PushFrame::Pong { timestamp: Utc::now() }).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
