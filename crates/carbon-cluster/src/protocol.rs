//! Cluster wire protocol
//!
//! Every frame is a JSON document tagged with its `type` and carries the
//! sending member. Over TCP frames are length-delimited; over UDP a datagram
//! holds exactly one frame.

use crate::error::{ClusterError, Result};
use crate::member::ClusterMember;
use crate::message::ClusterMessage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;
use uuid::Uuid;

/// Largest TCP frame accepted
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Largest UDP datagram sent or accepted
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Periodic presence signal (multicast)
    Heartbeat { sender: ClusterMember },

    /// Request to join; answered with a `MemberList`
    Join { sender: ClusterMember },

    /// The responder's primary member list
    MemberList {
        sender: ClusterMember,
        members: Vec<ClusterMember>,
    },

    /// A new member joined through the sender
    MemberJoined {
        sender: ClusterMember,
        member: ClusterMember,
    },

    /// The sender is leaving the cluster
    Leave { sender: ClusterMember },

    /// Liveness probe (WKA); answered with an `Ack`
    Ping { sender: ClusterMember },

    /// Application message; answered with an `Ack` or `Nack`
    Application {
        sender: ClusterMember,
        message: ClusterMessage,
    },

    /// Positive reply; for an application message it carries the handler's response
    Ack {
        sender: ClusterMember,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<serde_json::Value>,
    },

    Nack {
        sender: ClusterMember,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
        reason: String,
    },
}

impl Frame {
    pub fn sender(&self) -> &ClusterMember {
        match self {
            Self::Heartbeat { sender }
            | Self::Join { sender }
            | Self::MemberList { sender, .. }
            | Self::MemberJoined { sender, .. }
            | Self::Leave { sender }
            | Self::Ping { sender }
            | Self::Application { sender, .. }
            | Self::Ack { sender, .. }
            | Self::Nack { sender, .. } => sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::Join { .. } => "join",
            Self::MemberList { .. } => "member_list",
            Self::MemberJoined { .. } => "member_joined",
            Self::Leave { .. } => "leave",
            Self::Ping { .. } => "ping",
            Self::Application { .. } => "application",
            Self::Ack { .. } => "ack",
            Self::Nack { .. } => "nack",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ClusterError::protocol(format!("Malformed frame: {}", e)))
    }

    /// Encode for a single UDP datagram
    pub fn encode_datagram(&self) -> Result<Bytes> {
        let data = self.encode()?;
        if data.len() > MAX_DATAGRAM {
            return Err(ClusterError::protocol(format!(
                "{} frame of {} bytes exceeds the datagram limit",
                self.kind(),
                data.len()
            )));
        }
        Ok(data)
    }
}

/// Codec used on every cluster TCP connection
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::member_at;
    use bytes::BytesMut;
    use serde_json::json;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_frame_is_tagged() {
        let sender = member_at(4000, "test.domain");
        let frame = Frame::Join {
            sender: sender.clone(),
        };

        let text = String::from_utf8(frame.encode().unwrap().to_vec()).unwrap();
        assert!(text.contains("\"type\":\"join\""));
        assert!(text.contains(&sender.id.to_string()));
        assert!(text.contains("127.0.0.1:4000"));
    }

    #[test]
    fn test_application_frame_decodes() {
        let sender = member_at(4000, "test.domain");
        let message = ClusterMessage::new("config.reload", json!({"tenant": 7}));
        let frame = Frame::Application {
            sender: sender.clone(),
            message: message.clone(),
        };

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), "application");
        assert_eq!(decoded.sender(), &sender);
        match decoded {
            Frame::Application { message: m, .. } => assert_eq!(m, message),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_ack_response_is_optional() {
        let sender = member_at(4000, "test.domain");
        let bare = format!(
            r#"{{"type":"ack","sender":{}}}"#,
            serde_json::to_string(&sender).unwrap()
        );
        assert!(matches!(
            Frame::decode(bare.as_bytes()).unwrap(),
            Frame::Ack {
                message_id: None,
                response: None,
                ..
            }
        ));

        let frame = Frame::Ack {
            sender,
            message_id: Some(Uuid::new_v4()),
            response: Some(json!({"evicted": 3})),
        };
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        let err = Frame::decode(b"{\"type\":\"gossip\"}").unwrap_err();
        assert!(matches!(err, ClusterError::Protocol(_)));
        assert!(Frame::decode(b"not json").is_err());
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let sender = member_at(4000, "test.domain");
        let frame = Frame::Application {
            sender,
            message: ClusterMessage::new("bulk", json!("x".repeat(MAX_DATAGRAM))),
        };
        assert!(frame.encode_datagram().is_err());
    }

    #[test]
    fn test_codec_rejects_oversized_frames() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from(vec![b'x'; MAX_FRAME_LENGTH + 1]), &mut buf)
            .unwrap_err();

        let frame = Frame::Ping {
            sender: member_at(4000, "test.domain"),
        };
        codec.encode(frame.encode().unwrap(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Frame::decode(&decoded).unwrap(), frame);
    }
}
