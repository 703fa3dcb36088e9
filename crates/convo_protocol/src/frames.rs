#![forbid(unsafe_code)]

use convo_domain::{ConversationId, ConversationKind, DeliveryId, Seq, UserId};
use serde::{Deserialize, Serialize};

/// Wire encoding for `Option<Seq>` reply references: `-1` means "not a reply".
pub mod reply_sentinel {
	use convo_domain::Seq;
	use serde::de::Error as _;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Option<Seq>, serializer: S) -> Result<S::Ok, S::Error> {
		match value {
			Some(seq) => serializer.serialize_i64(seq.get() as i64),
			None => serializer.serialize_i64(-1),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Seq>, D::Error> {
		let n = i64::deserialize(deserializer)?;
		match n {
			-1 => Ok(None),
			n if n >= 1 => Ok(Some(Seq::new(n as u64))),
			other => Err(D::Error::custom(format!("invalid reply reference: {other}"))),
		}
	}
}

/// Frames sent by the client over the bidirectional stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	/// First frame of every connection; carries the auth credential.
	Hello {
		credential: String,
	},

	Ping,

	Send {
		conversation_id: ConversationId,
		body: String,
		#[serde(default, with = "reply_sentinel")]
		reply_to: Option<Seq>,
		idempotency_token: String,
	},

	SetReadIndex {
		conversation_id: ConversationId,
		sequence: Seq,
	},

	GetHistory {
		conversation_id: ConversationId,
		before_sequence: Seq,
	},

	GetMessageDetail {
		conversation_id: ConversationId,
		sequence: Seq,
	},

	GetReplyContext {
		conversation_id: ConversationId,
		sequence: Seq,
		before_sequence: Seq,
	},

	ReceiverAck {
		delivery_id: DeliveryId,
	},
}

/// A stored message decorated with its author's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
	pub conversation_id: ConversationId,
	pub sequence: Seq,
	pub author_id: UserId,
	pub author_name: String,
	pub author_avatar: String,
	pub body: String,
	#[serde(default, with = "reply_sentinel")]
	pub reply_to: Option<Seq>,
	pub sent_at_unix_ms: i64,
}

/// Short preview of a replied-to message, attached to reply-context entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepliedPreview {
	pub sequence: Seq,
	pub author_name: String,
	pub body: String,
}

/// A message plus the resolved preview of whatever it replied to. Carried by
/// history pages, unread previews and reply-context windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepliedMessageView {
	#[serde(flatten)]
	pub message: MessageView,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub replied: Option<RepliedPreview>,
}

/// Per-conversation unread state sent right after subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadSummaryView {
	pub conversation_id: ConversationId,
	pub unread_count: u64,
	pub recent: Vec<RepliedMessageView>,
}

/// Conversation presentation data; 1:1 conversations carry the other member's
/// name and avatar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfoView {
	pub conversation_id: ConversationId,
	pub name: String,
	pub avatar: String,
	pub kind: ConversationKind,
}

/// A member who has read at least a given sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderView {
	pub user_id: UserId,
	pub name: String,
}

/// Application error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	NotFound,
	Conflict,
	Forbidden,
	Unavailable,
}

/// Frames sent by the server over the bidirectional stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Pong,

	RoomInfos {
		rooms: Vec<RoomInfoView>,
	},

	UnreadMessages {
		delivery_id: DeliveryId,
		summaries: Vec<UnreadSummaryView>,
	},

	ChatMessage {
		delivery_id: DeliveryId,
		message: MessageView,
	},

	/// Send confirmation toward the author.
	Acknowledge {
		delivery_id: DeliveryId,
		idempotency_token: String,
		conversation_id: ConversationId,
		sequence: Seq,
		reply_to_missing: bool,
	},

	HistoryMessages {
		delivery_id: DeliveryId,
		conversation_id: ConversationId,
		messages: Vec<RepliedMessageView>,
	},

	MessageDetail {
		delivery_id: DeliveryId,
		conversation_id: ConversationId,
		sequence: Seq,
		reply_count: u64,
		sent_at_unix_ms: i64,
		/// Present for 1:1 conversations only.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		is_read: Option<bool>,
		/// Present for group conversations only.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		readers: Option<Vec<ReaderView>>,
	},

	ReplyMessageContext {
		delivery_id: DeliveryId,
		error: bool,
		messages: Vec<RepliedMessageView>,
	},

	RetryFailed {
		delivery_id: DeliveryId,
	},

	Error {
		code: ErrorCode,
		message: String,
	},
}

impl ServerFrame {
	/// The delivery id this frame carries, if any.
	pub fn delivery_id(&self) -> Option<DeliveryId> {
		match self {
			ServerFrame::UnreadMessages { delivery_id, .. }
			| ServerFrame::ChatMessage { delivery_id, .. }
			| ServerFrame::Acknowledge { delivery_id, .. }
			| ServerFrame::HistoryMessages { delivery_id, .. }
			| ServerFrame::MessageDetail { delivery_id, .. }
			| ServerFrame::ReplyMessageContext { delivery_id, .. }
			| ServerFrame::RetryFailed { delivery_id } => Some(*delivery_id),
			ServerFrame::Pong | ServerFrame::RoomInfos { .. } | ServerFrame::Error { .. } => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn client_frames_are_type_tagged() {
		let v = serde_json::to_value(&ClientFrame::Ping).unwrap();
		assert_eq!(v, json!({ "type": "ping" }));

		let v = serde_json::to_value(&ClientFrame::ReceiverAck {
			delivery_id: DeliveryId::new(9),
		})
		.unwrap();
		assert_eq!(v, json!({ "type": "receiver_ack", "delivery_id": 9 }));
	}

	#[test]
	fn send_reply_sentinel_round_trips() {
		let frame = ClientFrame::Send {
			conversation_id: ConversationId::new(3),
			body: "hi".to_string(),
			reply_to: None,
			idempotency_token: "t1".to_string(),
		};

		let v = serde_json::to_value(&frame).unwrap();
		assert_eq!(v["reply_to"], json!(-1));

		let back: ClientFrame = serde_json::from_value(v).unwrap();
		assert_eq!(back, frame);

		let with_reply: ClientFrame = serde_json::from_value(json!({
			"type": "send",
			"conversation_id": 3,
			"body": "hi",
			"reply_to": 7,
			"idempotency_token": "t2",
		}))
		.unwrap();
		match with_reply {
			ClientFrame::Send { reply_to, .. } => assert_eq!(reply_to, Some(Seq::new(7))),
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn send_reply_defaults_to_none_when_absent() {
		let frame: ClientFrame = serde_json::from_value(json!({
			"type": "send",
			"conversation_id": 1,
			"body": "x",
			"idempotency_token": "t",
		}))
		.unwrap();
		match frame {
			ClientFrame::Send { reply_to, .. } => assert_eq!(reply_to, None),
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn rejects_zero_reply_reference() {
		let res: Result<ClientFrame, _> = serde_json::from_value(json!({
			"type": "send",
			"conversation_id": 1,
			"body": "x",
			"reply_to": 0,
			"idempotency_token": "t",
		}));
		assert!(res.is_err());
	}

	#[test]
	fn message_detail_omits_absent_reader_fields() {
		let frame = ServerFrame::MessageDetail {
			delivery_id: DeliveryId::new(1),
			conversation_id: ConversationId::new(2),
			sequence: Seq::new(5),
			reply_count: 0,
			sent_at_unix_ms: 1_700_000_000_000,
			is_read: Some(true),
			readers: None,
		};

		let v = serde_json::to_value(&frame).unwrap();
		assert_eq!(v["is_read"], json!(true));
		assert!(v.get("readers").is_none());
	}

	#[test]
	fn delivery_id_accessor_matches_frames() {
		assert_eq!(ServerFrame::Pong.delivery_id(), None);
		assert_eq!(
			ServerFrame::RetryFailed {
				delivery_id: DeliveryId::new(4)
			}
			.delivery_id(),
			Some(DeliveryId::new(4))
		);
	}

	#[test]
	fn reply_context_entry_flattens_message() {
		let entry = RepliedMessageView {
			message: MessageView {
				conversation_id: ConversationId::new(1),
				sequence: Seq::new(10),
				author_id: UserId::new(2),
				author_name: "ada".to_string(),
				author_avatar: "a.png".to_string(),
				body: "see above".to_string(),
				reply_to: Some(Seq::new(4)),
				sent_at_unix_ms: 0,
			},
			replied: Some(RepliedPreview {
				sequence: Seq::new(4),
				author_name: "grace".to_string(),
				body: "original".to_string(),
			}),
		};

		let v = serde_json::to_value(&entry).unwrap();
		assert_eq!(v["sequence"], json!(10));
		assert_eq!(v["reply_to"], json!(4));
		assert_eq!(v["replied"]["sequence"], json!(4));
	}
}
