#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use convo_domain::{ConversationId, ConversationInfo, ConversationKind, Message, Seq, UserId};
use convo_protocol::{ClientFrame, ErrorCode, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::delivery::{DeliveryConfig, DeliveryEngine};
use crate::server::directory::{MembershipDirectory, ProfileStore, StaticDirectory};
use crate::server::hub::{FanoutHub, FanoutHubConfig, FanoutItem};
use crate::server::query::QueryService;
use crate::server::session::{Session, SessionError};
use crate::server::store::{InMemoryMessageStore, MessageStore};
use crate::server::tracker::{InMemoryReadTracker, ReadTracker};

const DIRECT: ConversationId = ConversationId::new(10);
const GROUP: ConversationId = ConversationId::new(20);

fn user(id: u64) -> UserId {
	UserId::new(id)
}

struct Fixture {
	session: Session,
	out_rx: mpsc::Receiver<ServerFrame>,
	store: Arc<InMemoryMessageStore>,
	tracker: Arc<InMemoryReadTracker>,
	hub: FanoutHub,
	delivery: Arc<DeliveryEngine>,
}

fn fixture() -> Fixture {
	// Session under test runs as ada (user 1).
	let user_id = user(1);
	let store = Arc::new(InMemoryMessageStore::new());
	let tracker = Arc::new(InMemoryReadTracker::new());

	let mut dir = StaticDirectory::new();
	dir.add_user(user(1), "ada", "ada.png");
	dir.add_user(user(2), "grace", "grace.png");
	dir.add_user(user(3), "lin", "");
	dir.add_conversation(
		ConversationInfo {
			id: DIRECT,
			name: String::new(),
			avatar: String::new(),
			kind: ConversationKind::Direct,
		},
		vec![user(1), user(2)],
	);
	dir.add_conversation(
		ConversationInfo {
			id: GROUP,
			name: "ops".to_string(),
			avatar: String::new(),
			kind: ConversationKind::Group,
		},
		vec![user(1), user(2), user(3)],
	);
	let dir = Arc::new(dir);

	let query = Arc::new(QueryService::new(
		Arc::clone(&store) as Arc<dyn MessageStore>,
		Arc::clone(&tracker) as Arc<dyn ReadTracker>,
		Arc::clone(&dir) as Arc<dyn MembershipDirectory>,
		dir as Arc<dyn ProfileStore>,
	));

	let hub = FanoutHub::new(FanoutHubConfig::default());
	let (out_tx, out_rx) = mpsc::channel(64);
	let delivery = Arc::new(DeliveryEngine::new(out_tx.clone(), DeliveryConfig::default()));

	let session = Session::new(
		1,
		user_id,
		HashSet::from([DIRECT, GROUP]),
		Arc::clone(&store) as Arc<dyn MessageStore>,
		Arc::clone(&tracker) as Arc<dyn ReadTracker>,
		query,
		hub.clone(),
		Arc::clone(&delivery),
		out_tx,
	);

	Fixture {
		session,
		out_rx,
		store,
		tracker,
		hub,
		delivery,
	}
}

async fn recv_frame(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected a frame within timeout")
		.expect("channel open")
}

fn send_frame(conversation: ConversationId, body: &str, reply_to: Option<Seq>, token: &str) -> ClientFrame {
	ClientFrame::Send {
		conversation_id: conversation,
		body: body.to_string(),
		reply_to,
		idempotency_token: token.to_string(),
	}
}

#[tokio::test]
async fn ping_gets_a_pong() {
	let mut fx = fixture();

	fx.session.handle_frame(ClientFrame::Ping).await.expect("handle");
	assert!(matches!(recv_frame(&mut fx.out_rx).await, ServerFrame::Pong));
}

#[tokio::test]
async fn hello_after_session_start_is_a_protocol_violation() {
	let mut fx = fixture();

	let err = fx
		.session
		.handle_frame(ClientFrame::Hello {
			credential: "again".to_string(),
		})
		.await
		.unwrap_err();
	assert!(matches!(err, SessionError::Protocol(_)));
}

#[tokio::test]
async fn announce_lists_rooms_then_unread_summaries() {
	let mut fx = fixture();

	for i in 0..5u64 {
		fx.store
			.append(GROUP, user(2), format!("m{}", i + 1), None)
			.await
			.expect("append");
	}
	fx.store.mark_deleted(GROUP, user(1), Seq::new(2)).await.expect("delete");
	fx.store.mark_deleted(GROUP, user(1), Seq::new(4)).await.expect("delete");

	fx.session.announce().await.expect("announce");

	let rooms = match recv_frame(&mut fx.out_rx).await {
		ServerFrame::RoomInfos { rooms } => rooms,
		other => panic!("expected RoomInfos first, got: {other:?}"),
	};
	assert_eq!(rooms.len(), 2);
	let direct = rooms.iter().find(|r| r.conversation_id == DIRECT).unwrap();
	assert_eq!(direct.name, "grace", "1:1 presents the other member");

	let summaries = match recv_frame(&mut fx.out_rx).await {
		ServerFrame::UnreadMessages { summaries, .. } => summaries,
		other => panic!("expected UnreadMessages, got: {other:?}"),
	};
	let group = summaries.iter().find(|s| s.conversation_id == GROUP).unwrap();
	assert_eq!(group.unread_count, 3, "5 stored, 2 deleted, nothing read");
	assert!(
		group.recent
			.iter()
			.all(|v| v.message.sequence != Seq::new(2) && v.message.sequence != Seq::new(4))
	);
}

#[tokio::test]
async fn send_is_stored_acked_and_fanned_out() {
	let mut fx = fixture();
	let mut sub_rx = fx.hub.subscribe(GROUP).await;

	fx.session
		.handle_frame(send_frame(GROUP, "hello", None, "t1"))
		.await
		.expect("handle");

	let ack = recv_frame(&mut fx.out_rx).await;
	match &ack {
		ServerFrame::Acknowledge {
			idempotency_token,
			conversation_id,
			sequence,
			reply_to_missing,
			..
		} => {
			assert_eq!(idempotency_token, "t1");
			assert_eq!(*conversation_id, GROUP);
			assert_eq!(*sequence, Seq::FIRST);
			assert!(!reply_to_missing);
		}
		other => panic!("expected Acknowledge, got: {other:?}"),
	}
	fx.delivery.ack(ack.delivery_id().unwrap()).await;

	// The author's own mark advanced with the send.
	assert_eq!(fx.tracker.read_through(GROUP, user(1)).await.expect("read"), Seq::FIRST);

	let item = timeout(Duration::from_millis(250), sub_rx.recv())
		.await
		.expect("fanout within timeout")
		.expect("channel open");
	match item {
		FanoutItem::Message(message) => {
			assert_eq!(message.sequence, Seq::FIRST);
			assert_eq!(message.body, "hello");
		}
		other => panic!("expected Message item, got: {other:?}"),
	}
}

#[tokio::test]
async fn duplicate_idempotency_token_replays_the_same_outcome() {
	let mut fx = fixture();

	fx.session
		.handle_frame(send_frame(GROUP, "once", None, "t1"))
		.await
		.expect("handle");
	let first = recv_frame(&mut fx.out_rx).await;

	fx.session
		.handle_frame(send_frame(GROUP, "once", None, "t1"))
		.await
		.expect("handle");
	let second = recv_frame(&mut fx.out_rx).await;

	let seq_of = |frame: &ServerFrame| match frame {
		ServerFrame::Acknowledge { sequence, .. } => *sequence,
		other => panic!("expected Acknowledge, got: {other:?}"),
	};
	assert_eq!(seq_of(&first), Seq::FIRST);
	assert_eq!(seq_of(&second), Seq::FIRST, "replayed, not re-appended");

	assert_eq!(fx.store.head(GROUP).await.expect("head"), Seq::FIRST, "stored exactly once");
}

#[tokio::test]
async fn send_to_a_non_member_conversation_is_forbidden() {
	let mut fx = fixture();

	fx.session
		.handle_frame(send_frame(ConversationId::new(99), "nope", None, "t1"))
		.await
		.expect("handle");

	match recv_frame(&mut fx.out_rx).await {
		ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
		other => panic!("expected Error, got: {other:?}"),
	}
	assert_eq!(fx.store.head(ConversationId::new(99)).await.expect("head"), Seq::ZERO);
}

#[tokio::test]
async fn dangling_reply_is_acked_with_the_missing_flag() {
	let mut fx = fixture();

	fx.session
		.handle_frame(send_frame(GROUP, "re", Some(Seq::new(50)), "t1"))
		.await
		.expect("handle");

	match recv_frame(&mut fx.out_rx).await {
		ServerFrame::Acknowledge { reply_to_missing, sequence, .. } => {
			assert!(reply_to_missing);
			assert_eq!(sequence, Seq::FIRST, "still assigned a sequence");
		}
		other => panic!("expected Acknowledge, got: {other:?}"),
	}
}

#[tokio::test]
async fn set_read_index_advances_silently_and_never_regresses() {
	let mut fx = fixture();

	fx.session
		.handle_frame(ClientFrame::SetReadIndex {
			conversation_id: GROUP,
			sequence: Seq::new(8),
		})
		.await
		.expect("handle");

	fx.session
		.handle_frame(ClientFrame::SetReadIndex {
			conversation_id: GROUP,
			sequence: Seq::new(3),
		})
		.await
		.expect("handle");

	assert_eq!(fx.tracker.read_through(GROUP, user(1)).await.expect("read"), Seq::new(8));
	assert!(
		timeout(Duration::from_millis(50), fx.out_rx.recv()).await.is_err(),
		"no confirmation frame for read index updates"
	);
}

#[tokio::test]
async fn get_history_replies_with_an_ack_tracked_page() {
	let mut fx = fixture();
	for i in 0..3u64 {
		fx.store
			.append(GROUP, user(2), format!("m{}", i + 1), None)
			.await
			.expect("append");
	}

	fx.session
		.handle_frame(ClientFrame::GetHistory {
			conversation_id: GROUP,
			before_sequence: Seq::new(4),
		})
		.await
		.expect("handle");

	let frame = recv_frame(&mut fx.out_rx).await;
	let delivery_id = frame.delivery_id().expect("history frames are ack-tracked");
	match frame {
		ServerFrame::HistoryMessages {
			conversation_id,
			messages,
			..
		} => {
			assert_eq!(conversation_id, GROUP);
			let seqs: Vec<u64> = messages.iter().map(|v| v.message.sequence.get()).collect();
			assert_eq!(seqs, vec![3, 2, 1]);
		}
		other => panic!("expected HistoryMessages, got: {other:?}"),
	}

	// Acking through the session clears the pending delivery.
	fx.session
		.handle_frame(ClientFrame::ReceiverAck { delivery_id })
		.await
		.expect("handle");
	assert_eq!(fx.delivery.pending_len().await, 0);
}

#[tokio::test]
async fn get_message_detail_for_unknown_sequence_is_not_found() {
	let mut fx = fixture();

	fx.session
		.handle_frame(ClientFrame::GetMessageDetail {
			conversation_id: GROUP,
			sequence: Seq::new(5),
		})
		.await
		.expect("handle");

	match recv_frame(&mut fx.out_rx).await {
		ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
		other => panic!("expected Error, got: {other:?}"),
	}
}

#[tokio::test]
async fn fanout_items_become_chat_message_frames() {
	let mut fx = fixture();

	let message = Message {
		conversation_id: GROUP,
		sequence: Seq::new(7),
		author_id: user(2),
		body: "live".to_string(),
		reply_to: None,
		created_at_unix_ms: 123,
	};

	fx.session
		.handle_fanout(FanoutItem::Message(Box::new(message)))
		.await
		.expect("handle");

	match recv_frame(&mut fx.out_rx).await {
		ServerFrame::ChatMessage { message, .. } => {
			assert_eq!(message.sequence, Seq::new(7));
			assert_eq!(message.author_name, "grace");
			assert_eq!(message.body, "live");
			assert_eq!(message.sent_at_unix_ms, 123);
		}
		other => panic!("expected ChatMessage, got: {other:?}"),
	}
}

#[tokio::test]
async fn lag_markers_are_swallowed_and_logged() {
	let mut fx = fixture();

	fx.session
		.handle_fanout(FanoutItem::Lagged { dropped: 4 })
		.await
		.expect("handle");

	assert!(
		timeout(Duration::from_millis(50), fx.out_rx.recv()).await.is_err(),
		"lag markers never reach the wire"
	);
}
