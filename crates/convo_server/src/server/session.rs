#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use convo_domain::{ConversationId, Seq, UserId};
use convo_protocol::{ClientFrame, ErrorCode, ServerFrame};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::delivery::DeliveryEngine;
use crate::server::hub::{FanoutHub, FanoutItem};
use crate::server::query::{QueryService, Readership};
use crate::server::store::{MessageStore, StoreError};
use crate::server::tracker::ReadTracker;

#[derive(Debug, Error)]
pub enum SessionError {
	/// Closes the connection with the protocol-violation code.
	#[error("protocol violation: {0}")]
	Protocol(String),

	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

/// Completed send outcome, replayed verbatim when the same idempotency token
/// arrives again on this session.
#[derive(Debug, Clone)]
struct SendOutcome {
	conversation_id: ConversationId,
	sequence: Seq,
	reply_to_missing: bool,
}

/// Per-connection state machine, alive from successful auth to disconnect.
/// Nothing here is shared across connections; a reconnect starts empty and
/// re-derives unread state from the tracker and store.
pub struct Session {
	conn_id: u64,
	user_id: UserId,
	conversations: HashSet<ConversationId>,
	store: Arc<dyn MessageStore>,
	tracker: Arc<dyn ReadTracker>,
	query: Arc<QueryService>,
	hub: FanoutHub,
	delivery: Arc<DeliveryEngine>,
	outbound: mpsc::Sender<ServerFrame>,
	processed_sends: HashMap<String, SendOutcome>,
}

impl Session {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		conn_id: u64,
		user_id: UserId,
		conversations: HashSet<ConversationId>,
		store: Arc<dyn MessageStore>,
		tracker: Arc<dyn ReadTracker>,
		query: Arc<QueryService>,
		hub: FanoutHub,
		delivery: Arc<DeliveryEngine>,
		outbound: mpsc::Sender<ServerFrame>,
	) -> Self {
		Self {
			conn_id,
			user_id,
			conversations,
			store,
			tracker,
			query,
			hub,
			delivery,
			outbound,
			processed_sends: HashMap::new(),
		}
	}

	pub fn user_id(&self) -> UserId {
		self.user_id
	}

	pub fn conversations(&self) -> &HashSet<ConversationId> {
		&self.conversations
	}

	/// Post-auth greeting: conversation list (fire-and-forget) followed by the
	/// ack-tracked unread summary.
	pub async fn announce(&self) -> Result<(), SessionError> {
		let conversations = self.conversations.iter().copied().collect::<Vec<_>>();

		let rooms = self.query.room_infos(self.user_id, &conversations).await;
		self.send_untracked(ServerFrame::RoomInfos { rooms }).await?;

		let summaries = self
			.query
			.unread_summaries(self.user_id, &conversations)
			.await
			.map_err(|e| SessionError::Internal(anyhow!(e)))?;

		self.delivery
			.deliver(ServerFrame::UnreadMessages {
				delivery_id: self.delivery.allocate(),
				summaries,
			})
			.await?;

		Ok(())
	}

	pub async fn handle_frame(&mut self, frame: ClientFrame) -> Result<(), SessionError> {
		match frame {
			ClientFrame::Hello { .. } => Err(SessionError::Protocol("hello after session start".to_string())),

			ClientFrame::Ping => self.send_untracked(ServerFrame::Pong).await,

			ClientFrame::Send {
				conversation_id,
				body,
				reply_to,
				idempotency_token,
			} => self.handle_send(conversation_id, body, reply_to, idempotency_token).await,

			ClientFrame::SetReadIndex {
				conversation_id,
				sequence,
			} => self.handle_set_read_index(conversation_id, sequence).await,

			ClientFrame::GetHistory {
				conversation_id,
				before_sequence,
			} => self.handle_get_history(conversation_id, before_sequence).await,

			ClientFrame::GetMessageDetail {
				conversation_id,
				sequence,
			} => self.handle_get_message_detail(conversation_id, sequence).await,

			ClientFrame::GetReplyContext {
				conversation_id,
				sequence,
				before_sequence,
			} => {
				self.handle_get_reply_context(conversation_id, sequence, before_sequence)
					.await
			}

			ClientFrame::ReceiverAck { delivery_id } => {
				self.delivery.ack(delivery_id).await;
				Ok(())
			}
		}
	}

	/// A live fan-out item for one of this session's conversations.
	pub async fn handle_fanout(&self, item: FanoutItem) -> Result<(), SessionError> {
		match item {
			FanoutItem::Message(message) => {
				let view = self.query.view(*message).await;
				self.delivery
					.deliver(ServerFrame::ChatMessage {
						delivery_id: self.delivery.allocate(),
						message: view,
					})
					.await?;
				Ok(())
			}
			FanoutItem::Lagged { dropped } => {
				metrics::counter!("convo_server_session_lagged_total").increment(1);
				warn!(conn_id = self.conn_id, user = %self.user_id, dropped, "fanout subscriber lagged");
				Ok(())
			}
		}
	}

	async fn handle_send(
		&mut self,
		conversation: ConversationId,
		body: String,
		reply_to: Option<Seq>,
		idempotency_token: String,
	) -> Result<(), SessionError> {
		if !self.conversations.contains(&conversation) {
			return self.send_error(ErrorCode::Forbidden, "not a member of this conversation").await;
		}

		if let Some(done) = self.processed_sends.get(&idempotency_token).cloned() {
			debug!(
				conn_id = self.conn_id,
				token = %idempotency_token,
				sequence = %done.sequence,
				"replaying completed send for duplicate idempotency token"
			);
			metrics::counter!("convo_server_send_replays_total").increment(1);
			return self.deliver_acknowledge(&idempotency_token, &done).await;
		}

		let outcome = match self.store.append(conversation, self.user_id, body, reply_to).await {
			Ok(outcome) => outcome,
			Err(e) => {
				warn!(conn_id = self.conn_id, %conversation, error = %e, "append failed");
				return self.send_store_error(e).await;
			}
		};

		// Authors have seen their own message; best-effort, never atomic with
		// the append.
		if let Err(e) = self
			.tracker
			.advance(conversation, self.user_id, outcome.message.sequence)
			.await
		{
			warn!(conn_id = self.conn_id, %conversation, error = %e, "read mark advance after send failed");
		}

		self.hub.publish(outcome.message.clone()).await;
		metrics::counter!("convo_server_messages_stored_total").increment(1);

		let done = SendOutcome {
			conversation_id: conversation,
			sequence: outcome.message.sequence,
			reply_to_missing: !outcome.reply_resolved,
		};
		self.processed_sends.insert(idempotency_token.clone(), done.clone());

		self.deliver_acknowledge(&idempotency_token, &done).await
	}

	async fn deliver_acknowledge(&self, token: &str, done: &SendOutcome) -> Result<(), SessionError> {
		self.delivery
			.deliver(ServerFrame::Acknowledge {
				delivery_id: self.delivery.allocate(),
				idempotency_token: token.to_string(),
				conversation_id: done.conversation_id,
				sequence: done.sequence,
				reply_to_missing: done.reply_to_missing,
			})
			.await?;
		Ok(())
	}

	async fn handle_set_read_index(&self, conversation: ConversationId, sequence: Seq) -> Result<(), SessionError> {
		if !self.conversations.contains(&conversation) {
			return self.send_error(ErrorCode::Forbidden, "not a member of this conversation").await;
		}

		// Best-effort: no confirmation frame, regressions merge away silently.
		if let Err(e) = self.tracker.advance(conversation, self.user_id, sequence).await {
			warn!(conn_id = self.conn_id, %conversation, error = %e, "read mark advance failed");
		}
		Ok(())
	}

	async fn handle_get_history(&self, conversation: ConversationId, before: Seq) -> Result<(), SessionError> {
		if !self.conversations.contains(&conversation) {
			return self.send_error(ErrorCode::Forbidden, "not a member of this conversation").await;
		}

		let messages = match self.query.history_page(conversation, self.user_id, before).await {
			Ok(messages) => messages,
			Err(e) => return self.send_store_error(e).await,
		};

		self.delivery
			.deliver(ServerFrame::HistoryMessages {
				delivery_id: self.delivery.allocate(),
				conversation_id: conversation,
				messages,
			})
			.await?;
		Ok(())
	}

	async fn handle_get_message_detail(&self, conversation: ConversationId, sequence: Seq) -> Result<(), SessionError> {
		if !self.conversations.contains(&conversation) {
			return self.send_error(ErrorCode::Forbidden, "not a member of this conversation").await;
		}

		let detail = match self.query.message_detail(conversation, self.user_id, sequence).await {
			Ok(detail) => detail,
			Err(e) => return self.send_store_error(e).await,
		};

		let (is_read, readers) = match detail.readership {
			Readership::Direct { is_read } => (Some(is_read), None),
			Readership::Group { readers } => (None, Some(readers)),
		};

		self.delivery
			.deliver(ServerFrame::MessageDetail {
				delivery_id: self.delivery.allocate(),
				conversation_id: detail.conversation_id,
				sequence: detail.sequence,
				reply_count: detail.reply_count,
				sent_at_unix_ms: detail.sent_at_unix_ms,
				is_read,
				readers,
			})
			.await?;
		Ok(())
	}

	async fn handle_get_reply_context(
		&self,
		conversation: ConversationId,
		target: Seq,
		before: Seq,
	) -> Result<(), SessionError> {
		if !self.conversations.contains(&conversation) {
			return self.send_error(ErrorCode::Forbidden, "not a member of this conversation").await;
		}

		let (error, messages) = match self.query.reply_context(conversation, self.user_id, target, before).await {
			Ok(r) => r,
			Err(e) => return self.send_store_error(e).await,
		};

		self.delivery
			.deliver(ServerFrame::ReplyMessageContext {
				delivery_id: self.delivery.allocate(),
				error,
				messages,
			})
			.await?;
		Ok(())
	}

	async fn send_store_error(&self, e: StoreError) -> Result<(), SessionError> {
		let code = match &e {
			StoreError::NotFound { .. } => ErrorCode::NotFound,
			StoreError::AlreadyDeleted { .. } => ErrorCode::Conflict,
			StoreError::Unavailable(_) => ErrorCode::Unavailable,
		};
		self.send_error(code, &e.to_string()).await
	}

	async fn send_error(&self, code: ErrorCode, message: &str) -> Result<(), SessionError> {
		self.send_untracked(ServerFrame::Error {
			code,
			message: message.to_string(),
		})
		.await
	}

	async fn send_untracked(&self, frame: ServerFrame) -> Result<(), SessionError> {
		self.outbound
			.send(frame)
			.await
			.map_err(|_| SessionError::Internal(anyhow!("outbound channel closed")))
	}
}
