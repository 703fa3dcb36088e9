#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use convo_domain::{ConversationId, Message, Seq, UserId};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("message not found: conversation={conversation} sequence={sequence}")]
	NotFound {
		conversation: ConversationId,
		sequence: Seq,
	},

	#[error("message already deleted: conversation={conversation} sequence={sequence}")]
	AlreadyDeleted {
		conversation: ConversationId,
		sequence: Seq,
	},

	#[error("store unavailable: {0}")]
	Unavailable(#[source] anyhow::Error),
}

/// Result of `append`. The append itself never fails on a dangling reply
/// reference; the outcome records whether it resolved.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
	pub message: Message,
	pub reply_resolved: bool,
}

/// Optional narrowing criteria for `filter`.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
	pub author: Option<UserId>,
	pub from_unix_ms: Option<i64>,
	pub until_unix_ms: Option<i64>,
}

/// Durable per-conversation message log.
///
/// Sequences are assigned under per-conversation serialization: strictly
/// increasing and gapless, starting at 1. Deletion marks are per viewer and
/// never remove the message itself.
#[async_trait]
pub trait MessageStore: Send + Sync {
	async fn append(
		&self,
		conversation: ConversationId,
		author: UserId,
		body: String,
		reply_to: Option<Seq>,
	) -> Result<AppendOutcome, StoreError>;

	/// Messages strictly below `before_sequence`, descending, at most `limit`.
	async fn range(
		&self,
		conversation: ConversationId,
		before_sequence: Seq,
		limit: usize,
	) -> Result<Vec<Message>, StoreError>;

	async fn get(&self, conversation: ConversationId, sequence: Seq) -> Result<Message, StoreError>;

	/// Number of stored messages replying to `sequence`.
	async fn count_replies(&self, conversation: ConversationId, sequence: Seq) -> Result<u64, StoreError>;

	/// Messages matching `filter`, ascending, excluding the viewer's deleted set.
	async fn filter(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		filter: MessageFilter,
	) -> Result<Vec<Message>, StoreError>;

	/// Highest assigned sequence; `Seq::ZERO` when the conversation is empty.
	async fn head(&self, conversation: ConversationId) -> Result<Seq, StoreError>;

	/// Latest messages excluding the viewer's deleted set, descending.
	async fn recent(&self, conversation: ConversationId, viewer: UserId, limit: usize) -> Result<Vec<Message>, StoreError>;

	async fn mark_deleted(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<(), StoreError>;

	async fn deleted_set(&self, conversation: ConversationId, member: UserId) -> Result<HashSet<Seq>, StoreError>;
}

#[derive(Debug, Default)]
struct ConversationLog {
	/// Index `i` holds the message with sequence `i + 1`.
	messages: Vec<Message>,
	deleted: HashMap<UserId, HashSet<Seq>>,
}

impl ConversationLog {
	fn is_deleted_for(&self, viewer: UserId, sequence: Seq) -> bool {
		self.deleted.get(&viewer).is_some_and(|set| set.contains(&sequence))
	}
}

/// In-memory backend. The outer lock only resolves the conversation entry;
/// appends to different conversations never serialize against each other.
#[derive(Default)]
pub struct InMemoryMessageStore {
	conversations: Mutex<HashMap<ConversationId, Arc<Mutex<ConversationLog>>>>,
}

impl InMemoryMessageStore {
	pub fn new() -> Self {
		Self::default()
	}

	async fn log(&self, conversation: ConversationId) -> Arc<Mutex<ConversationLog>> {
		let mut conversations = self.conversations.lock().await;
		Arc::clone(conversations.entry(conversation).or_default())
	}
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn append(
		&self,
		conversation: ConversationId,
		author: UserId,
		body: String,
		reply_to: Option<Seq>,
	) -> Result<AppendOutcome, StoreError> {
		let log = self.log(conversation).await;
		let mut log = log.lock().await;

		let head = log.messages.len() as u64;
		let reply_resolved = match reply_to {
			Some(target) => target.get() >= 1 && target.get() <= head,
			None => true,
		};

		let message = Message {
			conversation_id: conversation,
			sequence: Seq::new(head + 1),
			author_id: author,
			body,
			reply_to,
			created_at_unix_ms: unix_ms_now(),
		};
		log.messages.push(message.clone());

		Ok(AppendOutcome { message, reply_resolved })
	}

	async fn range(
		&self,
		conversation: ConversationId,
		before_sequence: Seq,
		limit: usize,
	) -> Result<Vec<Message>, StoreError> {
		let log = self.log(conversation).await;
		let log = log.lock().await;

		let below = before_sequence.get().saturating_sub(1).min(log.messages.len() as u64) as usize;
		Ok(log.messages[..below].iter().rev().take(limit).cloned().collect())
	}

	async fn get(&self, conversation: ConversationId, sequence: Seq) -> Result<Message, StoreError> {
		let log = self.log(conversation).await;
		let log = log.lock().await;

		if sequence.get() == 0 {
			return Err(StoreError::NotFound { conversation, sequence });
		}

		log.messages
			.get((sequence.get() - 1) as usize)
			.cloned()
			.ok_or(StoreError::NotFound { conversation, sequence })
	}

	async fn count_replies(&self, conversation: ConversationId, sequence: Seq) -> Result<u64, StoreError> {
		let log = self.log(conversation).await;
		let log = log.lock().await;

		Ok(log.messages.iter().filter(|m| m.reply_to == Some(sequence)).count() as u64)
	}

	async fn filter(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		filter: MessageFilter,
	) -> Result<Vec<Message>, StoreError> {
		let log = self.log(conversation).await;
		let log = log.lock().await;

		Ok(log
			.messages
			.iter()
			.filter(|m| !log.is_deleted_for(viewer, m.sequence))
			.filter(|m| filter.author.is_none_or(|a| m.author_id == a))
			.filter(|m| filter.from_unix_ms.is_none_or(|t| m.created_at_unix_ms >= t))
			.filter(|m| filter.until_unix_ms.is_none_or(|t| m.created_at_unix_ms <= t))
			.cloned()
			.collect())
	}

	async fn head(&self, conversation: ConversationId) -> Result<Seq, StoreError> {
		let log = self.log(conversation).await;
		let log = log.lock().await;
		Ok(Seq::new(log.messages.len() as u64))
	}

	async fn recent(&self, conversation: ConversationId, viewer: UserId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let log = self.log(conversation).await;
		let log = log.lock().await;

		Ok(log
			.messages
			.iter()
			.rev()
			.filter(|m| !log.is_deleted_for(viewer, m.sequence))
			.take(limit)
			.cloned()
			.collect())
	}

	async fn mark_deleted(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<(), StoreError> {
		let log = self.log(conversation).await;
		let mut log = log.lock().await;

		if sequence.get() == 0 || sequence.get() > log.messages.len() as u64 {
			return Err(StoreError::NotFound { conversation, sequence });
		}

		if !log.deleted.entry(member).or_default().insert(sequence) {
			return Err(StoreError::AlreadyDeleted { conversation, sequence });
		}

		Ok(())
	}

	async fn deleted_set(&self, conversation: ConversationId, member: UserId) -> Result<HashSet<Seq>, StoreError> {
		let log = self.log(conversation).await;
		let log = log.lock().await;
		Ok(log.deleted.get(&member).cloned().unwrap_or_default())
	}
}
