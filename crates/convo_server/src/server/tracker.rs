#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use convo_domain::{ConversationId, Seq, UserId};
use tokio::sync::Mutex;

use crate::server::store::StoreError;
use crate::util::time::unix_ms_now;

/// Per-member read progress within a conversation.
///
/// `advance` is max-merge: a regression is ignored, not rejected, so late or
/// reordered updates from multiple devices can never move the mark backward.
#[async_trait]
pub trait ReadTracker: Send + Sync {
	/// Merge `sequence` into the member's mark; returns the effective mark.
	async fn advance(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<Seq, StoreError>;

	/// The member's mark; `Seq::ZERO` before first contact.
	async fn read_through(&self, conversation: ConversationId, member: UserId) -> Result<Seq, StoreError>;

	async fn is_read(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<bool, StoreError>;

	/// Members whose mark is at or beyond `sequence`.
	async fn readers_at_least(&self, conversation: ConversationId, sequence: Seq) -> Result<Vec<UserId>, StoreError>;

	/// When the member first touched this conversation, if ever.
	async fn joined_at(&self, conversation: ConversationId, member: UserId) -> Result<Option<i64>, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct MemberMark {
	read_through: Seq,
	joined_at_unix_ms: i64,
}

#[derive(Default)]
pub struct InMemoryReadTracker {
	marks: Mutex<HashMap<(ConversationId, UserId), MemberMark>>,
}

impl InMemoryReadTracker {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ReadTracker for InMemoryReadTracker {
	async fn advance(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<Seq, StoreError> {
		let mut marks = self.marks.lock().await;
		let entry = marks.entry((conversation, member)).or_insert(MemberMark {
			read_through: Seq::ZERO,
			joined_at_unix_ms: unix_ms_now(),
		});

		entry.read_through = entry.read_through.max(sequence);
		Ok(entry.read_through)
	}

	async fn read_through(&self, conversation: ConversationId, member: UserId) -> Result<Seq, StoreError> {
		let marks = self.marks.lock().await;
		Ok(marks
			.get(&(conversation, member))
			.map(|m| m.read_through)
			.unwrap_or(Seq::ZERO))
	}

	async fn is_read(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<bool, StoreError> {
		Ok(self.read_through(conversation, member).await? >= sequence)
	}

	async fn readers_at_least(&self, conversation: ConversationId, sequence: Seq) -> Result<Vec<UserId>, StoreError> {
		let marks = self.marks.lock().await;
		let mut readers = marks
			.iter()
			.filter(|((conv, _), mark)| *conv == conversation && mark.read_through >= sequence)
			.map(|((_, member), _)| *member)
			.collect::<Vec<_>>();
		readers.sort();
		Ok(readers)
	}

	async fn joined_at(&self, conversation: ConversationId, member: UserId) -> Result<Option<i64>, StoreError> {
		let marks = self.marks.lock().await;
		Ok(marks.get(&(conversation, member)).map(|m| m.joined_at_unix_ms))
	}
}
