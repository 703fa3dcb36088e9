#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use convo_domain::{ConversationId, Message, Seq, UserId};
use convo_protocol::{MessageView, ReaderView, RepliedMessageView, RepliedPreview, RoomInfoView, UnreadSummaryView};

use crate::server::directory::{MembershipDirectory, ProfileStore};
use crate::server::store::{MessageStore, StoreError};
use crate::server::tracker::ReadTracker;

/// Messages per history page.
pub const HISTORY_PAGE_SIZE: usize = 12;

/// Preceding messages included in a reply context window.
pub const REPLY_CONTEXT_WINDOW: u64 = 6;

/// Recent messages attached to each unread summary.
pub const UNREAD_RECENT_LIMIT: usize = 8;

/// Who has seen a message, shaped by conversation kind.
#[derive(Debug, Clone)]
pub enum Readership {
	/// 1:1: whether the member other than the requester has read it.
	Direct { is_read: bool },
	/// Group: every member whose mark covers it, the author included.
	Group { readers: Vec<ReaderView> },
}

#[derive(Debug, Clone)]
pub struct MessageDetail {
	pub conversation_id: ConversationId,
	pub sequence: Seq,
	pub reply_count: u64,
	pub sent_at_unix_ms: i64,
	pub readership: Readership,
}

/// Stateless reads over store, tracker, directory and profiles. Every method
/// excludes the requesting member's deleted set.
pub struct QueryService {
	store: Arc<dyn MessageStore>,
	tracker: Arc<dyn ReadTracker>,
	directory: Arc<dyn MembershipDirectory>,
	profiles: Arc<dyn ProfileStore>,
}

impl QueryService {
	pub fn new(
		store: Arc<dyn MessageStore>,
		tracker: Arc<dyn ReadTracker>,
		directory: Arc<dyn MembershipDirectory>,
		profiles: Arc<dyn ProfileStore>,
	) -> Self {
		Self {
			store,
			tracker,
			directory,
			profiles,
		}
	}

	pub async fn view(&self, message: Message) -> MessageView {
		let profile = self.profiles.profile(message.author_id).await;
		MessageView {
			conversation_id: message.conversation_id,
			sequence: message.sequence,
			author_id: message.author_id,
			author_name: profile.name,
			author_avatar: profile.avatar,
			body: message.body,
			reply_to: message.reply_to,
			sent_at_unix_ms: message.created_at_unix_ms,
		}
	}

	/// Resolve the replied-to preview for a reply reference. Targets the
	/// viewer deleted, or that never resolved, yield nothing.
	async fn replied_preview(
		&self,
		conversation: ConversationId,
		reply_to: Option<Seq>,
		deleted: &HashSet<Seq>,
	) -> Result<Option<RepliedPreview>, StoreError> {
		let Some(target) = reply_to else {
			return Ok(None);
		};
		if deleted.contains(&target) {
			return Ok(None);
		}

		match self.store.get(conversation, target).await {
			Ok(t) => {
				let profile = self.profiles.profile(t.author_id).await;
				Ok(Some(RepliedPreview {
					sequence: t.sequence,
					author_name: profile.name,
					body: t.body,
				}))
			}
			Err(StoreError::NotFound { .. }) => Ok(None),
			Err(e) => Err(e),
		}
	}

	async fn annotated_view(&self, message: Message, deleted: &HashSet<Seq>) -> Result<RepliedMessageView, StoreError> {
		let replied = self
			.replied_preview(message.conversation_id, message.reply_to, deleted)
			.await?;
		Ok(RepliedMessageView {
			message: self.view(message).await,
			replied,
		})
	}

	/// One page of history strictly below `before`, descending, each entry
	/// carrying its replied-to preview when resolvable. Viewer-deleted
	/// messages are skipped and backfilled from older sequences, so a short
	/// page means the conversation start was reached.
	pub async fn history_page(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		before: Seq,
	) -> Result<Vec<RepliedMessageView>, StoreError> {
		let deleted = self.store.deleted_set(conversation, viewer).await?;
		let mut out = Vec::with_capacity(HISTORY_PAGE_SIZE);
		let mut cursor = before;

		loop {
			let batch = self.store.range(conversation, cursor, HISTORY_PAGE_SIZE).await?;
			let Some(last) = batch.last() else {
				break;
			};
			let next_cursor = last.sequence;

			for message in batch {
				if deleted.contains(&message.sequence) {
					continue;
				}
				out.push(self.annotated_view(message, &deleted).await?);
				if out.len() == HISTORY_PAGE_SIZE {
					return Ok(out);
				}
			}

			cursor = next_cursor;
		}

		Ok(out)
	}

	pub async fn message_detail(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		sequence: Seq,
	) -> Result<MessageDetail, StoreError> {
		let deleted = self.store.deleted_set(conversation, viewer).await?;
		if deleted.contains(&sequence) {
			return Err(StoreError::NotFound { conversation, sequence });
		}

		let message = self.store.get(conversation, sequence).await?;
		let reply_count = self.store.count_replies(conversation, sequence).await?;

		let members = self.directory.members_of(conversation).await;
		let info = self.directory.conversation_info(conversation, viewer).await;

		let readership = match info.map(|i| i.kind) {
			Some(convo_domain::ConversationKind::Direct) => {
				// Read state of the member the requester is talking to, which
				// for the author's own messages is the recipient.
				let other = members.iter().find(|m| **m != viewer).copied();
				let is_read = match other {
					Some(member) => self.tracker.is_read(conversation, member, sequence).await?,
					None => false,
				};
				Readership::Direct { is_read }
			}
			_ => {
				let mut readers = Vec::new();
				for member in self.tracker.readers_at_least(conversation, sequence).await? {
					if !members.contains(&member) {
						continue;
					}
					let profile = self.profiles.profile(member).await;
					readers.push(ReaderView {
						user_id: member,
						name: profile.name,
					});
				}
				Readership::Group { readers }
			}
		};

		Ok(MessageDetail {
			conversation_id: conversation,
			sequence,
			reply_count,
			sent_at_unix_ms: message.created_at_unix_ms,
			readership,
		})
	}

	/// Context around a reply target: sequences in
	/// `[max(target - 6, 1), before)`, descending, each annotated with its
	/// replied-to preview when resolvable. A viewer-deleted or missing target
	/// yields the error form.
	pub async fn reply_context(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		target: Seq,
		before: Seq,
	) -> Result<(bool, Vec<RepliedMessageView>), StoreError> {
		let deleted = self.store.deleted_set(conversation, viewer).await?;
		if deleted.contains(&target) {
			return Ok((true, Vec::new()));
		}
		match self.store.get(conversation, target).await {
			Ok(_) => {}
			Err(StoreError::NotFound { .. }) => return Ok((true, Vec::new())),
			Err(e) => return Err(e),
		}

		// The client picks the page cursor; clamp it to the head so the span
		// below never outgrows the conversation.
		let head = self.store.head(conversation).await?;
		let before = before.min(Seq::new(head.get().saturating_add(1)));

		let start = target.back(REPLY_CONTEXT_WINDOW);
		let span = before.get().saturating_sub(start.get()) as usize;
		let batch = self.store.range(conversation, before, span).await?;

		let mut out = Vec::new();
		for message in batch {
			if message.sequence < start {
				break;
			}
			if deleted.contains(&message.sequence) {
				continue;
			}
			out.push(self.annotated_view(message, &deleted).await?);
		}

		Ok((false, out))
	}

	/// Per-conversation unread count plus a short recent preview. Sequences
	/// are gapless, so the count is `head - read_through` minus the viewer's
	/// deletions inside that window.
	pub async fn unread_summaries(
		&self,
		viewer: UserId,
		conversations: &[ConversationId],
	) -> Result<Vec<UnreadSummaryView>, StoreError> {
		let mut out = Vec::with_capacity(conversations.len());

		for &conversation in conversations {
			let head = self.store.head(conversation).await?;
			let read_through = self.tracker.read_through(conversation, viewer).await?;
			let deleted = self.store.deleted_set(conversation, viewer).await?;

			let deleted_unread = deleted.iter().filter(|s| **s > read_through && **s <= head).count() as u64;
			let unread_count = head
				.get()
				.saturating_sub(read_through.get())
				.saturating_sub(deleted_unread);

			let mut recent = Vec::new();
			for message in self.store.recent(conversation, viewer, UNREAD_RECENT_LIMIT).await? {
				recent.push(self.annotated_view(message, &deleted).await?);
			}

			out.push(UnreadSummaryView {
				conversation_id: conversation,
				unread_count,
				recent,
			});
		}

		Ok(out)
	}

	pub async fn room_infos(&self, viewer: UserId, conversations: &[ConversationId]) -> Vec<RoomInfoView> {
		let mut out = Vec::with_capacity(conversations.len());

		for &conversation in conversations {
			let Some(info) = self.directory.conversation_info(conversation, viewer).await else {
				continue;
			};
			out.push(RoomInfoView {
				conversation_id: info.id,
				name: info.name,
				avatar: info.avatar,
				kind: info.kind,
			});
		}

		out
	}
}
