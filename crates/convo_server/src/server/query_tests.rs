#![forbid(unsafe_code)]

use std::sync::Arc;

use convo_domain::{ConversationId, ConversationInfo, ConversationKind, Seq, UserId};

use crate::server::directory::{MembershipDirectory, ProfileStore, StaticDirectory};
use crate::server::query::{HISTORY_PAGE_SIZE, QueryService, Readership, UNREAD_RECENT_LIMIT};
use crate::server::store::{InMemoryMessageStore, MessageStore, StoreError};
use crate::server::tracker::{InMemoryReadTracker, ReadTracker};

const DIRECT: ConversationId = ConversationId::new(10);
const GROUP: ConversationId = ConversationId::new(20);

fn user(id: u64) -> UserId {
	UserId::new(id)
}

struct Fixture {
	store: Arc<InMemoryMessageStore>,
	tracker: Arc<InMemoryReadTracker>,
	query: QueryService,
}

fn fixture() -> Fixture {
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

	let query = QueryService::new(
		Arc::clone(&store) as Arc<dyn MessageStore>,
		Arc::clone(&tracker) as Arc<dyn ReadTracker>,
		Arc::clone(&dir) as Arc<dyn MembershipDirectory>,
		dir as Arc<dyn ProfileStore>,
	);

	Fixture { store, tracker, query }
}

async fn seed(store: &InMemoryMessageStore, conversation: ConversationId, count: u64) {
	for i in 0..count {
		store
			.append(conversation, user(1 + i % 2), format!("m{}", i + 1), None)
			.await
			.expect("append");
	}
}

#[tokio::test]
async fn history_page_is_descending_and_full() {
	let fx = fixture();
	seed(&fx.store, GROUP, 30).await;

	let page = fx.query.history_page(GROUP, user(1), Seq::new(31)).await.expect("history");
	assert_eq!(page.len(), HISTORY_PAGE_SIZE);

	let seqs: Vec<u64> = page.iter().map(|v| v.message.sequence.get()).collect();
	assert_eq!(seqs, (19..=30).rev().collect::<Vec<_>>());
	assert_eq!(page[0].message.author_name, "grace");
}

#[tokio::test]
async fn history_page_backfills_past_viewer_deletions() {
	let fx = fixture();
	seed(&fx.store, GROUP, 30).await;
	fx.store.mark_deleted(GROUP, user(1), Seq::new(25)).await.expect("delete");

	let page = fx.query.history_page(GROUP, user(1), Seq::new(31)).await.expect("history");
	assert_eq!(page.len(), HISTORY_PAGE_SIZE, "deleted entries are backfilled from older history");

	let seqs: Vec<u64> = page.iter().map(|v| v.message.sequence.get()).collect();
	assert!(!seqs.contains(&25));
	assert_eq!(*seqs.last().unwrap(), 18);

	// Another member still sees the full page including 25.
	let other = fx.query.history_page(GROUP, user(2), Seq::new(31)).await.expect("history");
	assert!(other.iter().any(|v| v.message.sequence == Seq::new(25)));
}

#[tokio::test]
async fn history_page_is_short_only_at_conversation_start() {
	let fx = fixture();
	seed(&fx.store, GROUP, 30).await;

	let page = fx.query.history_page(GROUP, user(1), Seq::new(5)).await.expect("history");
	let seqs: Vec<u64> = page.iter().map(|v| v.message.sequence.get()).collect();
	assert_eq!(seqs, vec![4, 3, 2, 1]);
}

#[tokio::test]
async fn unread_counts_skip_deletions_inside_the_window() {
	let fx = fixture();
	seed(&fx.store, GROUP, 5).await;

	fx.tracker.advance(GROUP, user(1), Seq::new(2)).await.expect("advance");
	// One deletion inside (read_through, head], one below it.
	fx.store.mark_deleted(GROUP, user(1), Seq::new(4)).await.expect("delete");
	fx.store.mark_deleted(GROUP, user(1), Seq::new(1)).await.expect("delete");

	let summaries = fx.query.unread_summaries(user(1), &[GROUP]).await.expect("summaries");
	assert_eq!(summaries.len(), 1);
	assert_eq!(summaries[0].conversation_id, GROUP);
	assert_eq!(summaries[0].unread_count, 2, "head 5 - read 2 - 1 deleted in window");

	let recent_seqs: Vec<u64> = summaries[0].recent.iter().map(|v| v.message.sequence.get()).collect();
	assert_eq!(recent_seqs, vec![5, 3, 2], "recent preview excludes the viewer's deletions");
	assert!(summaries[0].recent.len() <= UNREAD_RECENT_LIMIT);
}

#[tokio::test]
async fn unread_count_is_zero_when_caught_up() {
	let fx = fixture();
	seed(&fx.store, GROUP, 3).await;
	fx.tracker.advance(GROUP, user(2), Seq::new(3)).await.expect("advance");

	let summaries = fx.query.unread_summaries(user(2), &[GROUP]).await.expect("summaries");
	assert_eq!(summaries[0].unread_count, 0);
}

#[tokio::test]
async fn reply_context_spans_six_before_the_target() {
	let fx = fixture();
	for i in 0..30u64 {
		let reply_to = if i == 10 { Some(Seq::new(5)) } else { None };
		fx.store
			.append(GROUP, user(1), format!("m{}", i + 1), reply_to)
			.await
			.expect("append");
	}

	// Target 10, paging below 12: sequences [4, 12), newest first.
	let (error, messages) = fx
		.query
		.reply_context(GROUP, user(1), Seq::new(10), Seq::new(12))
		.await
		.expect("reply context");
	assert!(!error);

	let seqs: Vec<u64> = messages.iter().map(|v| v.message.sequence.get()).collect();
	assert_eq!(seqs, (4..=11).rev().collect::<Vec<_>>());

	// Message 11 replies to 5; its preview is attached.
	let annotated = messages.iter().find(|v| v.message.sequence == Seq::new(11)).unwrap();
	let replied = annotated.replied.as_ref().expect("replied preview");
	assert_eq!(replied.sequence, Seq::new(5));
	assert_eq!(replied.body, "m5");
	assert_eq!(replied.author_name, "ada");

	assert!(messages.iter().filter(|v| v.message.sequence != Seq::new(11)).all(|v| v.replied.is_none()));
}

#[tokio::test]
async fn reply_context_window_is_floored_at_the_first_sequence() {
	let fx = fixture();
	seed(&fx.store, GROUP, 10).await;

	let (error, messages) = fx
		.query
		.reply_context(GROUP, user(1), Seq::new(3), Seq::new(6))
		.await
		.expect("reply context");
	assert!(!error);

	let seqs: Vec<u64> = messages.iter().map(|v| v.message.sequence.get()).collect();
	assert_eq!(seqs, vec![5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn reply_context_clamps_oversized_page_cursors() {
	let fx = fixture();
	seed(&fx.store, GROUP, 10).await;

	let (error, messages) = fx
		.query
		.reply_context(GROUP, user(1), Seq::new(8), Seq::new(u64::MAX))
		.await
		.expect("reply context");
	assert!(!error);

	let seqs: Vec<u64> = messages.iter().map(|v| v.message.sequence.get()).collect();
	assert_eq!(seqs, (2..=10).rev().collect::<Vec<_>>(), "cursor is clamped to just past the head");
}

#[tokio::test]
async fn history_and_unread_entries_carry_replied_previews() {
	let fx = fixture();
	fx.store.append(GROUP, user(1), "root".to_string(), None).await.expect("append");
	fx.store
		.append(GROUP, user(2), "re".to_string(), Some(Seq::new(1)))
		.await
		.expect("append");

	let page = fx.query.history_page(GROUP, user(1), Seq::new(3)).await.expect("history");
	let reply = page.iter().find(|v| v.message.sequence == Seq::new(2)).unwrap();
	let replied = reply.replied.as_ref().expect("replied preview");
	assert_eq!(replied.sequence, Seq::new(1));
	assert_eq!(replied.body, "root");
	assert_eq!(replied.author_name, "ada");

	let summaries = fx.query.unread_summaries(user(3), &[GROUP]).await.expect("summaries");
	let reply = summaries[0]
		.recent
		.iter()
		.find(|v| v.message.sequence == Seq::new(2))
		.unwrap();
	assert!(reply.replied.is_some(), "unread previews resolve reply references too");

	// A viewer who deleted the target sees the reply without its preview.
	fx.store.mark_deleted(GROUP, user(2), Seq::new(1)).await.expect("delete");
	let page = fx.query.history_page(GROUP, user(2), Seq::new(3)).await.expect("history");
	let reply = page.iter().find(|v| v.message.sequence == Seq::new(2)).unwrap();
	assert!(reply.replied.is_none());
}

#[tokio::test]
async fn reply_context_reports_unavailable_targets() {
	let fx = fixture();
	seed(&fx.store, GROUP, 10).await;

	let (error, messages) = fx
		.query
		.reply_context(GROUP, user(1), Seq::new(50), Seq::new(6))
		.await
		.expect("reply context");
	assert!(error);
	assert!(messages.is_empty());

	fx.store.mark_deleted(GROUP, user(1), Seq::new(3)).await.expect("delete");
	let (error, messages) = fx
		.query
		.reply_context(GROUP, user(1), Seq::new(3), Seq::new(6))
		.await
		.expect("reply context");
	assert!(error, "a viewer-deleted target is treated as unavailable");
	assert!(messages.is_empty());
}

#[tokio::test]
async fn direct_detail_reports_the_other_members_read_state() {
	let fx = fixture();
	fx.store.append(DIRECT, user(1), "hi".to_string(), None).await.expect("append");

	let detail = fx.query.message_detail(DIRECT, user(1), Seq::new(1)).await.expect("detail");
	match detail.readership {
		Readership::Direct { is_read } => assert!(!is_read),
		other => panic!("expected direct readership, got: {other:?}"),
	}

	fx.tracker.advance(DIRECT, user(2), Seq::new(1)).await.expect("advance");

	let detail = fx.query.message_detail(DIRECT, user(1), Seq::new(1)).await.expect("detail");
	match detail.readership {
		Readership::Direct { is_read } => assert!(is_read),
		other => panic!("expected direct readership, got: {other:?}"),
	}
}

#[tokio::test]
async fn group_detail_lists_every_member_whose_mark_covers_it() {
	let fx = fixture();
	fx.store.append(GROUP, user(1), "hi".to_string(), None).await.expect("append");
	fx.store
		.append(GROUP, user(2), "re".to_string(), Some(Seq::new(1)))
		.await
		.expect("append");

	fx.tracker.advance(GROUP, user(1), Seq::new(2)).await.expect("advance");
	fx.tracker.advance(GROUP, user(2), Seq::new(1)).await.expect("advance");

	let detail = fx.query.message_detail(GROUP, user(2), Seq::new(1)).await.expect("detail");
	assert_eq!(detail.reply_count, 1);
	match detail.readership {
		Readership::Group { readers } => {
			let names: Vec<&str> = readers.iter().map(|r| r.name.as_str()).collect();
			assert_eq!(names, vec!["ada", "grace"], "the author counts as a reader, lin has not caught up");
		}
		other => panic!("expected group readership, got: {other:?}"),
	}
}

#[tokio::test]
async fn direct_detail_excludes_the_requester_not_the_author() {
	let fx = fixture();
	fx.store.append(DIRECT, user(1), "hi".to_string(), None).await.expect("append");
	fx.tracker.advance(DIRECT, user(1), Seq::new(1)).await.expect("advance");

	// grace asks about ada's message: the detail reflects ada's mark, not
	// grace's own.
	let detail = fx.query.message_detail(DIRECT, user(2), Seq::new(1)).await.expect("detail");
	match detail.readership {
		Readership::Direct { is_read } => assert!(is_read, "the other member relative to the requester is ada"),
		other => panic!("expected direct readership, got: {other:?}"),
	}
}

#[tokio::test]
async fn detail_of_a_viewer_deleted_message_is_not_found() {
	let fx = fixture();
	fx.store.append(GROUP, user(1), "hi".to_string(), None).await.expect("append");
	fx.store.mark_deleted(GROUP, user(2), Seq::new(1)).await.expect("delete");

	let err = fx.query.message_detail(GROUP, user(2), Seq::new(1)).await.unwrap_err();
	assert!(matches!(err, StoreError::NotFound { .. }));

	// The author still sees it.
	assert!(fx.query.message_detail(GROUP, user(1), Seq::new(1)).await.is_ok());
}

#[tokio::test]
async fn room_infos_substitute_the_other_member_for_direct_conversations() {
	let fx = fixture();

	let rooms = fx.query.room_infos(user(1), &[DIRECT, GROUP]).await;
	assert_eq!(rooms.len(), 2);
	assert_eq!(rooms[0].name, "grace");
	assert_eq!(rooms[0].kind, ConversationKind::Direct);
	assert_eq!(rooms[1].name, "ops");
}
