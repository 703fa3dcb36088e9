#![forbid(unsafe_code)]

use convo_domain::{ConversationId, Seq, UserId};

use crate::server::tracker::{InMemoryReadTracker, ReadTracker};

fn conv(id: u64) -> ConversationId {
	ConversationId::new(id)
}

fn user(id: u64) -> UserId {
	UserId::new(id)
}

#[tokio::test]
async fn marks_start_at_zero_before_first_contact() {
	let tracker = InMemoryReadTracker::new();

	assert_eq!(tracker.read_through(conv(1), user(1)).await.expect("read"), Seq::ZERO);
	assert!(!tracker.is_read(conv(1), user(1), Seq::FIRST).await.expect("is_read"));
	assert_eq!(tracker.joined_at(conv(1), user(1)).await.expect("joined"), None);
}

#[tokio::test]
async fn advance_is_monotonic_max_merge() {
	let tracker = InMemoryReadTracker::new();

	let effective = tracker.advance(conv(1), user(1), Seq::new(7)).await.expect("advance");
	assert_eq!(effective, Seq::new(7));

	// A stale update from another device merges away.
	let effective = tracker.advance(conv(1), user(1), Seq::new(3)).await.expect("advance");
	assert_eq!(effective, Seq::new(7));
	assert_eq!(tracker.read_through(conv(1), user(1)).await.expect("read"), Seq::new(7));

	let effective = tracker.advance(conv(1), user(1), Seq::new(9)).await.expect("advance");
	assert_eq!(effective, Seq::new(9));

	assert!(tracker.is_read(conv(1), user(1), Seq::new(9)).await.expect("is_read"));
	assert!(!tracker.is_read(conv(1), user(1), Seq::new(10)).await.expect("is_read"));
}

#[tokio::test]
async fn marks_are_scoped_per_conversation_and_member() {
	let tracker = InMemoryReadTracker::new();

	tracker.advance(conv(1), user(1), Seq::new(5)).await.expect("advance");

	assert_eq!(tracker.read_through(conv(2), user(1)).await.expect("read"), Seq::ZERO);
	assert_eq!(tracker.read_through(conv(1), user(2)).await.expect("read"), Seq::ZERO);
}

#[tokio::test]
async fn readers_at_least_is_sorted_and_filtered() {
	let tracker = InMemoryReadTracker::new();

	tracker.advance(conv(1), user(3), Seq::new(10)).await.expect("advance");
	tracker.advance(conv(1), user(1), Seq::new(4)).await.expect("advance");
	tracker.advance(conv(1), user(2), Seq::new(8)).await.expect("advance");
	tracker.advance(conv(2), user(4), Seq::new(100)).await.expect("advance");

	let readers = tracker.readers_at_least(conv(1), Seq::new(8)).await.expect("readers");
	assert_eq!(readers, vec![user(2), user(3)]);

	let readers = tracker.readers_at_least(conv(1), Seq::new(11)).await.expect("readers");
	assert!(readers.is_empty());
}

#[tokio::test]
async fn joined_at_is_recorded_on_first_advance() {
	let tracker = InMemoryReadTracker::new();

	tracker.advance(conv(1), user(1), Seq::ZERO).await.expect("advance");
	let joined = tracker.joined_at(conv(1), user(1)).await.expect("joined");
	assert!(joined.is_some());

	// Later advances keep the original join time.
	tracker.advance(conv(1), user(1), Seq::new(50)).await.expect("advance");
	assert_eq!(tracker.joined_at(conv(1), user(1)).await.expect("joined"), joined);
}
