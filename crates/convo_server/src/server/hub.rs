#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use convo_domain::{ConversationId, Message};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-conversation hub that fans stored messages out to live subscribers.
///
/// Purely transient: no persistence, no replay. A subscriber that misses
/// items because its queue was full gets a single `Lagged` marker once it
/// drains; re-sync happens through the query service.
#[derive(Debug, Clone)]
pub struct FanoutHub {
	inner: Arc<Mutex<Inner>>,
	cfg: FanoutHubConfig,
}

#[derive(Debug, Clone)]
pub struct FanoutHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,
}

impl Default for FanoutHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum FanoutItem {
	Message(Box<Message>),

	/// Indicates the subscriber is lagging and items were dropped.
	Lagged {
		dropped: u64,
	},
}

impl FanoutHub {
	pub fn new(cfg: FanoutHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe to a conversation.
	pub async fn subscribe(&self, conversation: ConversationId) -> mpsc::Receiver<FanoutItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.conversations.entry(conversation).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.push(tx);
		entry.pending_lag_by_subscriber.push(0);

		debug!(%conversation, subs = entry.subscribers.len(), "fanout hub: subscribed");

		rx
	}

	/// Publish a stored message to every current subscriber of its
	/// conversation, the author's other connections included.
	pub async fn publish(&self, message: Message) {
		let conversation = message.conversation_id;
		self.publish_item(conversation, FanoutItem::Message(Box::new(message))).await;
	}

	async fn publish_item(&self, conversation: ConversationId, item: FanoutItem) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.conversations.get_mut(&conversation) else {
			return;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.conversations.remove(&conversation);
			return;
		}

		let mut dropped_total: u64 = 0;

		for (idx, sub) in entry.subscribers.iter_mut().enumerate() {
			match sub.try_send(item.clone()) {
				Ok(()) => {
					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx)
						&& *pending > 0 && sub.try_send(FanoutItem::Lagged { dropped: *pending }).is_ok()
					{
						*pending = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;

					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx) {
						*pending = pending.saturating_add(1);
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.conversations.remove(&conversation);
		}

		if dropped_total > 0 {
			metrics::counter!("convo_server_fanout_dropped_total").increment(dropped_total);
			debug!(
				%conversation,
				dropped = dropped_total,
				"fanout hub: dropped due to full subscriber queues"
			);
		}
	}

	/// Get a snapshot of subscriber counts per conversation.
	pub async fn subscriber_counts(&self) -> HashMap<ConversationId, usize> {
		let inner = self.inner.lock().await;
		inner
			.conversations
			.iter()
			.map(|(k, v)| (*k, v.subscribers.iter().filter(|s| !s.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	conversations: HashMap<ConversationId, ConversationEntry>,
}

#[derive(Debug, Default)]
struct ConversationEntry {
	subscribers: Vec<mpsc::Sender<FanoutItem>>,

	/// Pending lag markers per subscriber.
	pending_lag_by_subscriber: Vec<u64>,
}

fn prune_closed_subscribers(entry: &mut ConversationEntry) {
	if entry.subscribers.len() != entry.pending_lag_by_subscriber.len() {
		entry.pending_lag_by_subscriber.resize(entry.subscribers.len(), 0);
	}

	let mut new_subs = Vec::with_capacity(entry.subscribers.len());
	let mut new_lag = Vec::with_capacity(entry.subscribers.len());

	for (idx, s) in entry.subscribers.drain(..).enumerate() {
		if !s.is_closed() {
			new_subs.push(s);
			new_lag.push(*entry.pending_lag_by_subscriber.get(idx).unwrap_or(&0));
		}
	}

	entry.subscribers = new_subs;
	entry.pending_lag_by_subscriber = new_lag;
}
