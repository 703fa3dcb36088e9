#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use convo_domain::DeliveryId;
use convo_protocol::ServerFrame;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
	pub retry_interval: Duration,

	/// Retransmissions after the initial send. The timer after the last
	/// retransmission fires `retry_failed` instead of another copy.
	pub max_attempts: u32,
}

impl Default for DeliveryConfig {
	fn default() -> Self {
		Self {
			retry_interval: Duration::from_secs(5),
			max_attempts: 3,
		}
	}
}

struct Pending {
	frame: ServerFrame,
	attempts: u32,
	cancel: oneshot::Sender<()>,
}

/// Session-scoped at-least-once delivery over the connection's outbound
/// channel. One retry task per pending frame; ids never repeat within a
/// session and die with it.
pub struct DeliveryEngine {
	outbound: mpsc::Sender<ServerFrame>,
	pending: Arc<Mutex<HashMap<DeliveryId, Pending>>>,
	next_id: AtomicU64,
	cfg: DeliveryConfig,
}

impl DeliveryEngine {
	pub fn new(outbound: mpsc::Sender<ServerFrame>, cfg: DeliveryConfig) -> Self {
		Self {
			outbound,
			pending: Arc::new(Mutex::new(HashMap::new())),
			next_id: AtomicU64::new(0),
			cfg,
		}
	}

	/// Allocate the next delivery id for this session.
	pub fn allocate(&self) -> DeliveryId {
		DeliveryId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
	}

	/// Send `frame` and keep retransmitting it until acknowledged or the
	/// attempt budget is spent. The frame must carry a delivery id.
	pub async fn deliver(&self, frame: ServerFrame) -> anyhow::Result<()> {
		let Some(id) = frame.delivery_id() else {
			return Err(anyhow!("frame is not ack-tracked"));
		};

		let (cancel_tx, cancel_rx) = oneshot::channel();
		{
			let mut pending = self.pending.lock().await;
			pending.insert(id, Pending {
				frame: frame.clone(),
				attempts: 0,
				cancel: cancel_tx,
			});
		}

		self.outbound
			.send(frame)
			.await
			.map_err(|_| anyhow!("outbound channel closed"))?;

		metrics::counter!("convo_server_deliveries_total").increment(1);

		let pending = Arc::clone(&self.pending);
		let outbound = self.outbound.clone();
		let cfg = self.cfg.clone();
		tokio::spawn(retry_loop(pending, outbound, id, cfg, cancel_rx));

		Ok(())
	}

	/// Handle a client ack. Unknown or duplicate ids are no-ops.
	pub async fn ack(&self, id: DeliveryId) -> bool {
		let removed = {
			let mut pending = self.pending.lock().await;
			pending.remove(&id)
		};

		match removed {
			Some(entry) => {
				let _ = entry.cancel.send(());
				metrics::counter!("convo_server_delivery_acks_total").increment(1);
				true
			}
			None => {
				debug!(delivery_id = %id, "ack for unknown delivery id ignored");
				false
			}
		}
	}

	/// Drop all pending deliveries and stop their retry tasks.
	pub async fn shutdown(&self) {
		let drained = {
			let mut pending = self.pending.lock().await;
			std::mem::take(&mut *pending)
		};

		for (_, entry) in drained {
			let _ = entry.cancel.send(());
		}
	}

	pub async fn pending_len(&self) -> usize {
		self.pending.lock().await.len()
	}
}

async fn retry_loop(
	pending: Arc<Mutex<HashMap<DeliveryId, Pending>>>,
	outbound: mpsc::Sender<ServerFrame>,
	id: DeliveryId,
	cfg: DeliveryConfig,
	mut cancel: oneshot::Receiver<()>,
) {
	loop {
		tokio::select! {
			_ = &mut cancel => return,
			_ = tokio::time::sleep(cfg.retry_interval) => {}
		}

		// Reserve outbound capacity before touching the map: a slow client
		// must never block `ack`/`deliver` behind this task's lock.
		let Ok(permit) = outbound.reserve().await else {
			pending.lock().await.remove(&id);
			return;
		};

		// The entry must be verifiably present before any retransmission;
		// the permit send below is synchronous, so nothing awaits under the
		// lock and an ack racing this loop wins cleanly.
		let mut guard = pending.lock().await;
		let Some(entry) = guard.get_mut(&id) else {
			return;
		};

		if entry.attempts >= cfg.max_attempts {
			guard.remove(&id);

			metrics::counter!("convo_server_delivery_retry_failed_total").increment(1);
			debug!(delivery_id = %id, attempts = cfg.max_attempts, "delivery retry budget exhausted");

			permit.send(ServerFrame::RetryFailed { delivery_id: id });
			return;
		}

		entry.attempts += 1;
		let frame = entry.frame.clone();
		metrics::counter!("convo_server_delivery_retries_total").increment(1);
		permit.send(frame);
	}
}
