#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use convo_protocol::framing::DEFAULT_MAX_FRAME_SIZE;
use convo_protocol::{ClientFrame, ServerFrame, close, encode_frame, try_decode_frame_from_buffer};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::server::auth::Authenticator;
use crate::server::delivery::{DeliveryConfig, DeliveryEngine};
use crate::server::directory::MembershipDirectory;
use crate::server::hub::{FanoutHub, FanoutItem};
use crate::server::query::QueryService;
use crate::server::session::{Session, SessionError};
use crate::server::store::MessageStore;
use crate::server::tracker::ReadTracker;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	pub fan_in_channel_capacity: usize,

	pub outbound_channel_capacity: usize,

	/// How long to wait for the credential-carrying first frame.
	pub hello_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			fan_in_channel_capacity: 1024,
			outbound_channel_capacity: 256,
			hello_timeout: Duration::from_secs(30),
		}
	}
}

/// Shared services handed to every connection.
#[derive(Clone)]
pub struct ConnectionDeps {
	pub authenticator: Arc<dyn Authenticator>,
	pub directory: Arc<dyn MembershipDirectory>,
	pub store: Arc<dyn MessageStore>,
	pub tracker: Arc<dyn ReadTracker>,
	pub query: Arc<QueryService>,
	pub hub: FanoutHub,
	pub delivery_cfg: DeliveryConfig,
}

fn close_with(connection: &quinn::Connection, code: u32, reason: &'static [u8]) {
	connection.close(quinn::VarInt::from_u32(code), reason);
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	deps: ConnectionDeps,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("convo_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("convo_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send_stream, mut recv_stream) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ClientFrame>();
	let max_frame_bytes = settings.max_frame_bytes;
	let connection_for_reader = connection.clone();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv_stream.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("convo_server_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer::<ClientFrame>(&mut buf, max_frame_bytes) {
					Ok(Some(frame)) => {
						metrics::counter!("convo_server_frames_in_total").increment(1);

						if ctrl_tx.send(frame).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("convo_server_decode_errors_total").increment(1);
						close_with(&connection_for_reader, close::PROTOCOL_VIOLATION, b"malformed frame");
						return Err(anyhow!(e).context("failed to decode frame"));
					}
				}
			}
		}
	});

	let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(settings.outbound_channel_capacity);
	let writer_task = tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			let bytes = match encode_frame(&frame, max_frame_bytes) {
				Ok(bytes) => bytes,
				Err(e) => {
					warn!(error = %e, "dropping outbound frame that failed to encode");
					continue;
				}
			};

			if let Err(e) = send_stream.write_all(&bytes).await {
				debug!(error = %e, "outbound stream closed");
				return;
			}

			metrics::counter!("convo_server_bytes_out_total").increment(bytes.len() as u64);
		}
	});

	let credential = match timeout(settings.hello_timeout, ctrl_rx.recv()).await {
		Ok(Some(ClientFrame::Hello { credential })) => credential,
		Ok(Some(other)) => {
			warn!(conn_id, frame = ?other, "first frame was not hello");
			close_with(&connection, close::PROTOCOL_VIOLATION, b"expected hello");
			return Ok(());
		}
		Ok(None) => return Ok(()),
		Err(_) => {
			warn!(conn_id, "no hello frame before timeout");
			close_with(&connection, close::AUTH_FAILED, b"no credential");
			return Ok(());
		}
	};

	let user_id = match deps.authenticator.authenticate(&credential).await {
		Ok(user_id) => user_id,
		Err(e) => {
			warn!(conn_id, error = %e, "credential rejected");
			metrics::counter!("convo_server_auth_failures_total").increment(1);
			close_with(&connection, close::AUTH_FAILED, b"invalid credential");
			return Ok(());
		}
	};

	info!(conn_id, user = %user_id, remote = %connection.remote_address(), "session authenticated");
	metrics::counter!("convo_server_sessions_total").increment(1);

	let conversations: HashSet<_> = deps.directory.conversations_of(user_id).await.into_iter().collect();

	let (fan_in_tx, mut fan_in_rx) = mpsc::channel::<FanoutItem>(settings.fan_in_channel_capacity);
	let mut forward_tasks = Vec::with_capacity(conversations.len());
	for &conversation in &conversations {
		let mut rx = deps.hub.subscribe(conversation).await;
		let tx = fan_in_tx.clone();
		forward_tasks.push(tokio::spawn(async move {
			while let Some(item) = rx.recv().await {
				if tx.send(item).await.is_err() {
					break;
				}
			}
		}));
	}
	drop(fan_in_tx);

	let delivery = Arc::new(DeliveryEngine::new(out_tx.clone(), deps.delivery_cfg.clone()));

	let mut session = Session::new(
		conn_id,
		user_id,
		conversations,
		Arc::clone(&deps.store),
		Arc::clone(&deps.tracker),
		Arc::clone(&deps.query),
		deps.hub.clone(),
		Arc::clone(&delivery),
		out_tx.clone(),
	);

	if let Err(e) = session.announce().await {
		warn!(conn_id, error = %e, "failed to announce session");
	}

	loop {
		tokio::select! {
			frame = ctrl_rx.recv() => {
				let Some(frame) = frame else {
					break;
				};

				match session.handle_frame(frame).await {
					Ok(()) => {}
					Err(SessionError::Protocol(msg)) => {
						warn!(conn_id, %msg, "closing on protocol violation");
						close_with(&connection, close::PROTOCOL_VIOLATION, b"protocol violation");
						break;
					}
					Err(SessionError::Internal(e)) => {
						warn!(conn_id, error = %e, "session error; closing");
						break;
					}
				}
			}
			item = fan_in_rx.recv() => {
				let Some(item) = item else {
					break;
				};

				if let Err(e) = session.handle_fanout(item).await {
					warn!(conn_id, error = %e, "fanout delivery failed; closing");
					break;
				}
			}
		}
	}

	delivery.shutdown().await;
	for task in forward_tasks {
		task.abort();
	}
	reader_task.abort();
	drop(session);
	drop(delivery);
	drop(out_tx);
	let _ = writer_task.await;

	info!(conn_id, user = %user_id, "session closed");
	Ok(())
}
