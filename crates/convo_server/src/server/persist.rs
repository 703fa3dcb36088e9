#![forbid(unsafe_code)]

use std::collections::HashSet;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use convo_domain::{ConversationId, Message, Seq, UserId};

use crate::server::store::{AppendOutcome, MessageFilter, MessageStore, StoreError};
use crate::server::tracker::ReadTracker;
use crate::util::time::unix_ms_now;

/// sqlx-backed message store and read tracker, selected by `database_url`
/// scheme. Sequence assignment runs inside a transaction; postgres takes a
/// per-conversation advisory lock so `MAX(seq) + 1` is race-free across
/// server processes, sqlite opens the transaction `IMMEDIATE` so concurrent
/// appenders queue on the write lock instead of racing the read snapshot.
#[derive(Clone)]
pub struct PersistentStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (i64, i64, i64, String, Option<i64>, i64);

fn message_from_row(row: MessageRow) -> Message {
	Message {
		conversation_id: ConversationId::new(row.0 as u64),
		sequence: Seq::new(row.1 as u64),
		author_id: UserId::new(row.2 as u64),
		body: row.3,
		reply_to: row.4.map(|r| Seq::new(r as u64)),
		created_at_unix_ms: row.5,
	}
}

fn unavailable(e: impl Into<anyhow::Error>, what: &'static str) -> StoreError {
	StoreError::Unavailable(e.into().context(what))
}

impl PersistentStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

/// Head read plus insert, run inside an already-open immediate transaction.
/// Returns the assigned sequence and whether the reply target existed.
async fn append_sqlite(
	conn: &mut sqlx::SqliteConnection,
	conversation: ConversationId,
	author: UserId,
	body: &str,
	reply_to: Option<Seq>,
	created_at: i64,
) -> Result<(u64, bool), StoreError> {
	let (head,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = ?")
		.bind(conversation.as_u64() as i64)
		.fetch_one(&mut *conn)
		.await
		.map_err(|e| unavailable(e, "select head (sqlite)"))?;

	let sequence = head + 1;
	let reply_resolved = match reply_to {
		Some(target) => target.get() >= 1 && (target.get() as i64) <= head,
		None => true,
	};

	sqlx::query(
		"INSERT INTO messages (conversation_id, seq, author_id, body, reply_to, created_at_unix_ms) \
		VALUES (?, ?, ?, ?, ?, ?)",
	)
	.bind(conversation.as_u64() as i64)
	.bind(sequence)
	.bind(author.as_u64() as i64)
	.bind(body)
	.bind(reply_to.map(|r| r.get() as i64))
	.bind(created_at)
	.execute(&mut *conn)
	.await
	.map_err(|e| unavailable(e, "insert message (sqlite)"))?;

	Ok((sequence as u64, reply_resolved))
}

#[async_trait]
impl MessageStore for PersistentStore {
	async fn append(
		&self,
		conversation: ConversationId,
		author: UserId,
		body: String,
		reply_to: Option<Seq>,
	) -> Result<AppendOutcome, StoreError> {
		let created_at = unix_ms_now();

		let (sequence, reply_resolved) = match &self.backend {
			Backend::Sqlite(pool) => {
				let mut conn = pool.acquire().await.map_err(|e| unavailable(e, "acquire sqlite conn"))?;

				// A deferred transaction would let two appenders share a read
				// snapshot and fail one of them at the insert; IMMEDIATE takes
				// the write lock before `MAX(seq)` is read.
				sqlx::query("BEGIN IMMEDIATE")
					.execute(&mut *conn)
					.await
					.map_err(|e| unavailable(e, "begin sqlite tx"))?;

				match append_sqlite(&mut conn, conversation, author, &body, reply_to, created_at).await {
					Ok(assigned) => {
						sqlx::query("COMMIT")
							.execute(&mut *conn)
							.await
							.map_err(|e| unavailable(e, "commit sqlite tx"))?;
						assigned
					}
					Err(e) => {
						let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
						return Err(e);
					}
				}
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(|e| unavailable(e, "begin postgres tx"))?;

				sqlx::query("SELECT pg_advisory_xact_lock($1)")
					.bind(conversation.as_u64() as i64)
					.execute(&mut *tx)
					.await
					.map_err(|e| unavailable(e, "take conversation lock (postgres)"))?;

				let (head,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = $1")
					.bind(conversation.as_u64() as i64)
					.fetch_one(&mut *tx)
					.await
					.map_err(|e| unavailable(e, "select head (postgres)"))?;

				let sequence = head + 1;
				let reply_resolved = match reply_to {
					Some(target) => target.get() >= 1 && (target.get() as i64) <= head,
					None => true,
				};

				sqlx::query(
					"INSERT INTO messages (conversation_id, seq, author_id, body, reply_to, created_at_unix_ms) \
					VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(conversation.as_u64() as i64)
				.bind(sequence)
				.bind(author.as_u64() as i64)
				.bind(&body)
				.bind(reply_to.map(|r| r.get() as i64))
				.bind(created_at)
				.execute(&mut *tx)
				.await
				.map_err(|e| unavailable(e, "insert message (postgres)"))?;

				tx.commit().await.map_err(|e| unavailable(e, "commit postgres tx"))?;
				(sequence as u64, reply_resolved)
			}
		};

		Ok(AppendOutcome {
			message: Message {
				conversation_id: conversation,
				sequence: Seq::new(sequence),
				author_id: author,
				body,
				reply_to,
				created_at_unix_ms: created_at,
			},
			reply_resolved,
		})
	}

	async fn range(
		&self,
		conversation: ConversationId,
		before_sequence: Seq,
		limit: usize,
	) -> Result<Vec<Message>, StoreError> {
		let rows: Vec<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT conversation_id, seq, author_id, body, reply_to, created_at_unix_ms FROM messages \
				WHERE conversation_id = ? AND seq < ? ORDER BY seq DESC LIMIT ?",
			)
			.bind(conversation.as_u64() as i64)
			.bind(before_sequence.get() as i64)
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.map_err(|e| unavailable(e, "select range (sqlite)"))?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT conversation_id, seq, author_id, body, reply_to, created_at_unix_ms FROM messages \
				WHERE conversation_id = $1 AND seq < $2 ORDER BY seq DESC LIMIT $3",
			)
			.bind(conversation.as_u64() as i64)
			.bind(before_sequence.get() as i64)
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.map_err(|e| unavailable(e, "select range (postgres)"))?,
		};

		Ok(rows.into_iter().map(message_from_row).collect())
	}

	async fn get(&self, conversation: ConversationId, sequence: Seq) -> Result<Message, StoreError> {
		let row: Option<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT conversation_id, seq, author_id, body, reply_to, created_at_unix_ms FROM messages \
				WHERE conversation_id = ? AND seq = ?",
			)
			.bind(conversation.as_u64() as i64)
			.bind(sequence.get() as i64)
			.fetch_optional(pool)
			.await
			.map_err(|e| unavailable(e, "select message (sqlite)"))?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT conversation_id, seq, author_id, body, reply_to, created_at_unix_ms FROM messages \
				WHERE conversation_id = $1 AND seq = $2",
			)
			.bind(conversation.as_u64() as i64)
			.bind(sequence.get() as i64)
			.fetch_optional(pool)
			.await
			.map_err(|e| unavailable(e, "select message (postgres)"))?,
		};

		row.map(message_from_row)
			.ok_or(StoreError::NotFound { conversation, sequence })
	}

	async fn count_replies(&self, conversation: ConversationId, sequence: Seq) -> Result<u64, StoreError> {
		let (count,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_id = ? AND reply_to = ?")
					.bind(conversation.as_u64() as i64)
					.bind(sequence.get() as i64)
					.fetch_one(pool)
					.await
					.map_err(|e| unavailable(e, "count replies (sqlite)"))?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_id = $1 AND reply_to = $2")
					.bind(conversation.as_u64() as i64)
					.bind(sequence.get() as i64)
					.fetch_one(pool)
					.await
					.map_err(|e| unavailable(e, "count replies (postgres)"))?
			}
		};

		Ok(count as u64)
	}

	async fn filter(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		filter: MessageFilter,
	) -> Result<Vec<Message>, StoreError> {
		let author = filter.author.map(|a| a.as_u64() as i64);

		let rows: Vec<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT m.conversation_id, m.seq, m.author_id, m.body, m.reply_to, m.created_at_unix_ms FROM messages m \
				WHERE m.conversation_id = ?1 \
				AND (?2 IS NULL OR m.author_id = ?2) \
				AND (?3 IS NULL OR m.created_at_unix_ms >= ?3) \
				AND (?4 IS NULL OR m.created_at_unix_ms <= ?4) \
				AND NOT EXISTS (SELECT 1 FROM deleted_messages d \
					WHERE d.conversation_id = m.conversation_id AND d.member_id = ?5 AND d.seq = m.seq) \
				ORDER BY m.seq ASC",
			)
			.bind(conversation.as_u64() as i64)
			.bind(author)
			.bind(filter.from_unix_ms)
			.bind(filter.until_unix_ms)
			.bind(viewer.as_u64() as i64)
			.fetch_all(pool)
			.await
			.map_err(|e| unavailable(e, "filter messages (sqlite)"))?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT m.conversation_id, m.seq, m.author_id, m.body, m.reply_to, m.created_at_unix_ms FROM messages m \
				WHERE m.conversation_id = $1 \
				AND ($2::BIGINT IS NULL OR m.author_id = $2) \
				AND ($3::BIGINT IS NULL OR m.created_at_unix_ms >= $3) \
				AND ($4::BIGINT IS NULL OR m.created_at_unix_ms <= $4) \
				AND NOT EXISTS (SELECT 1 FROM deleted_messages d \
					WHERE d.conversation_id = m.conversation_id AND d.member_id = $5 AND d.seq = m.seq) \
				ORDER BY m.seq ASC",
			)
			.bind(conversation.as_u64() as i64)
			.bind(author)
			.bind(filter.from_unix_ms)
			.bind(filter.until_unix_ms)
			.bind(viewer.as_u64() as i64)
			.fetch_all(pool)
			.await
			.map_err(|e| unavailable(e, "filter messages (postgres)"))?,
		};

		Ok(rows.into_iter().map(message_from_row).collect())
	}

	async fn head(&self, conversation: ConversationId) -> Result<Seq, StoreError> {
		let (head,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = ?")
				.bind(conversation.as_u64() as i64)
				.fetch_one(pool)
				.await
				.map_err(|e| unavailable(e, "select head (sqlite)"))?,
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = $1")
					.bind(conversation.as_u64() as i64)
					.fetch_one(pool)
					.await
					.map_err(|e| unavailable(e, "select head (postgres)"))?
			}
		};

		Ok(Seq::new(head as u64))
	}

	async fn recent(&self, conversation: ConversationId, viewer: UserId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let rows: Vec<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT m.conversation_id, m.seq, m.author_id, m.body, m.reply_to, m.created_at_unix_ms FROM messages m \
				WHERE m.conversation_id = ?1 \
				AND NOT EXISTS (SELECT 1 FROM deleted_messages d \
					WHERE d.conversation_id = m.conversation_id AND d.member_id = ?2 AND d.seq = m.seq) \
				ORDER BY m.seq DESC LIMIT ?3",
			)
			.bind(conversation.as_u64() as i64)
			.bind(viewer.as_u64() as i64)
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.map_err(|e| unavailable(e, "select recent (sqlite)"))?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT m.conversation_id, m.seq, m.author_id, m.body, m.reply_to, m.created_at_unix_ms FROM messages m \
				WHERE m.conversation_id = $1 \
				AND NOT EXISTS (SELECT 1 FROM deleted_messages d \
					WHERE d.conversation_id = m.conversation_id AND d.member_id = $2 AND d.seq = m.seq) \
				ORDER BY m.seq DESC LIMIT $3",
			)
			.bind(conversation.as_u64() as i64)
			.bind(viewer.as_u64() as i64)
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.map_err(|e| unavailable(e, "select recent (postgres)"))?,
		};

		Ok(rows.into_iter().map(message_from_row).collect())
	}

	async fn mark_deleted(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<(), StoreError> {
		// Conversation-scoped uniqueness: the (conversation, seq) pair is the
		// message identity.
		self.get(conversation, sequence).await?;

		let inserted = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query(
				"INSERT INTO deleted_messages (conversation_id, member_id, seq) VALUES (?, ?, ?) \
				ON CONFLICT (conversation_id, member_id, seq) DO NOTHING",
			)
			.bind(conversation.as_u64() as i64)
			.bind(member.as_u64() as i64)
			.bind(sequence.get() as i64)
			.execute(pool)
			.await
			.map_err(|e| unavailable(e, "insert deletion mark (sqlite)"))?
			.rows_affected(),
			Backend::Postgres(pool) => sqlx::query(
				"INSERT INTO deleted_messages (conversation_id, member_id, seq) VALUES ($1, $2, $3) \
				ON CONFLICT (conversation_id, member_id, seq) DO NOTHING",
			)
			.bind(conversation.as_u64() as i64)
			.bind(member.as_u64() as i64)
			.bind(sequence.get() as i64)
			.execute(pool)
			.await
			.map_err(|e| unavailable(e, "insert deletion mark (postgres)"))?
			.rows_affected(),
		};

		if inserted == 0 {
			return Err(StoreError::AlreadyDeleted { conversation, sequence });
		}

		Ok(())
	}

	async fn deleted_set(&self, conversation: ConversationId, member: UserId) -> Result<HashSet<Seq>, StoreError> {
		let rows: Vec<(i64,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT seq FROM deleted_messages WHERE conversation_id = ? AND member_id = ?")
					.bind(conversation.as_u64() as i64)
					.bind(member.as_u64() as i64)
					.fetch_all(pool)
					.await
					.map_err(|e| unavailable(e, "select deletion marks (sqlite)"))?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT seq FROM deleted_messages WHERE conversation_id = $1 AND member_id = $2")
					.bind(conversation.as_u64() as i64)
					.bind(member.as_u64() as i64)
					.fetch_all(pool)
					.await
					.map_err(|e| unavailable(e, "select deletion marks (postgres)"))?
			}
		};

		Ok(rows.into_iter().map(|(s,)| Seq::new(s as u64)).collect())
	}
}

#[async_trait]
impl ReadTracker for PersistentStore {
	async fn advance(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<Seq, StoreError> {
		let joined_at = unix_ms_now();

		let (effective,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO read_marks (conversation_id, member_id, read_through, joined_at_unix_ms) \
				VALUES (?, ?, ?, ?) \
				ON CONFLICT (conversation_id, member_id) \
				DO UPDATE SET read_through = MAX(read_marks.read_through, excluded.read_through) \
				RETURNING read_through",
			)
			.bind(conversation.as_u64() as i64)
			.bind(member.as_u64() as i64)
			.bind(sequence.get() as i64)
			.bind(joined_at)
			.fetch_one(pool)
			.await
			.map_err(|e| unavailable(e, "advance read mark (sqlite)"))?,
			Backend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO read_marks (conversation_id, member_id, read_through, joined_at_unix_ms) \
				VALUES ($1, $2, $3, $4) \
				ON CONFLICT (conversation_id, member_id) \
				DO UPDATE SET read_through = GREATEST(read_marks.read_through, EXCLUDED.read_through) \
				RETURNING read_through",
			)
			.bind(conversation.as_u64() as i64)
			.bind(member.as_u64() as i64)
			.bind(sequence.get() as i64)
			.bind(joined_at)
			.fetch_one(pool)
			.await
			.map_err(|e| unavailable(e, "advance read mark (postgres)"))?,
		};

		Ok(Seq::new(effective as u64))
	}

	async fn read_through(&self, conversation: ConversationId, member: UserId) -> Result<Seq, StoreError> {
		let row: Option<(i64,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT read_through FROM read_marks WHERE conversation_id = ? AND member_id = ?")
					.bind(conversation.as_u64() as i64)
					.bind(member.as_u64() as i64)
					.fetch_optional(pool)
					.await
					.map_err(|e| unavailable(e, "select read mark (sqlite)"))?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT read_through FROM read_marks WHERE conversation_id = $1 AND member_id = $2")
					.bind(conversation.as_u64() as i64)
					.bind(member.as_u64() as i64)
					.fetch_optional(pool)
					.await
					.map_err(|e| unavailable(e, "select read mark (postgres)"))?
			}
		};

		Ok(row.map(|(r,)| Seq::new(r as u64)).unwrap_or(Seq::ZERO))
	}

	async fn is_read(&self, conversation: ConversationId, member: UserId, sequence: Seq) -> Result<bool, StoreError> {
		Ok(self.read_through(conversation, member).await? >= sequence)
	}

	async fn readers_at_least(&self, conversation: ConversationId, sequence: Seq) -> Result<Vec<UserId>, StoreError> {
		let rows: Vec<(i64,)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT member_id FROM read_marks WHERE conversation_id = ? AND read_through >= ? ORDER BY member_id",
			)
			.bind(conversation.as_u64() as i64)
			.bind(sequence.get() as i64)
			.fetch_all(pool)
			.await
			.map_err(|e| unavailable(e, "select readers (sqlite)"))?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT member_id FROM read_marks WHERE conversation_id = $1 AND read_through >= $2 ORDER BY member_id",
			)
			.bind(conversation.as_u64() as i64)
			.bind(sequence.get() as i64)
			.fetch_all(pool)
			.await
			.map_err(|e| unavailable(e, "select readers (postgres)"))?,
		};

		Ok(rows.into_iter().map(|(m,)| UserId::new(m as u64)).collect())
	}

	async fn joined_at(&self, conversation: ConversationId, member: UserId) -> Result<Option<i64>, StoreError> {
		let row: Option<(i64,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT joined_at_unix_ms FROM read_marks WHERE conversation_id = ? AND member_id = ?")
					.bind(conversation.as_u64() as i64)
					.bind(member.as_u64() as i64)
					.fetch_optional(pool)
					.await
					.map_err(|e| unavailable(e, "select joined_at (sqlite)"))?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT joined_at_unix_ms FROM read_marks WHERE conversation_id = $1 AND member_id = $2")
					.bind(conversation.as_u64() as i64)
					.bind(member.as_u64() as i64)
					.fetch_optional(pool)
					.await
					.map_err(|e| unavailable(e, "select joined_at (postgres)"))?
			}
		};

		Ok(row.map(|(t,)| t))
	}
}
