#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("not a positive integer: {0}")]
	NotANumber(String),
	#[error("unknown conversation kind: {0}")]
	UnknownKind(String),
}

fn parse_u64_id(s: &str) -> Result<u64, ParseIdError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ParseIdError::Empty);
	}
	s.parse::<u64>().map_err(|_| ParseIdError::NotANumber(s.to_string()))
}

/// Durable addressable group of participants owning an independent message sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(u64);

impl ConversationId {
	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(parse_u64_id(s)?))
	}
}

/// Stable user identifier resolved by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(parse_u64_id(s)?))
	}
}

/// Per-conversation message position: positive, strictly increasing, gapless.
///
/// `Seq::ZERO` is never assigned to a message; it is the read-mark value of a
/// member who has seen nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(u64);

impl Seq {
	pub const ZERO: Seq = Seq(0);
	pub const FIRST: Seq = Seq(1);

	pub const fn new(n: u64) -> Self {
		Self(n)
	}

	pub const fn get(self) -> u64 {
		self.0
	}

	/// The sequence following this one.
	pub const fn next(self) -> Seq {
		Seq(self.0 + 1)
	}

	/// Saturating backward step, flooring at `Seq::FIRST`.
	pub fn back(self, n: u64) -> Seq {
		Seq(self.0.saturating_sub(n).max(1))
	}
}

impl fmt::Display for Seq {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Per-session identifier for one tracked push of a payload.
///
/// Unrelated to `Seq`: delivery ids exist only for ack/retry bookkeeping and
/// die with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(u64);

impl DeliveryId {
	pub const fn new(n: u64) -> Self {
		Self(n)
	}

	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for DeliveryId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Conversation shape: 1:1 or multi-member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
	Direct,
	Group,
}

impl ConversationKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConversationKind::Direct => "direct",
			ConversationKind::Group => "group",
		}
	}
}

impl fmt::Display for ConversationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ConversationKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"direct" | "private" | "1:1" => Ok(ConversationKind::Direct),
			"group" => Ok(ConversationKind::Group),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// A stored message. Immutable once appended; per-viewer deletion lives
/// outside the message itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub conversation_id: ConversationId,
	pub sequence: Seq,
	pub author_id: UserId,
	pub body: String,
	/// Backward reference to an earlier sequence in the same conversation.
	pub reply_to: Option<Seq>,
	/// Store-assigned creation time (unix milliseconds).
	pub created_at_unix_ms: i64,
}

impl Message {
	pub fn is_reply(&self) -> bool {
		self.reply_to.is_some()
	}
}

/// Display decoration for a user, supplied by the profile store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
	pub name: String,
	pub avatar: String,
}

/// Conversation presentation data from the membership directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
	pub id: ConversationId,
	pub name: String,
	pub avatar: String,
	pub kind: ConversationKind,
}
