#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use convo_domain::{ConversationId, ConversationInfo, ConversationKind, Profile, UserId};

/// Membership and conversation metadata, consumed read-only by the server.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
	async fn conversations_of(&self, user: UserId) -> Vec<ConversationId>;

	async fn members_of(&self, conversation: ConversationId) -> Vec<UserId>;

	async fn is_member(&self, conversation: ConversationId, user: UserId) -> bool;

	/// Presentation data as seen by `viewer`: 1:1 conversations take the other
	/// member's name and avatar.
	async fn conversation_info(&self, conversation: ConversationId, viewer: UserId) -> Option<ConversationInfo>;
}

/// Display name and avatar per user.
#[async_trait]
pub trait ProfileStore: Send + Sync {
	async fn profile(&self, user: UserId) -> Profile;
}

#[derive(Debug, Clone)]
struct ConversationEntry {
	info: ConversationInfo,
	members: Vec<UserId>,
}

/// Directory backed by config fixtures. Good enough until a real identity
/// service sits behind these traits.
#[derive(Debug, Default)]
pub struct StaticDirectory {
	profiles: HashMap<UserId, Profile>,
	conversations: HashMap<ConversationId, ConversationEntry>,
	memberships: HashMap<UserId, Vec<ConversationId>>,
}

impl StaticDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_user(&mut self, user: UserId, name: impl Into<String>, avatar: impl Into<String>) {
		self.profiles.insert(user, Profile {
			name: name.into(),
			avatar: avatar.into(),
		});
	}

	pub fn add_conversation(&mut self, info: ConversationInfo, members: Vec<UserId>) {
		for member in &members {
			self.memberships.entry(*member).or_default().push(info.id);
		}
		self.conversations.insert(info.id, ConversationEntry { info, members });
	}

	fn fallback_profile(user: UserId) -> Profile {
		Profile {
			name: format!("user-{user}"),
			avatar: String::new(),
		}
	}
}

#[async_trait]
impl MembershipDirectory for StaticDirectory {
	async fn conversations_of(&self, user: UserId) -> Vec<ConversationId> {
		self.memberships.get(&user).cloned().unwrap_or_default()
	}

	async fn members_of(&self, conversation: ConversationId) -> Vec<UserId> {
		self.conversations
			.get(&conversation)
			.map(|e| e.members.clone())
			.unwrap_or_default()
	}

	async fn is_member(&self, conversation: ConversationId, user: UserId) -> bool {
		self.conversations
			.get(&conversation)
			.is_some_and(|e| e.members.contains(&user))
	}

	async fn conversation_info(&self, conversation: ConversationId, viewer: UserId) -> Option<ConversationInfo> {
		let entry = self.conversations.get(&conversation)?;
		let mut info = entry.info.clone();

		if info.kind == ConversationKind::Direct
			&& let Some(other) = entry.members.iter().find(|m| **m != viewer)
		{
			let profile = self
				.profiles
				.get(other)
				.cloned()
				.unwrap_or_else(|| Self::fallback_profile(*other));
			info.name = profile.name;
			info.avatar = profile.avatar;
		}

		Some(info)
	}
}

#[async_trait]
impl ProfileStore for StaticDirectory {
	async fn profile(&self, user: UserId) -> Profile {
		self.profiles
			.get(&user)
			.cloned()
			.unwrap_or_else(|| Self::fallback_profile(user))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn direct(id: u64, a: u64, b: u64) -> (ConversationInfo, Vec<UserId>) {
		(
			ConversationInfo {
				id: ConversationId::new(id),
				name: String::new(),
				avatar: String::new(),
				kind: ConversationKind::Direct,
			},
			vec![UserId::new(a), UserId::new(b)],
		)
	}

	#[tokio::test]
	async fn direct_conversation_presents_other_member() {
		let mut dir = StaticDirectory::new();
		dir.add_user(UserId::new(1), "ada", "ada.png");
		dir.add_user(UserId::new(2), "grace", "grace.png");
		let (info, members) = direct(10, 1, 2);
		dir.add_conversation(info, members);

		let seen_by_ada = dir.conversation_info(ConversationId::new(10), UserId::new(1)).await.unwrap();
		assert_eq!(seen_by_ada.name, "grace");
		assert_eq!(seen_by_ada.avatar, "grace.png");

		let seen_by_grace = dir.conversation_info(ConversationId::new(10), UserId::new(2)).await.unwrap();
		assert_eq!(seen_by_grace.name, "ada");
	}

	#[tokio::test]
	async fn group_conversation_keeps_own_name() {
		let mut dir = StaticDirectory::new();
		dir.add_conversation(
			ConversationInfo {
				id: ConversationId::new(20),
				name: "ops".to_string(),
				avatar: "ops.png".to_string(),
				kind: ConversationKind::Group,
			},
			vec![UserId::new(1), UserId::new(2), UserId::new(3)],
		);

		let info = dir.conversation_info(ConversationId::new(20), UserId::new(1)).await.unwrap();
		assert_eq!(info.name, "ops");

		assert!(dir.is_member(ConversationId::new(20), UserId::new(3)).await);
		assert!(!dir.is_member(ConversationId::new(20), UserId::new(4)).await);
		assert_eq!(dir.conversations_of(UserId::new(2)).await, vec![ConversationId::new(20)]);
	}
}
