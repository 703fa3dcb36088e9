#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use convo_domain::{ConversationId, ConversationInfo, ConversationKind, UserId};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::directory::StaticDirectory;
use crate::util::secret::SecretStr;

/// Default config path: `~/.convo/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".convo").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub delivery: DeliverySettings,
	pub persistence: PersistenceSettings,
	pub users: Vec<UserFixture>,
	pub conversations: Vec<ConversationFixture>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens. Required.
	pub auth_hmac_secret: Option<SecretStr>,
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
	pub retry_interval: Duration,
	pub max_attempts: u32,
}

impl Default for DeliverySettings {
	fn default() -> Self {
		Self {
			retry_interval: Duration::from_secs(5),
			max_attempts: 3,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the sqlx-backed store; in-memory otherwise.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// `[[users]]` fixture: a known profile.
#[derive(Debug, Clone, Deserialize)]
pub struct UserFixture {
	pub id: u64,
	pub name: String,
	#[serde(default)]
	pub avatar: String,
}

/// `[[conversations]]` fixture: membership and presentation.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationFixture {
	pub id: u64,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub avatar: String,
	#[serde(default)]
	pub kind: Option<String>,
	pub members: Vec<u64>,
}

impl ServerConfig {
	/// Build the membership/profile directory from the fixtures.
	pub fn build_directory(&self) -> StaticDirectory {
		let mut dir = StaticDirectory::new();

		for user in &self.users {
			dir.add_user(UserId::new(user.id), user.name.clone(), user.avatar.clone());
		}

		for conv in &self.conversations {
			let kind = match conv.kind.as_deref() {
				Some(s) => s.parse::<ConversationKind>().unwrap_or_else(|e| {
					warn!(conversation = conv.id, error = %e, "invalid conversation kind; assuming group");
					ConversationKind::Group
				}),
				None => ConversationKind::Group,
			};

			dir.add_conversation(
				ConversationInfo {
					id: ConversationId::new(conv.id),
					name: conv.name.clone(),
					avatar: conv.avatar.clone(),
					kind,
				},
				conv.members.iter().map(|m| UserId::new(*m)).collect(),
			);
		}

		dir
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = DeliverySettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretStr::new),
			},
			delivery: DeliverySettings {
				retry_interval: file
					.delivery
					.retry_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.retry_interval),
				max_attempts: file.delivery.max_attempts.filter(|v| *v > 0).unwrap_or(defaults.max_attempts),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			users: file.users,
			conversations: file.conversations,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	delivery: FileDeliverySettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	users: Vec<UserFixture>,

	#[serde(default)]
	conversations: Vec<ConversationFixture>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDeliverySettings {
	retry_interval_secs: Option<u64>,
	max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("CONVO_SERVER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONVO_SERVER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONVO_SERVER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretStr::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONVO_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONVO_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONVO_DELIVERY_RETRY_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.delivery.retry_interval = Duration::from_secs(secs);
		info!(secs, "delivery: retry_interval overridden by env");
	}

	if let Ok(v) = std::env::var("CONVO_DELIVERY_MAX_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<u32>()
		&& attempts > 0
	{
		cfg.delivery.max_attempts = attempts;
		info!(attempts, "delivery: max_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("CONVO_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("CONVO_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}
