#![forbid(unsafe_code)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use convo_domain::UserId;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::util::secret::SecretStr;
use crate::util::time::unix_secs_now;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("invalid token format")]
	Malformed,
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("invalid token subject: {0}")]
	BadSubject(String),
}

/// Claims carried by a `v1.<payload>.<sig>` access token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Resolves a connect-time credential to a user id.
#[async_trait]
pub trait Authenticator: Send + Sync {
	async fn authenticate(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Stateless HMAC-SHA256 token verification.
pub struct HmacAuthenticator {
	secret: SecretStr,
}

impl HmacAuthenticator {
	pub fn new(secret: SecretStr) -> Self {
		Self { secret }
	}
}

#[async_trait]
impl Authenticator for HmacAuthenticator {
	async fn authenticate(&self, credential: &str) -> Result<UserId, AuthError> {
		let claims = verify_hmac_token(credential, self.secret.expose())?;
		claims
			.sub
			.parse::<UserId>()
			.map_err(|_| AuthError::BadSubject(claims.sub.clone()))
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Malformed);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Malformed)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Malformed)?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::BadSignature);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
	if claims.exp <= unix_secs_now() {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	// Hmac::new_from_slice accepts keys of any length.
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn make_token(sub: &str, exp: u64, secret: &str) -> String {
		let payload = serde_json::json!({ "sub": sub, "exp": exp }).to_string();
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload.as_bytes());
		let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
		format!("v1.{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(sig))
	}

	#[tokio::test]
	async fn accepts_valid_token() {
		let token = make_token("42", unix_secs_now() + 600, "s3cret");
		let auth = HmacAuthenticator::new(SecretStr::new("s3cret"));
		let user = auth.authenticate(&token).await.unwrap();
		assert_eq!(user, UserId::new(42));
	}

	#[tokio::test]
	async fn rejects_bad_signature() {
		let token = make_token("42", unix_secs_now() + 600, "other-secret");
		let auth = HmacAuthenticator::new(SecretStr::new("s3cret"));
		assert!(matches!(auth.authenticate(&token).await, Err(AuthError::BadSignature)));
	}

	#[tokio::test]
	async fn rejects_expired_token() {
		let token = make_token("42", unix_secs_now().saturating_sub(10), "s3cret");
		let auth = HmacAuthenticator::new(SecretStr::new("s3cret"));
		assert!(matches!(auth.authenticate(&token).await, Err(AuthError::Expired)));
	}

	#[tokio::test]
	async fn rejects_non_numeric_subject() {
		let token = make_token("alice", unix_secs_now() + 600, "s3cret");
		let auth = HmacAuthenticator::new(SecretStr::new("s3cret"));
		assert!(matches!(auth.authenticate(&token).await, Err(AuthError::BadSubject(_))));
	}

	#[test]
	fn rejects_malformed_tokens() {
		assert!(matches!(verify_hmac_token("", "s"), Err(AuthError::Malformed)));
		assert!(matches!(verify_hmac_token("v2.a.b", "s"), Err(AuthError::Malformed)));
		assert!(matches!(verify_hmac_token("v1.only-two", "s"), Err(AuthError::Malformed)));
		assert!(matches!(verify_hmac_token("v1.!!.!!", "s"), Err(AuthError::Malformed)));
	}
}
