// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Exchange of SDK credentials for streaming tokens.

use std::sync::Arc;

use async_trait::async_trait;
use loom_rollout_core::StreamToken;
use tracing::{info, warn};

use crate::http::RolloutApi;

/// Result of one authentication attempt, classified for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
	Token(StreamToken),
	/// Credentials rejected; streaming stays off for the session.
	InvalidCredentials,
	/// The server has push turned off for this SDK key.
	StreamingDisabled,
	/// Network or server trouble; worth retrying.
	Transient(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
	async fn authenticate(&self, matching_keys: &[String]) -> AuthOutcome;
}

/// Authenticates against the rollout API's auth endpoint.
pub struct SdkAuthenticator {
	api: Arc<dyn RolloutApi>,
}

impl SdkAuthenticator {
	pub fn new(api: Arc<dyn RolloutApi>) -> Self {
		Self { api }
	}
}

#[async_trait]
impl Authenticator for SdkAuthenticator {
	async fn authenticate(&self, matching_keys: &[String]) -> AuthOutcome {
		let response = match self.api.authenticate(matching_keys).await {
			Ok(response) => response,
			Err(e) if e.is_unauthorized() => {
				warn!(error = %e, "Streaming credentials rejected");
				return AuthOutcome::InvalidCredentials;
			}
			Err(e) => return AuthOutcome::Transient(e.to_string()),
		};

		if !response.push_enabled {
			info!("Streaming disabled by server");
			return AuthOutcome::StreamingDisabled;
		}

		let Some(raw) = response.token else {
			return AuthOutcome::Transient("auth response without token".to_string());
		};

		match StreamToken::parse(&raw) {
			Ok(token) if token.channels().is_empty() => {
				AuthOutcome::Transient("token authorizes no channels".to_string())
			}
			Ok(token) => AuthOutcome::Token(token),
			Err(e) => AuthOutcome::Transient(e.to_string()),
		}
	}
}

#[cfg(test)]
pub(crate) fn test_jwt(channels: &[&str], iat: i64, exp: i64) -> String {
	use base64::engine::general_purpose::URL_SAFE_NO_PAD;
	use base64::Engine;

	let capability: serde_json::Map<String, serde_json::Value> = channels
		.iter()
		.map(|c| (c.to_string(), serde_json::json!(["subscribe"])))
		.collect();
	let claims = serde_json::json!({
		"x-ably-capability": serde_json::Value::Object(capability).to_string(),
		"iat": iat,
		"exp": exp,
	});
	format!(
		"{}.{}.sig",
		URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#),
		URL_SAFE_NO_PAD.encode(claims.to_string())
	)
}
