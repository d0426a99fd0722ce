// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Streaming tokens issued by the auth endpoint.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::error::{CoreError, Result};

const CAPABILITY_CLAIM: &str = "x-ably-capability";
const OCCUPANCY_PREFIX: &str = "[?occupancy=metrics.publishers]";

#[derive(Deserialize)]
struct Claims {
	iat: i64,
	exp: i64,
	#[serde(rename = "x-ably-capability")]
	capability: String,
}

/// A short-lived credential plus the channels it authorizes.
///
/// Immutable once parsed; re-authentication replaces it wholesale.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamToken {
	raw: String,
	channels: Vec<String>,
	issued_at: i64,
	expires_at: i64,
}

impl StreamToken {
	/// Parses a JWT, reading `iat`, `exp` and the channel capability claim.
	///
	/// The signature is not verified; the streaming server does that.
	pub fn parse(raw: &str) -> Result<Self> {
		let payload = raw
			.split('.')
			.nth(1)
			.ok_or_else(|| CoreError::InvalidToken("expected three segments".to_string()))?;
		let bytes = URL_SAFE_NO_PAD
			.decode(payload.trim_end_matches('='))
			.map_err(|e| CoreError::InvalidToken(e.to_string()))?;
		let claims: Claims = serde_json::from_slice(&bytes)
			.map_err(|e| CoreError::InvalidToken(format!("claims: {e}")))?;
		let capability: serde_json::Map<String, serde_json::Value> =
			serde_json::from_str(&claims.capability)
				.map_err(|e| CoreError::InvalidToken(format!("{CAPABILITY_CLAIM}: {e}")))?;

		if claims.exp < claims.iat {
			return Err(CoreError::InvalidToken("expires before issue".to_string()));
		}

		Ok(Self {
			raw: raw.to_string(),
			channels: capability.keys().cloned().collect(),
			issued_at: claims.iat,
			expires_at: claims.exp,
		})
	}

	/// Builds a token from parts; used where no JWT is involved.
	pub fn from_parts(raw: impl Into<String>, channels: Vec<String>, issued_at: i64, expires_at: i64) -> Self {
		Self {
			raw: raw.into(),
			channels,
			issued_at,
			expires_at,
		}
	}

	pub fn raw(&self) -> &str {
		&self.raw
	}

	pub fn channels(&self) -> &[String] {
		&self.channels
	}

	pub fn issued_at(&self) -> i64 {
		self.issued_at
	}

	pub fn expires_at(&self) -> i64 {
		self.expires_at
	}

	/// Channel list as sent to the streaming endpoint.
	///
	/// Control channels ask for occupancy metadata.
	pub fn channels_param(&self) -> String {
		self.channels
			.iter()
			.map(|c| {
				if c.contains("control") {
					format!("{OCCUPANCY_PREFIX}{c}")
				} else {
					c.clone()
				}
			})
			.collect::<Vec<_>>()
			.join(",")
	}

	/// Delay after connecting before the token should be refreshed.
	///
	/// `max(expires_at - issued_at - margin, 0)`.
	pub fn refresh_delay(&self, margin: Duration) -> Duration {
		let lifetime = self.expires_at.saturating_sub(self.issued_at);
		let margin = i64::try_from(margin.as_secs()).unwrap_or(i64::MAX);
		Duration::from_secs(lifetime.saturating_sub(margin).max(0) as u64)
	}
}

impl fmt::Debug for StreamToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StreamToken")
			.field("raw", &"[REDACTED]")
			.field("channels", &self.channels)
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

#[cfg(test)]
pub(crate) fn encode_test_jwt(channels: &[&str], iat: i64, exp: i64) -> String {
	let capability: serde_json::Map<String, serde_json::Value> = channels
		.iter()
		.map(|c| (c.to_string(), serde_json::json!(["subscribe"])))
		.collect();
	let claims = serde_json::json!({
		"x-ably-capability": serde_json::Value::Object(capability).to_string(),
		"iat": iat,
		"exp": exp,
	});
	let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
	let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
	format!("{header}.{payload}.signature")
}
