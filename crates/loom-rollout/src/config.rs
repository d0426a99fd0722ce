// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration, endpoint layout and the SDK key wrapper.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, RolloutError};

/// Tunables for sync, streaming and impressions.
///
/// Durations serialize as whole seconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
	#[serde(with = "duration_secs")]
	pub features_refresh_rate: Duration,
	#[serde(with = "duration_secs")]
	pub segments_refresh_rate: Duration,
	#[serde(with = "duration_secs")]
	pub request_timeout: Duration,
	pub streaming_enabled: bool,
	/// Silence on the stream longer than this is treated as a dropped connection.
	#[serde(with = "duration_secs")]
	pub keep_alive_timeout: Duration,
	/// How long before token expiry to re-authenticate.
	#[serde(with = "duration_secs")]
	pub token_refresh_margin: Duration,
	#[serde(with = "duration_secs")]
	pub background_disconnect_delay: Duration,
	#[serde(with = "duration_secs")]
	pub auth_backoff_base: Duration,
	#[serde(with = "duration_secs")]
	pub auth_backoff_max: Duration,
	#[serde(with = "duration_secs")]
	pub stream_backoff_base: Duration,
	#[serde(with = "duration_secs")]
	pub stream_backoff_max: Duration,
	#[serde(with = "duration_secs")]
	pub polling_backoff_base: Duration,
	#[serde(with = "duration_secs")]
	pub polling_backoff_max: Duration,
	/// Consecutive failed fetches before a resource is reported degraded.
	pub polling_retry_budget: u32,
	pub labels_enabled: bool,
	pub impressions_queue_size: usize,
	/// Overrides `{base_url}/sse`.
	pub stream_url: Option<String>,
	/// Reload interval for localhost mode; zero loads once.
	#[serde(with = "duration_secs")]
	pub localhost_refresh_rate: Duration,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			features_refresh_rate: Duration::from_secs(3600),
			segments_refresh_rate: Duration::from_secs(1800),
			request_timeout: Duration::from_secs(15),
			streaming_enabled: true,
			keep_alive_timeout: Duration::from_secs(70),
			token_refresh_margin: Duration::from_secs(600),
			background_disconnect_delay: Duration::from_secs(60),
			auth_backoff_base: Duration::from_secs(1),
			auth_backoff_max: Duration::from_secs(1800),
			stream_backoff_base: Duration::from_secs(1),
			stream_backoff_max: Duration::from_secs(1800),
			polling_backoff_base: Duration::from_secs(1),
			polling_backoff_max: Duration::from_secs(60),
			polling_retry_budget: 3,
			labels_enabled: true,
			impressions_queue_size: 30_000,
			stream_url: None,
			localhost_refresh_rate: Duration::ZERO,
		}
	}
}

impl ClientConfig {
	pub fn validate(&self) -> Result<()> {
		if self.request_timeout.is_zero() {
			return Err(RolloutError::InvalidConfig("request_timeout must be positive".to_string()));
		}
		if self.streaming_enabled && self.keep_alive_timeout.is_zero() {
			return Err(RolloutError::InvalidConfig(
				"keep_alive_timeout must be positive".to_string(),
			));
		}
		if self.polling_retry_budget == 0 {
			return Err(RolloutError::InvalidConfig(
				"polling_retry_budget must be at least 1".to_string(),
			));
		}
		if self.impressions_queue_size == 0 {
			return Err(RolloutError::InvalidConfig(
				"impressions_queue_size must be at least 1".to_string(),
			));
		}
		Ok(())
	}
}

mod duration_secs {
	use serde::{Deserialize, Deserializer, Serialize, Serializer};
	use std::time::Duration;

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		duration.as_secs().serialize(serializer)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let secs = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(secs))
	}
}

/// SDK credential. Never printed; wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SdkKey(String);

impl SdkKey {
	pub fn new(key: impl Into<String>) -> Result<Self> {
		let key = key.into();
		if key.trim().is_empty() || key.chars().any(char::is_whitespace) {
			return Err(RolloutError::InvalidSdkKey);
		}
		Ok(Self(key))
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SdkKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SdkKey([REDACTED])")
	}
}

/// URLs for every remote endpoint, derived from a base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
	base_url: String,
	stream_url: String,
}

impl Endpoints {
	pub fn new(base_url: &str, stream_url: Option<&str>) -> Result<Self> {
		let base_url = base_url.trim_end_matches('/').to_string();
		if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
			return Err(RolloutError::InvalidBaseUrl);
		}
		let stream_url = match stream_url {
			Some(url) => url.trim_end_matches('/').to_string(),
			None => format!("{base_url}/sse"),
		};
		Ok(Self {
			base_url,
			stream_url,
		})
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	pub fn flag_changes(&self) -> String {
		format!("{}/api/flagChanges", self.base_url)
	}

	pub fn memberships(&self, matching_key: &str) -> String {
		format!(
			"{}/api/memberships/{}",
			self.base_url,
			urlencoding::encode(matching_key)
		)
	}

	pub fn auth(&self) -> String {
		format!("{}/api/v2/auth", self.base_url)
	}

	pub fn stream(&self) -> &str {
		&self.stream_url
	}
}
