// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP access to the polling and auth endpoints.

use std::time::Duration;

use async_trait::async_trait;
use loom_rollout_core::FlagChangesDto;
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::{Endpoints, SdkKey};
use crate::error::{Result, RolloutError};

/// SDK version for identification.
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the User-Agent sent on every request.
///
/// Format: `loom-rollout/{version}`
pub fn user_agent() -> String {
	format!("loom-rollout/{SDK_VERSION}")
}

/// Creates an HTTP client builder with the standard User-Agent header.
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRef {
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MembershipsDto {
	#[serde(rename = "mySegments", default)]
	pub my_segments: Vec<SegmentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthResponseDto {
	#[serde(rename = "pushEnabled")]
	pub push_enabled: bool,
	#[serde(default)]
	pub token: Option<String>,
}

/// Remote operations the sync engine depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RolloutApi: Send + Sync {
	/// Flag definitions changed after `since` (`-1` for everything).
	async fn fetch_flag_changes(&self, since: i64) -> Result<FlagChangesDto>;

	/// Names of the segments `matching_key` currently belongs to.
	async fn fetch_memberships(&self, matching_key: &str) -> Result<Vec<String>>;

	/// Exchanges the SDK key for a streaming token covering `matching_keys`.
	async fn authenticate(&self, matching_keys: &[String]) -> Result<AuthResponseDto>;
}

/// [`RolloutApi`] over HTTP with bearer SDK key authentication.
pub struct HttpRolloutApi {
	client: Client,
	endpoints: Endpoints,
	sdk_key: SdkKey,
}

impl HttpRolloutApi {
	pub fn new(endpoints: Endpoints, sdk_key: SdkKey, timeout: Duration) -> Result<Self> {
		let client = builder()
			.timeout(timeout)
			.build()
			.map_err(RolloutError::RequestFailed)?;
		Ok(Self {
			client,
			endpoints,
			sdk_key,
		})
	}

	async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response> {
		debug!(url = %url, "Sending request");

		let response = self
			.client
			.get(url)
			.query(query)
			.header("Authorization", format!("Bearer {}", self.sdk_key.expose()))
			.header("Accept", "application/json")
			.send()
			.await?;

		if response.status() == StatusCode::TOO_MANY_REQUESTS {
			let retry_after = response
				.headers()
				.get("Retry-After")
				.and_then(|v| v.to_str().ok())
				.and_then(|s| s.parse().ok());
			return Err(RolloutError::RateLimited {
				retry_after_secs: retry_after,
			});
		}

		if !response.status().is_success() {
			let status = response.status().as_u16();
			let message = match response.text().await {
				Ok(body) => body,
				Err(e) => {
					debug!(status, url = %url, error = %e, "Failed to read error response body");
					String::new()
				}
			};
			error!(status, url = %url, message = %message, "Request failed");
			return Err(RolloutError::ServerError { status, message });
		}

		Ok(response)
	}

	async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
		let body = response.bytes().await?;
		serde_json::from_slice(&body).map_err(|e| RolloutError::ParseFailed(e.to_string()))
	}
}

#[async_trait]
impl RolloutApi for HttpRolloutApi {
	async fn fetch_flag_changes(&self, since: i64) -> Result<FlagChangesDto> {
		let response = self
			.get(&self.endpoints.flag_changes(), &[("since", since.to_string())])
			.await?;
		Self::json(response).await
	}

	async fn fetch_memberships(&self, matching_key: &str) -> Result<Vec<String>> {
		let response = self.get(&self.endpoints.memberships(matching_key), &[]).await?;
		let body: MembershipsDto = Self::json(response).await?;
		Ok(body.my_segments.into_iter().map(|s| s.name).collect())
	}

	async fn authenticate(&self, matching_keys: &[String]) -> Result<AuthResponseDto> {
		let query: Vec<(&str, String)> = matching_keys.iter().map(|k| ("users", k.clone())).collect();
		let response = self.get(&self.endpoints.auth(), &query).await?;
		Self::json(response).await
	}
}
