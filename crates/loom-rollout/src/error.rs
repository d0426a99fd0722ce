// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the rollout SDK.

use loom_rollout_core::CoreError;
use thiserror::Error;

/// Rollout SDK errors.
///
/// These stay inside the SDK's background machinery. Query entry points such
/// as [`crate::RolloutClient::evaluate`] return the control treatment instead.
#[derive(Debug, Error)]
pub enum RolloutError {
	/// SDK key is missing or malformed.
	#[error("invalid SDK key")]
	InvalidSdkKey,

	/// Base URL is missing or invalid.
	#[error("invalid base URL")]
	InvalidBaseUrl,

	/// Identity key is empty or too long.
	#[error("invalid identity key: {0}")]
	InvalidKey(String),

	/// HTTP request failed.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// Server returned an error response.
	#[error("server error ({status}): {message}")]
	ServerError { status: u16, message: String },

	/// Rate limited by the server.
	#[error("rate limited, retry after {retry_after_secs:?} seconds")]
	RateLimited { retry_after_secs: Option<u64> },

	/// Response body could not be decoded.
	#[error("failed to parse response: {0}")]
	ParseFailed(String),

	/// Streaming connection failed.
	#[error("stream error: {0}")]
	StreamError(String),

	/// Client has been destroyed.
	#[error("client has been shut down")]
	ClientShutdown,

	/// Timed out waiting for the first sync.
	#[error("timed out waiting for client to become ready")]
	ReadyTimeout,

	/// Configuration rejected at build time.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// Localhost flag file could not be read.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Core(#[from] CoreError),
}

impl RolloutError {
	/// Whether retrying the same request may succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			RolloutError::RequestFailed(e) => e.is_timeout() || e.is_connect() || e.is_request(),
			RolloutError::ServerError { status, .. } => {
				matches!(*status, 429 | 408 | 500 | 502 | 503 | 504)
			}
			RolloutError::RateLimited { .. } => true,
			RolloutError::StreamError(_) => true,
			_ => false,
		}
	}

	/// Credentials were rejected.
	pub fn is_unauthorized(&self) -> bool {
		matches!(self, RolloutError::ServerError { status: 401 | 403, .. })
	}
}

/// Result type alias for rollout operations.
pub type Result<T> = std::result::Result<T, RolloutError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn server_error_retryable_statuses() {
		for status in [429, 408, 500, 502, 503, 504] {
			let err = RolloutError::ServerError {
				status,
				message: "test".to_string(),
			};
			assert!(err.is_retryable(), "status {status} should be retryable");
		}
	}

	#[test]
	fn server_error_non_retryable_statuses() {
		for status in [400, 401, 403, 404, 422] {
			let err = RolloutError::ServerError {
				status,
				message: "test".to_string(),
			};
			assert!(!err.is_retryable(), "status {status} should not be retryable");
		}
	}

	#[test]
	fn unauthorized_detection() {
		let err = RolloutError::ServerError {
			status: 401,
			message: String::new(),
		};
		assert!(err.is_unauthorized());
		assert!(!RolloutError::ClientShutdown.is_unauthorized());
	}

	#[test]
	fn config_and_shutdown_errors_not_retryable() {
		assert!(!RolloutError::InvalidConfig("x".to_string()).is_retryable());
		assert!(!RolloutError::ClientShutdown.is_retryable());
		assert!(!RolloutError::InvalidSdkKey.is_retryable());
	}
}
