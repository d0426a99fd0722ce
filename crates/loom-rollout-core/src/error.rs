// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Errors produced while decoding wire data or building domain types.
///
/// None of these are fatal to the SDK: callers log them and drop the
/// offending frame, flag or payload.
#[derive(Debug, Error)]
pub enum CoreError {
	#[error("malformed JSON: {0}")]
	Json(#[from] serde_json::Error),

	#[error("unknown stream event: {0}")]
	UnknownEvent(String),

	#[error("unknown notification type: {0}")]
	UnknownNotification(String),

	#[error("invalid payload: {0}")]
	InvalidPayload(String),

	#[error("unsupported matcher type: {0}")]
	UnsupportedMatcher(String),

	#[error("invalid flag definition: {0}")]
	InvalidFlag(String),

	#[error("invalid stream token: {0}")]
	InvalidToken(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
