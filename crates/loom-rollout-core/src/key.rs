// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Longest matching or bucketing key accepted for evaluation.
pub const MAX_KEY_LENGTH: usize = 250;

/// Attributes supplied by the host at evaluation time.
pub type Attributes = HashMap<String, serde_json::Value>;

/// Identity being evaluated.
///
/// The matching key selects rules and segment memberships; the bucketing key
/// (defaulting to the matching key) feeds traffic allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
	matching_key: String,
	bucketing_key: Option<String>,
}

impl Key {
	pub fn new(matching_key: impl Into<String>) -> Self {
		Self {
			matching_key: matching_key.into(),
			bucketing_key: None,
		}
	}

	pub fn with_bucketing_key(mut self, bucketing_key: impl Into<String>) -> Self {
		self.bucketing_key = Some(bucketing_key.into());
		self
	}

	pub fn matching_key(&self) -> &str {
		&self.matching_key
	}

	/// Returns the bucketing key, falling back to the matching key.
	pub fn bucketing_key(&self) -> &str {
		self.bucketing_key.as_deref().unwrap_or(&self.matching_key)
	}

	/// Checks both keys are non-empty and within [`MAX_KEY_LENGTH`].
	pub fn is_valid(&self) -> bool {
		let valid = |k: &str| !k.trim().is_empty() && k.len() <= MAX_KEY_LENGTH;
		valid(&self.matching_key) && self.bucketing_key.as_deref().map_or(true, valid)
	}
}

impl From<&str> for Key {
	fn from(value: &str) -> Self {
		Key::new(value)
	}
}

impl From<String> for Key {
	fn from(value: String) -> Self {
		Key::new(value)
	}
}

impl std::fmt::Display for Key {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.bucketing_key {
			Some(b) => write!(f, "{}/{}", self.matching_key, b),
			None => write!(f, "{}", self.matching_key),
		}
	}
}
