// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the streaming connection.
///
/// Starts at `Disconnected`; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	#[default]
	Disconnected,
	Authenticating,
	Connected,
	/// Host is in the background; a hard disconnect may be pending.
	Suspended,
	Stopped,
}

impl ConnectionState {
	pub fn is_terminal(self) -> bool {
		self == ConnectionState::Stopped
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Authenticating => "authenticating",
			ConnectionState::Connected => "connected",
			ConnectionState::Suspended => "suspended",
			ConnectionState::Stopped => "stopped",
		};
		f.write_str(name)
	}
}

/// Whether pushed updates can currently be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
	Available,
	Unavailable,
}
