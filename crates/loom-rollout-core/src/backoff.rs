// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

/// Exponential delay for the given zero-based attempt, capped at `max`.
///
/// `base * 2^attempt`, with the exponent clamped so the multiplication
/// cannot overflow.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
	let factor = 2u64.saturating_pow(attempt.min(20));
	let delay_ms = (base.as_millis() as u64).saturating_mul(factor);
	Duration::from_millis(delay_ms.min(max.as_millis() as u64))
}

/// Retry-delay generator that remembers consecutive failures.
#[derive(Debug, Clone)]
pub struct BackoffCounter {
	base: Duration,
	max: Duration,
	attempt: u32,
}

impl BackoffCounter {
	pub fn new(base: Duration, max: Duration) -> Self {
		Self {
			base,
			max: max.max(base),
			attempt: 0,
		}
	}

	/// Returns the delay for the next attempt and advances the counter.
	pub fn next_delay(&mut self) -> Duration {
		let delay = backoff_delay(self.base, self.max, self.attempt);
		self.attempt = self.attempt.saturating_add(1);
		delay
	}

	/// Returns to the floor after a success.
	pub fn reset(&mut self) {
		self.attempt = 0;
	}

	pub fn attempts(&self) -> u32 {
		self.attempt
	}

	pub fn max(&self) -> Duration {
		self.max
	}
}
