// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SDK lifecycle events and callback subscriptions.

use std::fmt;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

/// A synchronized resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
	Flags,
	/// Segment memberships of one identity, by matching key.
	Segments(String),
}

impl fmt::Display for Resource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Resource::Flags => f.write_str("flags"),
			Resource::Segments(key) => write!(f, "segments:{key}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkEvent {
	/// Flags and the identity's memberships have loaded at least once.
	Ready { identity: String },
	/// Cached state changed.
	Updated { resource: Resource },
	/// Retry budget exhausted; polling continues on schedule.
	Degraded { resource: Resource },
	/// First success after being degraded.
	Recovered { resource: Resource },
	StreamingAvailable,
	StreamingUnavailable,
}

/// Fan-out of [`SdkEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
	tx: broadcast::Sender<SdkEvent>,
}

impl EventBus {
	pub fn new() -> Self {
		let (tx, _) = broadcast::channel(EVENT_CAPACITY);
		Self { tx }
	}

	pub fn emit(&self, event: SdkEvent) {
		debug!(event = ?event, "SDK event");
		let _ = self.tx.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
		self.tx.subscribe()
	}

	/// Runs `callback` for every event accepted by `filter` until the
	/// returned subscription is dropped.
	pub fn listen<P, F>(&self, filter: P, callback: F) -> Subscription
	where
		P: Fn(&SdkEvent) -> bool + Send + 'static,
		F: Fn(SdkEvent) + Send + 'static,
	{
		let mut rx = self.subscribe();
		let task = tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(event) if filter(&event) => callback(event),
					Ok(_) => {}
					Err(RecvError::Lagged(skipped)) => {
						warn!(skipped, "Event subscriber fell behind");
					}
					Err(RecvError::Closed) => break,
				}
			}
		});
		Subscription { task: Some(task) }
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

/// Callback registration; detaches when dropped.
#[derive(Debug)]
pub struct Subscription {
	task: Option<JoinHandle<()>>,
}

impl Subscription {
	/// Keeps the callback attached for the rest of the client's life.
	pub fn forget(mut self) {
		self.task.take();
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex};
	use std::time::Duration;

	#[test]
	fn resource_display() {
		assert_eq!(Resource::Flags.to_string(), "flags");
		assert_eq!(Resource::Segments("u1".to_string()).to_string(), "segments:u1");
	}

	#[tokio::test]
	async fn listener_sees_filtered_events() {
		let bus = EventBus::new();
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		let _subscription = bus.listen(
			|event| matches!(event, SdkEvent::Updated { .. }),
			move |event| sink.lock().unwrap().push(event),
		);

		bus.emit(SdkEvent::StreamingAvailable);
		bus.emit(SdkEvent::Updated {
			resource: Resource::Flags,
		});
		tokio::time::sleep(Duration::from_millis(20)).await;

		assert_eq!(
			*seen.lock().unwrap(),
			vec![SdkEvent::Updated {
				resource: Resource::Flags
			}]
		);
	}

	#[tokio::test]
	async fn dropped_subscription_stops_callbacks() {
		let bus = EventBus::new();
		let seen = Arc::new(Mutex::new(0));
		let sink = Arc::clone(&seen);
		let subscription = bus.listen(|_| true, move |_| *sink.lock().unwrap() += 1);
		drop(subscription);

		bus.emit(SdkEvent::StreamingAvailable);
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(*seen.lock().unwrap(), 0);
	}
}
