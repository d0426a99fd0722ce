// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Impression capture for evaluations.
//!
//! Every evaluation records an [`Impression`]. Impressions are queued without
//! blocking the caller and handed to the configured [`ImpressionListener`]
//! from a background task.
//!
//! # Example
//!
//! ```ignore
//! use loom_rollout::{Impression, ImpressionListener, RolloutClient};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ImpressionListener for Printer {
//!     async fn on_impression(&self, impression: Impression) {
//!         println!("{} -> {}", impression.flag, impression.treatment);
//!     }
//! }
//!
//! let client = RolloutClient::builder()
//!     .sdk_key("sdk-key")
//!     .base_url("https://sdk.example.com")
//!     .impression_listener(Printer)
//!     .build()
//!     .await?;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One evaluation as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impression {
	pub key: String,
	pub bucketing_key: String,
	pub flag: String,
	pub treatment: String,
	/// `None` when labels are disabled.
	pub label: Option<String>,
	pub change_number: Option<i64>,
	pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait ImpressionListener: Send + Sync + 'static {
	async fn on_impression(&self, impression: Impression);
}

pub type SharedImpressionListener = Arc<dyn ImpressionListener>;

/// Listener that discards impressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpImpressionListener;

#[async_trait]
impl ImpressionListener for NoOpImpressionListener {
	async fn on_impression(&self, _impression: Impression) {}
}

/// Bounded queue between evaluations and the listener task.
pub struct ImpressionQueue {
	capacity: usize,
	queue: Mutex<VecDeque<Impression>>,
	notify: Notify,
}

impl ImpressionQueue {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			queue: Mutex::new(VecDeque::new()),
			notify: Notify::new(),
		}
	}

	/// Queues an impression, dropping the oldest when full.
	pub fn push(&self, impression: Impression) {
		{
			let mut queue = self.queue.lock();
			while queue.len() >= self.capacity {
				if let Some(dropped) = queue.pop_front() {
					warn!(
						flag = %dropped.flag,
						key = %dropped.key,
						"Dropped impression due to queue overflow"
					);
				}
			}
			queue.push_back(impression);
		}
		self.notify.notify_one();
	}

	pub fn len(&self) -> usize {
		self.queue.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.queue.lock().is_empty()
	}

	fn take_all(&self) -> Vec<Impression> {
		self.queue.lock().drain(..).collect()
	}

	/// Delivers queued impressions until cancelled, then delivers what is left.
	pub async fn run(&self, listener: SharedImpressionListener, cancel: CancellationToken) {
		info!(capacity = self.capacity, "Starting impression listener task");
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = self.notify.notified() => {}
			}
			self.deliver(&listener).await;
		}
		self.deliver(&listener).await;
		info!("Impression listener task stopped");
	}

	async fn deliver(&self, listener: &SharedImpressionListener) {
		let batch = self.take_all();
		if batch.is_empty() {
			return;
		}
		debug!(count = batch.len(), "Delivering impressions");
		for impression in batch {
			listener.on_impression(impression).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn impression(flag: &str) -> Impression {
		Impression {
			key: "user".to_string(),
			bucketing_key: "user".to_string(),
			flag: flag.to_string(),
			treatment: "on".to_string(),
			label: Some("default rule".to_string()),
			change_number: Some(1),
			timestamp: Utc::now(),
		}
	}

	#[derive(Default)]
	struct Recorder {
		seen: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl ImpressionListener for Recorder {
		async fn on_impression(&self, impression: Impression) {
			self.seen.lock().push(impression.flag);
		}
	}

	#[test]
	fn overflow_drops_oldest() {
		let queue = ImpressionQueue::new(2);
		queue.push(impression("a"));
		queue.push(impression("b"));
		queue.push(impression("c"));

		let flags: Vec<String> = queue.take_all().into_iter().map(|i| i.flag).collect();
		assert_eq!(flags, vec!["b".to_string(), "c".to_string()]);
		assert!(queue.is_empty());
	}

	#[tokio::test]
	async fn delivers_in_order_and_drains_on_cancel() {
		let queue = Arc::new(ImpressionQueue::new(10));
		let recorder = Arc::new(Recorder::default());
		let cancel = CancellationToken::new();

		let task = {
			let queue = Arc::clone(&queue);
			let listener: SharedImpressionListener = recorder.clone();
			let cancel = cancel.clone();
			tokio::spawn(async move { queue.run(listener, cancel).await })
		};

		queue.push(impression("a"));
		queue.push(impression("b"));
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(*recorder.seen.lock(), vec!["a".to_string(), "b".to_string()]);

		cancel.cancel();
		queue.push(impression("c"));
		task.await.unwrap();
		assert_eq!(recorder.seen.lock().len(), 3);
	}

	#[test]
	fn impression_serializes() {
		let json = serde_json::to_value(impression("flag")).unwrap();
		assert_eq!(json["flag"], "flag");
		assert_eq!(json["change_number"], 1);
	}
}
