// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host application lifecycle signals.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connection::ConnectionManager;
use crate::sync::SyncOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
	Foreground,
	Background,
}

/// Forwards lifecycle events to the orchestrator and the connection manager.
#[derive(Clone)]
pub struct LifecycleBridge {
	sync: SyncOrchestrator,
	connection: Option<Arc<ConnectionManager>>,
}

impl LifecycleBridge {
	pub fn new(sync: SyncOrchestrator, connection: Option<Arc<ConnectionManager>>) -> Self {
		Self { sync, connection }
	}

	pub fn handle(&self, event: LifecycleEvent) {
		info!(?event, "Lifecycle event");
		match event {
			LifecycleEvent::Background => {
				self.sync.pause();
				if let Some(connection) = &self.connection {
					connection.on_background();
				}
			}
			LifecycleEvent::Foreground => {
				self.sync.resume();
				if let Some(connection) = &self.connection {
					connection.on_foreground();
				}
			}
		}
	}

	/// Consumes events from a host-provided channel until it closes or
	/// `cancel` fires.
	pub fn attach(&self, mut events: mpsc::UnboundedReceiver<LifecycleEvent>, cancel: CancellationToken) {
		let bridge = self.clone();
		tokio::spawn(async move {
			loop {
				let event = tokio::select! {
					_ = cancel.cancelled() => return,
					event = events.recv() => event,
				};
				match event {
					Some(event) => bridge.handle(event),
					None => return,
				}
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::auth::{AuthOutcome, Authenticator};
	use crate::connection::ConnectionConfig;
	use crate::events::EventBus;
	use crate::http::MockRolloutApi;
	use crate::router::NotificationRouter;
	use crate::storage::{MemoryFlagStorage, MemorySegmentStorage};
	use crate::sync::SyncConfig;
	use crate::transport::{StreamTransport, TransportEvent, TransportHandle};
	use async_trait::async_trait;
	use loom_rollout_core::{ConnectionState, FlagChangesDto, StreamToken};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	struct NeverAuthenticates;

	#[async_trait]
	impl Authenticator for NeverAuthenticates {
		async fn authenticate(&self, _matching_keys: &[String]) -> AuthOutcome {
			AuthOutcome::StreamingDisabled
		}
	}

	struct NoTransport;

	impl StreamTransport for NoTransport {
		fn connect(&self, _token: &StreamToken, _events: mpsc::Sender<TransportEvent>) -> TransportHandle {
			TransportHandle::detached()
		}
	}

	fn counting_api(calls: Arc<AtomicUsize>) -> MockRolloutApi {
		let mut api = MockRolloutApi::new();
		api.expect_fetch_flag_changes().returning(move |since| {
			calls.fetch_add(1, Ordering::SeqCst);
			Ok(FlagChangesDto {
				splits: Vec::new(),
				since,
				till: since.max(1),
			})
		});
		api
	}

	#[test]
	fn event_serializes_snake_case() {
		assert_eq!(
			serde_json::to_string(&LifecycleEvent::Background).unwrap(),
			"\"background\""
		);
	}

	#[tokio::test(start_paused = true)]
	async fn background_pauses_polling_and_suspends_connection() {
		let calls = Arc::new(AtomicUsize::new(0));
		let sync = SyncOrchestrator::new(
			SyncConfig {
				features_refresh_rate: Duration::from_secs(10),
				..SyncConfig::default()
			},
			Arc::new(counting_api(calls.clone())),
			Arc::new(MemoryFlagStorage::new()),
			Arc::new(MemorySegmentStorage::new()),
			EventBus::new(),
		);
		let (change_tx, _change_rx) = mpsc::unbounded_channel();
		let connection = Arc::new(ConnectionManager::spawn(
			ConnectionConfig::default(),
			Arc::new(NeverAuthenticates),
			Arc::new(NoTransport),
			Arc::new(NotificationRouter::new(change_tx)),
		));
		let bridge = LifecycleBridge::new(sync.clone(), Some(connection.clone()));

		sync.start();
		connection.start();
		tokio::time::sleep(Duration::from_millis(1)).await;
		let after_start = calls.load(Ordering::SeqCst);

		let (tx, rx) = mpsc::unbounded_channel();
		bridge.attach(rx, CancellationToken::new());
		tx.send(LifecycleEvent::Background).unwrap();
		tokio::time::sleep(Duration::from_secs(55)).await;
		assert_eq!(calls.load(Ordering::SeqCst), after_start);
		assert_eq!(connection.state(), ConnectionState::Suspended);

		tx.send(LifecycleEvent::Foreground).unwrap();
		tokio::time::sleep(Duration::from_millis(1)).await;
		assert_eq!(calls.load(Ordering::SeqCst), after_start + 1);
		assert_eq!(connection.state(), ConnectionState::Disconnected);
	}
}
