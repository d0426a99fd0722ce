// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Main rollout client implementation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loom_rollout_core::{
	labels, Attributes, ConnectionState, EvaluationResult, Evaluator, Key, MAX_KEY_LENGTH,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::SdkAuthenticator;
use crate::config::{ClientConfig, Endpoints, SdkKey};
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{Result, RolloutError};
use crate::events::{EventBus, Resource, SdkEvent, Subscription};
use crate::http::{HttpRolloutApi, RolloutApi, SDK_VERSION};
use crate::impressions::{Impression, ImpressionListener, ImpressionQueue, SharedImpressionListener};
use crate::lifecycle::{LifecycleBridge, LifecycleEvent};
use crate::localhost::LocalhostApi;
use crate::router::NotificationRouter;
use crate::segments::IdentitySegmentsProcessor;
use crate::storage::{FlagStorage, MemoryFlagStorage, MemorySegmentStorage, SegmentStorage, StorageLookup};
use crate::sync::{SyncConfig, SyncOrchestrator};
use crate::transport::SseTransport;

/// Builder for constructing a [`RolloutClient`].
pub struct RolloutClientBuilder {
	sdk_key: Option<String>,
	base_url: Option<String>,
	stream_url: Option<String>,
	config: ClientConfig,
	impression_listener: Option<SharedImpressionListener>,
	localhost: Option<PathBuf>,
}

impl RolloutClientBuilder {
	pub fn new() -> Self {
		Self {
			sdk_key: None,
			base_url: None,
			stream_url: None,
			config: ClientConfig::default(),
			impression_listener: None,
			localhost: None,
		}
	}

	/// Sets the client-side SDK key.
	pub fn sdk_key(mut self, key: impl Into<String>) -> Self {
		self.sdk_key = Some(key.into());
		self
	}

	/// Sets the base URL of the SDK API.
	///
	/// Example: `https://sdk.example.com`
	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.base_url = Some(url.into());
		self
	}

	/// Overrides the streaming endpoint. Takes precedence over
	/// [`ClientConfig::stream_url`].
	pub fn stream_url(mut self, url: impl Into<String>) -> Self {
		self.stream_url = Some(url.into());
		self
	}

	pub fn config(mut self, config: ClientConfig) -> Self {
		self.config = config;
		self
	}

	pub fn streaming_enabled(mut self, enabled: bool) -> Self {
		self.config.streaming_enabled = enabled;
		self
	}

	pub fn impression_listener(mut self, listener: impl ImpressionListener) -> Self {
		self.impression_listener = Some(Arc::new(listener));
		self
	}

	/// Serves flags from a local JSON file. No SDK key or network access is
	/// needed, and streaming is never used.
	pub fn localhost(mut self, path: impl Into<PathBuf>) -> Self {
		self.localhost = Some(path.into());
		self
	}

	/// Builds the client and starts synchronization.
	///
	/// Must be called from within a tokio runtime.
	#[instrument(skip_all)]
	pub async fn build(self) -> Result<RolloutClient> {
		self.config.validate()?;
		let config = self.config;

		let (api, sync_config, endpoints, source) = match self.localhost {
			Some(path) => {
				let source = format!("localhost:{}", path.display());
				let sync_config = SyncConfig {
					features_refresh_rate: config.localhost_refresh_rate,
					segments_refresh_rate: Duration::ZERO,
					..SyncConfig::from(&config)
				};
				let api: Arc<dyn RolloutApi> = Arc::new(LocalhostApi::new(path));
				(api, sync_config, None, source)
			}
			None => {
				let sdk_key = SdkKey::new(self.sdk_key.ok_or(RolloutError::InvalidSdkKey)?)?;
				let base_url = self.base_url.ok_or(RolloutError::InvalidBaseUrl)?;
				let stream_url = self.stream_url.or_else(|| config.stream_url.clone());
				let endpoints = Endpoints::new(&base_url, stream_url.as_deref())?;
				let api: Arc<dyn RolloutApi> = Arc::new(HttpRolloutApi::new(
					endpoints.clone(),
					sdk_key,
					config.request_timeout,
				)?);
				let source = endpoints.base_url().to_string();
				(api, SyncConfig::from(&config), Some(endpoints), source)
			}
		};

		let events = EventBus::new();
		let flags: Arc<dyn FlagStorage> = Arc::new(MemoryFlagStorage::new());
		let segments: Arc<dyn SegmentStorage> = Arc::new(MemorySegmentStorage::new());
		let sync = SyncOrchestrator::new(
			sync_config,
			Arc::clone(&api),
			Arc::clone(&flags),
			Arc::clone(&segments),
			events.clone(),
		);
		let router = Arc::new(NotificationRouter::new(sync.flag_change_sender()));

		let connection = match endpoints {
			Some(endpoints) if config.streaming_enabled => {
				let transport = SseTransport::new(endpoints.stream(), config.request_timeout)?;
				let manager = ConnectionManager::spawn(
					ConnectionConfig::from(&config),
					Arc::new(SdkAuthenticator::new(Arc::clone(&api))),
					Arc::new(transport),
					Arc::clone(&router),
				);
				sync.attach_stream_status(manager.subscribe_status());
				Some(Arc::new(manager))
			}
			_ => None,
		};

		let cancel = CancellationToken::new();
		let impressions = self.impression_listener.map(|listener| {
			let queue = Arc::new(ImpressionQueue::new(config.impressions_queue_size));
			let worker = Arc::clone(&queue);
			let token = cancel.clone();
			tokio::spawn(async move { worker.run(listener, token).await });
			queue
		});

		let lifecycle = LifecycleBridge::new(sync.clone(), connection.clone());
		sync.start();
		if let Some(connection) = &connection {
			connection.start();
		}

		info!(
			source = %source,
			streaming = connection.is_some(),
			sdk_version = SDK_VERSION,
			"Rollout client initialized"
		);

		Ok(RolloutClient {
			inner: Arc::new(RolloutClientInner {
				config,
				flags,
				segments,
				sync,
				router,
				connection,
				lifecycle,
				events,
				evaluator: Evaluator::default(),
				impressions,
				cancel,
				destroyed: AtomicBool::new(false),
			}),
		})
	}
}

impl Default for RolloutClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct RolloutClientInner {
	config: ClientConfig,
	flags: Arc<dyn FlagStorage>,
	segments: Arc<dyn SegmentStorage>,
	sync: SyncOrchestrator,
	router: Arc<NotificationRouter>,
	connection: Option<Arc<ConnectionManager>>,
	lifecycle: LifecycleBridge,
	events: EventBus,
	evaluator: Evaluator,
	impressions: Option<Arc<ImpressionQueue>>,
	cancel: CancellationToken,
	destroyed: AtomicBool,
}

impl Drop for RolloutClientInner {
	fn drop(&mut self) {
		self.sync.stop();
		self.cancel.cancel();
	}
}

/// Feature flag client: keeps flag definitions and segment memberships in
/// sync and evaluates flags locally.
///
/// # Example
///
/// ```ignore
/// use loom_rollout::{Attributes, Key, RolloutClient};
/// use std::time::Duration;
///
/// let client = RolloutClient::builder()
///     .sdk_key("client-sdk-key")
///     .base_url("https://sdk.example.com")
///     .build()
///     .await?;
///
/// client.register_identity("user-123")?;
/// client.wait_ready("user-123", Duration::from_secs(10)).await?;
///
/// let result = client.evaluate("new_checkout", &Key::new("user-123"), &Attributes::new());
/// if result.treatment == "on" {
///     // new checkout flow
/// }
///
/// client.destroy().await;
/// ```
#[derive(Clone)]
pub struct RolloutClient {
	inner: Arc<RolloutClientInner>,
}

impl RolloutClient {
	pub fn builder() -> RolloutClientBuilder {
		RolloutClientBuilder::new()
	}

	/// Starts tracking segment memberships for an identity and includes it
	/// in the streaming subscription. Registering twice is a no-op.
	pub fn register_identity(&self, key: impl Into<Key>) -> Result<()> {
		self.check_destroyed()?;
		let key = key.into();
		if !key.is_valid() {
			return Err(RolloutError::InvalidKey(format!(
				"matching key must be 1 to {MAX_KEY_LENGTH} characters"
			)));
		}

		let matching_key = key.matching_key();
		let processor = IdentitySegmentsProcessor::new(
			matching_key,
			Arc::clone(&self.inner.segments),
			self.inner.sync.refresh_requester(),
			self.inner.events.clone(),
		);
		if !self.inner.router.register(Arc::new(processor)) {
			debug!(identity = %matching_key, "Identity already registered");
			return Ok(());
		}
		self.inner.sync.register_identity(matching_key);
		if let Some(connection) = &self.inner.connection {
			connection.reauthenticate();
		}
		info!(identity = %matching_key, "Identity registered");
		Ok(())
	}

	/// Stops tracking an identity and drops its cached memberships.
	pub fn unregister_identity(&self, matching_key: &str) -> bool {
		let removed = self.inner.router.unregister(matching_key);
		self.inner.sync.unregister_identity(matching_key);
		if removed {
			if let Some(connection) = &self.inner.connection {
				connection.reauthenticate();
			}
			info!(identity = %matching_key, "Identity unregistered");
		}
		removed
	}

	/// Evaluates a flag against the cached definitions.
	///
	/// Never fails: problems surface as the control treatment with a label
	/// describing the reason.
	pub fn evaluate(&self, flag: &str, key: &Key, attributes: &Attributes) -> EvaluationResult {
		if self.inner.destroyed.load(Ordering::SeqCst) {
			return EvaluationResult::control(labels::CLIENT_DESTROYED);
		}

		let memberships = self.inner.segments.get(key.matching_key());
		let result = self.inner.evaluator.evaluate(
			&StorageLookup(&*self.inner.flags),
			flag,
			key,
			attributes,
			&*memberships,
		);

		if key.is_valid() {
			self.record_impression(flag, key, &result);
		}
		result
	}

	/// Shorthand for [`Self::evaluate`] without attributes.
	pub fn treatment(&self, flag: &str, key: &Key) -> String {
		self.evaluate(flag, key, &Attributes::new()).treatment
	}

	fn record_impression(&self, flag: &str, key: &Key, result: &EvaluationResult) {
		let Some(queue) = &self.inner.impressions else {
			return;
		};
		queue.push(Impression {
			key: key.matching_key().to_string(),
			bucketing_key: key.bucketing_key().to_string(),
			flag: flag.to_string(),
			treatment: result.treatment.clone(),
			label: self
				.inner
				.config
				.labels_enabled
				.then(|| result.label.clone()),
			change_number: result.change_number,
			timestamp: Utc::now(),
		});
	}

	/// Whether flags and this identity's memberships have loaded.
	pub fn is_ready(&self, matching_key: &str) -> bool {
		self.inner.sync.is_identity_ready(matching_key)
	}

	/// Waits until [`Self::is_ready`] holds for the identity.
	pub async fn wait_ready(&self, matching_key: &str, timeout: Duration) -> Result<()> {
		self.check_destroyed()?;
		let mut events = self.inner.events.subscribe();
		let wait = async {
			loop {
				if self.is_ready(matching_key) {
					return Ok(());
				}
				match events.recv().await {
					Ok(_) | Err(RecvError::Lagged(_)) => {}
					Err(RecvError::Closed) => return Err(RolloutError::ClientShutdown),
				}
			}
		};
		match tokio::time::timeout(timeout, wait).await {
			Ok(result) => result,
			Err(_) => {
				warn!(
					identity = %matching_key,
					timeout_ms = timeout.as_millis() as u64,
					"Timed out waiting for readiness"
				);
				Err(RolloutError::ReadyTimeout)
			}
		}
	}

	/// Calls `callback` with the identity each time one becomes ready.
	pub fn on_ready<F>(&self, callback: F) -> Subscription
	where
		F: Fn(String) + Send + 'static,
	{
		self.inner.events.listen(
			|event| matches!(event, SdkEvent::Ready { .. }),
			move |event| {
				if let SdkEvent::Ready { identity } = event {
					callback(identity);
				}
			},
		)
	}

	/// Calls `callback` whenever cached flags or memberships change.
	pub fn on_update<F>(&self, callback: F) -> Subscription
	where
		F: Fn(Resource) + Send + 'static,
	{
		self.inner.events.listen(
			|event| matches!(event, SdkEvent::Updated { .. }),
			move |event| {
				if let SdkEvent::Updated { resource } = event {
					callback(resource);
				}
			},
		)
	}

	/// Raw event stream.
	pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
		self.inner.events.subscribe()
	}

	pub fn on_lifecycle(&self, event: LifecycleEvent) {
		if self.inner.destroyed.load(Ordering::SeqCst) {
			return;
		}
		self.inner.lifecycle.handle(event);
	}

	/// Feeds lifecycle events from a host channel until the client is
	/// destroyed.
	pub fn attach_lifecycle(&self, events: mpsc::UnboundedReceiver<LifecycleEvent>) {
		self.inner
			.lifecycle
			.attach(events, self.inner.cancel.child_token());
	}

	/// Fetches flags and all memberships now.
	pub fn force_refresh(&self) {
		self.inner.sync.force_refresh(None);
	}

	/// `None` when streaming is off.
	pub fn connection_state(&self) -> Option<ConnectionState> {
		self.inner.connection.as_ref().map(|c| c.state())
	}

	pub fn is_degraded(&self, resource: &Resource) -> bool {
		self.inner.sync.is_degraded(resource)
	}

	pub fn is_destroyed(&self) -> bool {
		self.inner.destroyed.load(Ordering::SeqCst)
	}

	/// Stops synchronization, closes the stream and flushes impressions.
	/// Evaluations afterwards return the control treatment.
	pub async fn destroy(&self) {
		if self.inner.destroyed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.inner.sync.stop();
		if let Some(connection) = &self.inner.connection {
			connection.shutdown().await;
		}
		self.inner.cancel.cancel();
		info!("Rollout client destroyed");
	}

	fn check_destroyed(&self) -> Result<()> {
		if self.inner.destroyed.load(Ordering::SeqCst) {
			Err(RolloutError::ClientShutdown)
		} else {
			Ok(())
		}
	}
}
