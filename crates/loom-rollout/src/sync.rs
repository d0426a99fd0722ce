// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Synchronization orchestrator.
//!
//! Keeps the flag cache and every registered identity's memberships fresh.
//! Each resource has its own periodic loop and its own fetch slot: at most one
//! fetch per resource runs at a time, and requests arriving mid-flight are
//! folded into a single follow-up fetch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loom_rollout_core::{backoff_delay, FlagChangeSet, StreamStatus};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{Result, RolloutError};
use crate::events::{EventBus, Resource, SdkEvent};
use crate::http::RolloutApi;
use crate::storage::{FlagStorage, SegmentChange, SegmentStorage};

/// Upper bound on `flagChanges` pages followed in one fetch.
const MAX_FLAG_PAGES: usize = 10;

/// Global change pushed by the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagChange {
	Update {
		change_number: i64,
	},
	Kill {
		name: String,
		default_treatment: String,
		change_number: i64,
	},
}

/// Lets push handlers ask the orchestrator for a fetch.
#[derive(Debug, Clone)]
pub struct RefreshRequester {
	tx: mpsc::UnboundedSender<Resource>,
}

impl RefreshRequester {
	pub fn new(tx: mpsc::UnboundedSender<Resource>) -> Self {
		Self { tx }
	}

	pub fn request(&self, resource: Resource) {
		if self.tx.send(resource).is_err() {
			debug!("Refresh queue closed");
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
	/// Zero disables periodic flag polling.
	pub features_refresh_rate: Duration,
	/// Zero disables periodic membership polling.
	pub segments_refresh_rate: Duration,
	pub backoff_base: Duration,
	pub backoff_max: Duration,
	/// Consecutive failures before a resource is reported degraded.
	pub retry_budget: u32,
}

impl From<&ClientConfig> for SyncConfig {
	fn from(config: &ClientConfig) -> Self {
		Self {
			features_refresh_rate: config.features_refresh_rate,
			segments_refresh_rate: config.segments_refresh_rate,
			backoff_base: config.polling_backoff_base,
			backoff_max: config.polling_backoff_max,
			retry_budget: config.polling_retry_budget,
		}
	}
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self::from(&ClientConfig::default())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Gate {
	paused: bool,
	streaming: bool,
	stopped: bool,
}

impl Gate {
	fn polling(&self) -> bool {
		!self.paused && !self.streaming && !self.stopped
	}
}

#[derive(Debug, Default)]
struct FetchSlot {
	in_flight: AtomicBool,
	rerun: AtomicBool,
	failures: AtomicU32,
	degraded: AtomicBool,
}

struct SyncInner {
	config: SyncConfig,
	api: Arc<dyn RolloutApi>,
	flags: Arc<dyn FlagStorage>,
	segments: Arc<dyn SegmentStorage>,
	events: EventBus,
	gate: watch::Sender<Gate>,
	cancel: CancellationToken,
	started: AtomicBool,
	slots: Mutex<HashMap<Resource, Arc<FetchSlot>>>,
	/// Registered identities and the token stopping their polling loop.
	identities: Mutex<HashMap<String, CancellationToken>>,
	loaded: Mutex<HashSet<String>>,
	ready: Mutex<HashSet<String>>,
	refresh_tx: mpsc::UnboundedSender<Resource>,
	change_tx: mpsc::UnboundedSender<FlagChange>,
	queues: Mutex<Option<(mpsc::UnboundedReceiver<Resource>, mpsc::UnboundedReceiver<FlagChange>)>>,
}

/// Coordinates polling, push-triggered fetches and pause/resume.
///
/// Cloning yields another handle to the same orchestrator.
#[derive(Clone)]
pub struct SyncOrchestrator {
	inner: Arc<SyncInner>,
}

impl SyncOrchestrator {
	pub fn new(
		config: SyncConfig,
		api: Arc<dyn RolloutApi>,
		flags: Arc<dyn FlagStorage>,
		segments: Arc<dyn SegmentStorage>,
		events: EventBus,
	) -> Self {
		let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
		let (change_tx, change_rx) = mpsc::unbounded_channel();
		let (gate, _) = watch::channel(Gate::default());
		Self {
			inner: Arc::new(SyncInner {
				config,
				api,
				flags,
				segments,
				events,
				gate,
				cancel: CancellationToken::new(),
				started: AtomicBool::new(false),
				slots: Mutex::new(HashMap::new()),
				identities: Mutex::new(HashMap::new()),
				loaded: Mutex::new(HashSet::new()),
				ready: Mutex::new(HashSet::new()),
				refresh_tx,
				change_tx,
				queues: Mutex::new(Some((refresh_rx, change_rx))),
			}),
		}
	}

	/// Sender for the router's flag change queue.
	pub fn flag_change_sender(&self) -> mpsc::UnboundedSender<FlagChange> {
		self.inner.change_tx.clone()
	}

	pub fn refresh_requester(&self) -> RefreshRequester {
		RefreshRequester::new(self.inner.refresh_tx.clone())
	}

	/// Follows stream availability: polling is suspended while the stream is
	/// available, and every transition to available triggers a catch-up sync.
	pub fn attach_stream_status(&self, mut status: broadcast::Receiver<StreamStatus>) {
		let inner = Arc::clone(&self.inner);
		tokio::spawn(async move {
			loop {
				let received = tokio::select! {
					_ = inner.cancel.cancelled() => return,
					received = status.recv() => received,
				};
				match received {
					Ok(StreamStatus::Available) => {
						info!("Streaming available, suspending polling");
						inner.gate.send_modify(|g| g.streaming = true);
						inner.events.emit(SdkEvent::StreamingAvailable);
						inner.trigger_all();
					}
					Ok(StreamStatus::Unavailable) => {
						info!("Streaming unavailable, polling resumes");
						inner.gate.send_modify(|g| g.streaming = false);
						inner.events.emit(SdkEvent::StreamingUnavailable);
					}
					Err(RecvError::Lagged(skipped)) => {
						warn!(skipped, "Stream status updates lagged");
					}
					Err(RecvError::Closed) => {
						inner.gate.send_modify(|g| g.streaming = false);
						return;
					}
				}
			}
		});
	}

	/// Starts the periodic loops and performs the initial fetches. Later
	/// calls are ignored.
	pub fn start(&self) {
		let inner = &self.inner;
		if inner.cancel.is_cancelled() || inner.started.swap(true, Ordering::SeqCst) {
			return;
		}
		info!(
			features_refresh_secs = inner.config.features_refresh_rate.as_secs(),
			segments_refresh_secs = inner.config.segments_refresh_rate.as_secs(),
			"Starting synchronization"
		);

		if let Some((refresh_rx, change_rx)) = inner.queues.lock().take() {
			inner.spawn_refresh_consumer(refresh_rx);
			inner.spawn_change_consumer(change_rx);
		}

		inner.spawn_periodic(
			Resource::Flags,
			inner.config.features_refresh_rate,
			inner.cancel.child_token(),
		);
		let identities: Vec<(String, CancellationToken)> = inner
			.identities
			.lock()
			.iter()
			.map(|(key, token)| (key.clone(), token.clone()))
			.collect();
		for (key, token) in identities {
			inner.spawn_periodic(
				Resource::Segments(key),
				inner.config.segments_refresh_rate,
				token,
			);
		}
		inner.trigger_all();
	}

	/// Suspends periodic polling. Schedules are kept for [`Self::resume`].
	pub fn pause(&self) {
		debug!("Pausing periodic polling");
		self.inner.gate.send_modify(|g| g.paused = true);
	}

	/// Resumes periodic polling; a tick that fell due while paused fires now.
	pub fn resume(&self) {
		debug!("Resuming periodic polling");
		self.inner.gate.send_modify(|g| g.paused = false);
	}

	/// Cancels every loop and outstanding fetch. Results arriving later are
	/// discarded.
	pub fn stop(&self) {
		if self.inner.cancel.is_cancelled() {
			return;
		}
		info!("Stopping synchronization");
		self.inner.gate.send_modify(|g| g.stopped = true);
		self.inner.cancel.cancel();
	}

	/// Fetches `resource` now, or everything when `None`.
	pub fn force_refresh(&self, resource: Option<Resource>) {
		match resource {
			Some(resource) => self.inner.trigger(resource),
			None => self.inner.trigger_all(),
		}
	}

	/// Starts tracking an identity's memberships. Returns `false` if it was
	/// already registered or the orchestrator has stopped.
	pub fn register_identity(&self, matching_key: &str) -> bool {
		let inner = &self.inner;
		if inner.cancel.is_cancelled() {
			return false;
		}
		let token = {
			let mut identities = inner.identities.lock();
			if identities.contains_key(matching_key) {
				return false;
			}
			let token = inner.cancel.child_token();
			identities.insert(matching_key.to_string(), token.clone());
			inner.segments.register(matching_key);
			token
		};
		debug!(identity = %matching_key, "Identity registered for sync");

		if inner.started.load(Ordering::SeqCst) {
			let resource = Resource::Segments(matching_key.to_string());
			inner.spawn_periodic(resource.clone(), inner.config.segments_refresh_rate, token);
			inner.trigger(resource);
		}
		true
	}

	pub fn unregister_identity(&self, matching_key: &str) -> bool {
		let inner = &self.inner;
		let Some(token) = inner.identities.lock().remove(matching_key) else {
			return false;
		};
		token.cancel();
		inner.loaded.lock().remove(matching_key);
		inner.ready.lock().remove(matching_key);
		inner
			.slots
			.lock()
			.remove(&Resource::Segments(matching_key.to_string()));
		inner.segments.clear(matching_key);
		debug!(identity = %matching_key, "Identity unregistered from sync");
		true
	}

	pub fn is_degraded(&self, resource: &Resource) -> bool {
		self.inner
			.slots
			.lock()
			.get(resource)
			.is_some_and(|slot| slot.degraded.load(Ordering::SeqCst))
	}

	/// Whether [`SdkEvent::Ready`] has fired for this identity.
	pub fn is_identity_ready(&self, matching_key: &str) -> bool {
		self.inner.ready.lock().contains(matching_key)
	}

	pub fn is_stopped(&self) -> bool {
		self.inner.cancel.is_cancelled()
	}
}

impl SyncInner {
	fn trigger_all(self: &Arc<Self>) {
		self.trigger(Resource::Flags);
		let keys: Vec<String> = self.identities.lock().keys().cloned().collect();
		for key in keys {
			self.trigger(Resource::Segments(key));
		}
	}

	/// Runs a fetch for `resource`, or marks the running one for a rerun.
	fn trigger(self: &Arc<Self>, resource: Resource) {
		if self.cancel.is_cancelled() {
			return;
		}
		if let Resource::Segments(key) = &resource {
			if !self.identities.lock().contains_key(key) {
				debug!(identity = %key, "Ignoring refresh for unregistered identity");
				return;
			}
		}

		let slot = self.slot(&resource);
		slot.rerun.store(true, Ordering::SeqCst);
		if slot.in_flight.swap(true, Ordering::SeqCst) {
			debug!(resource = %resource, "Fetch in flight, coalescing");
			return;
		}

		let inner = Arc::clone(self);
		tokio::spawn(async move { inner.drive(resource, slot).await });
	}

	fn slot(&self, resource: &Resource) -> Arc<FetchSlot> {
		Arc::clone(self.slots.lock().entry(resource.clone()).or_default())
	}

	async fn drive(self: Arc<Self>, resource: Resource, slot: Arc<FetchSlot>) {
		loop {
			while slot.rerun.swap(false, Ordering::SeqCst) {
				tokio::select! {
					_ = self.cancel.cancelled() => {
						slot.in_flight.store(false, Ordering::SeqCst);
						return;
					}
					_ = self.fetch_with_retry(&resource, &slot) => {}
				}
			}
			slot.in_flight.store(false, Ordering::SeqCst);

			// A trigger may have set `rerun` after the last check but still
			// seen the slot busy.
			if !slot.rerun.load(Ordering::SeqCst) || slot.in_flight.swap(true, Ordering::SeqCst) {
				return;
			}
		}
	}

	async fn fetch_with_retry(&self, resource: &Resource, slot: &FetchSlot) {
		let mut attempt = 0u32;
		loop {
			let error = match self.fetch(resource).await {
				Ok(()) => {
					slot.failures.store(0, Ordering::SeqCst);
					if slot.degraded.swap(false, Ordering::SeqCst) {
						info!(resource = %resource, "Resource recovered");
						self.events.emit(SdkEvent::Recovered {
							resource: resource.clone(),
						});
					}
					return;
				}
				Err(e) => e,
			};

			let failures = slot.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
			if failures >= self.config.retry_budget {
				if !slot.degraded.swap(true, Ordering::SeqCst) {
					error!(
						resource = %resource,
						failures,
						error = %error,
						"Retry budget exhausted, resource degraded"
					);
					self.events.emit(SdkEvent::Degraded {
						resource: resource.clone(),
					});
				}
				return;
			}
			if !error.is_retryable() {
				warn!(resource = %resource, error = %error, "Fetch failed");
				return;
			}

			let delay = self.retry_delay(&error, attempt);
			attempt = attempt.saturating_add(1);
			warn!(
				resource = %resource,
				error = %error,
				attempt,
				retry_in_secs = delay.as_secs_f64(),
				"Fetch failed, retrying"
			);
			tokio::time::sleep(delay).await;
		}
	}

	fn retry_delay(&self, error: &RolloutError, attempt: u32) -> Duration {
		match error {
			RolloutError::RateLimited {
				retry_after_secs: Some(secs),
			} => Duration::from_secs(*secs).min(self.config.backoff_max),
			_ => backoff_delay(self.config.backoff_base, self.config.backoff_max, attempt),
		}
	}

	async fn fetch(&self, resource: &Resource) -> Result<()> {
		match resource {
			Resource::Flags => self.fetch_flags().await,
			Resource::Segments(key) => self.fetch_segments(key).await,
		}
	}

	async fn fetch_flags(&self) -> Result<()> {
		let mut changed = false;
		for _ in 0..MAX_FLAG_PAGES {
			let since = self.flags.change_number();
			let dto = self.api.fetch_flag_changes(since).await?;
			let till = dto.till;

			let (changes, skipped) = FlagChangeSet::from_dto(dto);
			for (name, e) in skipped {
				warn!(flag = %name, error = %e, "Skipping flag that failed to convert");
			}
			let summary = self.flags.update(changes);
			if !summary.is_empty() {
				debug!(
					updated = summary.updated.len(),
					removed = summary.removed.len(),
					stale = summary.stale,
					till,
					"Applied flag changes"
				);
				changed = true;
			}
			if till <= since {
				break;
			}
		}

		if changed {
			self.events.emit(SdkEvent::Updated {
				resource: Resource::Flags,
			});
		}
		let loaded: Vec<String> = self.loaded.lock().iter().cloned().collect();
		for key in loaded {
			self.check_ready(&key);
		}
		Ok(())
	}

	async fn fetch_segments(&self, matching_key: &str) -> Result<()> {
		let memberships = self.api.fetch_memberships(matching_key).await?;
		// Held across the write so an unregister cannot slip in between.
		let identities = self.identities.lock();
		if !identities.contains_key(matching_key) {
			debug!(identity = %matching_key, "Discarding memberships for unregistered identity");
			return Ok(());
		}
		let changed = self
			.segments
			.update(matching_key, SegmentChange::Replace(memberships));
		drop(identities);

		if changed {
			self.events.emit(SdkEvent::Updated {
				resource: Resource::Segments(matching_key.to_string()),
			});
		}
		self.loaded.lock().insert(matching_key.to_string());
		self.check_ready(matching_key);
		Ok(())
	}

	fn check_ready(&self, matching_key: &str) {
		if !self.flags.is_ready() || !self.loaded.lock().contains(matching_key) {
			return;
		}
		if self.ready.lock().insert(matching_key.to_string()) {
			info!(identity = %matching_key, "Identity ready");
			self.events.emit(SdkEvent::Ready {
				identity: matching_key.to_string(),
			});
		}
	}

	fn spawn_periodic(self: &Arc<Self>, resource: Resource, interval: Duration, cancel: CancellationToken) {
		if interval.is_zero() {
			debug!(resource = %resource, "Periodic polling disabled");
			return;
		}

		let inner = Arc::clone(self);
		tokio::spawn(async move {
			let mut gate = inner.gate.subscribe();
			let mut next_due = Instant::now() + interval;
			loop {
				let polling = gate.borrow_and_update().polling();
				if !polling {
					tokio::select! {
						_ = cancel.cancelled() => return,
						changed = gate.changed() => {
							if changed.is_err() {
								return;
							}
							continue;
						}
					}
				}

				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = sleep_until(next_due) => {
						inner.trigger(resource.clone());
						next_due = Instant::now() + interval;
					}
					changed = gate.changed() => {
						if changed.is_err() {
							return;
						}
					}
				}
			}
		});
	}

	fn spawn_refresh_consumer(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Resource>) {
		let inner = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				let resource = tokio::select! {
					_ = inner.cancel.cancelled() => return,
					resource = rx.recv() => resource,
				};
				match resource {
					Some(resource) => inner.trigger(resource),
					None => return,
				}
			}
		});
	}

	fn spawn_change_consumer(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<FlagChange>) {
		let inner = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				let change = tokio::select! {
					_ = inner.cancel.cancelled() => return,
					change = rx.recv() => change,
				};
				match change {
					Some(change) => inner.apply_change(change),
					None => return,
				}
			}
		});
	}

	fn apply_change(self: &Arc<Self>, change: FlagChange) {
		let change_number = match change {
			FlagChange::Update { change_number } => change_number,
			FlagChange::Kill {
				name,
				default_treatment,
				change_number,
			} => {
				if self.flags.kill(&name, &default_treatment, change_number) {
					info!(flag = %name, change_number, "Flag killed");
					self.events.emit(SdkEvent::Updated {
						resource: Resource::Flags,
					});
				}
				change_number
			}
		};

		let cached = self.flags.change_number();
		if change_number > cached {
			self.trigger(Resource::Flags);
		} else {
			debug!(change_number, cached, "Ignoring stale flag change");
		}
	}
}
