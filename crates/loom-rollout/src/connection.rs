// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Streaming connection manager.
//!
//! A single task owns the connection state machine. Commands, authentication
//! results, transport events and timer deadlines all arrive through one
//! `select!` loop, so transitions never run concurrently.
//!
//! ```text
//! Disconnected --start--> Authenticating --token--> Connected
//!      ^                        |                       |
//!      +---- backoff timer -----+---- stream failure ---+
//! any --background--> Suspended --foreground--> (previous, re-auth if dropped)
//! any --stop / invalid credentials / streaming disabled--> Stopped
//! ```

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use loom_rollout_core::{
	decode, BackoffCounter, ConnectionState, ControlType, Notification, RawFrame, StreamStatus,
	StreamToken,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{AuthOutcome, Authenticator};
use crate::config::ClientConfig;
use crate::router::NotificationRouter;
use crate::transport::{StreamTransport, TransportEvent, TransportHandle};

const TRANSPORT_BUFFER: usize = 256;
const STATUS_CAPACITY: usize = 16;

/// Timing knobs for the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
	pub keep_alive_timeout: Duration,
	pub token_refresh_margin: Duration,
	pub background_disconnect_delay: Duration,
	pub auth_backoff_base: Duration,
	pub auth_backoff_max: Duration,
	pub stream_backoff_base: Duration,
	pub stream_backoff_max: Duration,
}

impl From<&ClientConfig> for ConnectionConfig {
	fn from(config: &ClientConfig) -> Self {
		Self {
			keep_alive_timeout: config.keep_alive_timeout,
			token_refresh_margin: config.token_refresh_margin,
			background_disconnect_delay: config.background_disconnect_delay,
			auth_backoff_base: config.auth_backoff_base,
			auth_backoff_max: config.auth_backoff_max,
			stream_backoff_base: config.stream_backoff_base,
			stream_backoff_max: config.stream_backoff_max,
		}
	}
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self::from(&ClientConfig::default())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionCommand {
	Start,
	Stop,
	Background,
	Foreground,
	Reauthenticate,
}

/// Handle to the connection task. Every method is safe to call at any time
/// and from any thread; calls after stop are ignored.
pub struct ConnectionManager {
	commands: mpsc::UnboundedSender<ConnectionCommand>,
	state: watch::Receiver<ConnectionState>,
	status: broadcast::Sender<StreamStatus>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
	/// Spawns the connection task in the `Disconnected` state.
	pub fn spawn(
		config: ConnectionConfig,
		authenticator: Arc<dyn Authenticator>,
		transport: Arc<dyn StreamTransport>,
		router: Arc<NotificationRouter>,
	) -> Self {
		let (commands, command_rx) = mpsc::unbounded_channel();
		let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
		let (status, _) = broadcast::channel(STATUS_CAPACITY);

		let actor = ConnectionActor {
			auth_backoff: BackoffCounter::new(config.auth_backoff_base, config.auth_backoff_max),
			stream_backoff: BackoffCounter::new(config.stream_backoff_base, config.stream_backoff_max),
			config,
			authenticator,
			transport,
			router,
			state_tx,
			status_tx: status.clone(),
			phase: ConnectionState::Disconnected,
			token: None,
			stream: None,
			events: None,
			auth_task: None,
			timers: Timers::default(),
			started: false,
			background: false,
			stream_open: false,
			paused: false,
			occupancy: HashMap::new(),
			last_status: None,
		};
		let task = tokio::spawn(actor.run(command_rx));

		Self {
			commands,
			state,
			status,
			task: Mutex::new(Some(task)),
		}
	}

	/// Begins authenticating. Later calls are ignored.
	pub fn start(&self) {
		self.send(ConnectionCommand::Start);
	}

	/// Stops streaming for good: cancels timers and closes the transport.
	pub fn stop(&self) {
		self.send(ConnectionCommand::Stop);
	}

	pub fn on_background(&self) {
		self.send(ConnectionCommand::Background);
	}

	pub fn on_foreground(&self) {
		self.send(ConnectionCommand::Foreground);
	}

	/// Requests a fresh token, e.g. after the identity set changed.
	pub fn reauthenticate(&self) {
		self.send(ConnectionCommand::Reauthenticate);
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
		self.state.clone()
	}

	/// Availability changes. Only transitions are reported.
	pub fn subscribe_status(&self) -> broadcast::Receiver<StreamStatus> {
		self.status.subscribe()
	}

	/// Stops and waits for the connection task to finish.
	pub async fn shutdown(&self) {
		self.stop();
		let task = self.task.lock().take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}

	fn send(&self, command: ConnectionCommand) {
		if self.commands.send(command).is_err() {
			debug!(?command, "Connection task already finished");
		}
	}
}

impl Drop for ConnectionManager {
	fn drop(&mut self) {
		if let Some(task) = self.task.lock().take() {
			task.abort();
		}
	}
}

/// Pending deadlines. `None` means not armed.
#[derive(Debug, Default)]
struct Timers {
	keep_alive: Option<Instant>,
	token_refresh: Option<Instant>,
	auth_retry: Option<Instant>,
	reconnect: Option<Instant>,
	background_disconnect: Option<Instant>,
}

impl Timers {
	fn clear(&mut self) {
		*self = Timers::default();
	}
}

enum Input {
	Command(Option<ConnectionCommand>),
	Auth(AuthOutcome),
	Transport(Option<TransportEvent>),
	KeepAliveExpired,
	TokenRefreshDue,
	AuthRetryDue,
	ReconnectDue,
	BackgroundDisconnectDue,
}

struct ConnectionActor {
	config: ConnectionConfig,
	authenticator: Arc<dyn Authenticator>,
	transport: Arc<dyn StreamTransport>,
	router: Arc<NotificationRouter>,
	state_tx: watch::Sender<ConnectionState>,
	status_tx: broadcast::Sender<StreamStatus>,
	auth_backoff: BackoffCounter,
	stream_backoff: BackoffCounter,
	/// State ignoring the background overlay.
	phase: ConnectionState,
	token: Option<StreamToken>,
	stream: Option<TransportHandle>,
	events: Option<mpsc::Receiver<TransportEvent>>,
	auth_task: Option<JoinHandle<AuthOutcome>>,
	timers: Timers,
	started: bool,
	background: bool,
	stream_open: bool,
	/// Server sent STREAMING_PAUSED.
	paused: bool,
	/// Publishers per control channel.
	occupancy: HashMap<String, u32>,
	last_status: Option<StreamStatus>,
}

impl ConnectionActor {
	async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ConnectionCommand>) {
		while self.phase != ConnectionState::Stopped {
			let input = tokio::select! {
				command = commands.recv() => Input::Command(command),
				outcome = join_auth(&mut self.auth_task) => Input::Auth(outcome),
				event = recv_event(&mut self.events) => Input::Transport(event),
				_ = sleep_until_opt(self.timers.keep_alive) => Input::KeepAliveExpired,
				_ = sleep_until_opt(self.timers.token_refresh) => Input::TokenRefreshDue,
				_ = sleep_until_opt(self.timers.auth_retry) => Input::AuthRetryDue,
				_ = sleep_until_opt(self.timers.reconnect) => Input::ReconnectDue,
				_ = sleep_until_opt(self.timers.background_disconnect) => Input::BackgroundDisconnectDue,
			};
			self.handle(input);
		}
		debug!("Connection task finished");
	}

	fn handle(&mut self, input: Input) {
		match input {
			Input::Command(Some(command)) => self.handle_command(command),
			Input::Command(None) => self.stop(),
			Input::Auth(outcome) => {
				self.auth_task = None;
				self.handle_auth(outcome);
			}
			Input::Transport(Some(event)) => self.handle_transport(event),
			Input::Transport(None) => self.on_stream_failure("transport channel closed"),
			Input::KeepAliveExpired => {
				self.timers.keep_alive = None;
				warn!(
					timeout_secs = self.config.keep_alive_timeout.as_secs(),
					"No stream activity within keep-alive window"
				);
				self.on_stream_failure("keep-alive timeout");
			}
			Input::TokenRefreshDue => {
				self.timers.token_refresh = None;
				info!("Refreshing streaming token before expiry");
				self.begin_auth();
			}
			Input::AuthRetryDue => {
				self.timers.auth_retry = None;
				self.begin_auth();
			}
			Input::ReconnectDue => {
				self.timers.reconnect = None;
				self.begin_auth();
			}
			Input::BackgroundDisconnectDue => {
				self.timers.background_disconnect = None;
				self.background_disconnect();
			}
		}
	}

	fn handle_command(&mut self, command: ConnectionCommand) {
		debug!(?command, state = %self.phase, "Connection command");
		match command {
			ConnectionCommand::Start => {
				if !self.started {
					self.started = true;
					self.begin_auth();
				}
			}
			ConnectionCommand::Stop => self.stop(),
			ConnectionCommand::Background => {
				if !self.background {
					self.background = true;
					self.timers.background_disconnect =
						Some(Instant::now() + self.config.background_disconnect_delay);
					self.publish_state();
				}
			}
			ConnectionCommand::Foreground => {
				if !self.background {
					return;
				}
				self.background = false;
				self.timers.background_disconnect = None;
				if self.started && self.is_idle() {
					info!("Foregrounded with no live connection, reconnecting");
					self.begin_auth();
				} else {
					self.publish_state();
				}
			}
			ConnectionCommand::Reauthenticate => {
				if !self.started || (self.background && self.is_idle()) {
					return;
				}
				if self.timers.auth_retry.is_some() {
					debug!("Authentication retry already scheduled, keeping backoff");
					return;
				}
				self.begin_auth();
			}
		}
	}

	fn begin_auth(&mut self) {
		if let Some(task) = self.auth_task.take() {
			task.abort();
		}
		self.timers.auth_retry = None;
		self.timers.reconnect = None;

		let keys = self.router.registered_keys();
		if keys.is_empty() {
			debug!("No identities registered, streaming idle");
			self.close_stream();
			self.set_phase(ConnectionState::Disconnected);
			self.update_status();
			return;
		}

		self.set_phase(ConnectionState::Authenticating);
		let authenticator = Arc::clone(&self.authenticator);
		self.auth_task = Some(tokio::spawn(async move { authenticator.authenticate(&keys).await }));
	}

	#[instrument(skip_all)]
	fn handle_auth(&mut self, outcome: AuthOutcome) {
		match outcome {
			AuthOutcome::Token(token) => {
				info!(
					channels = token.channels().len(),
					expires_at = token.expires_at(),
					"Streaming token obtained"
				);
				self.timers.reconnect = None;
				self.timers.auth_retry = None;
				self.auth_backoff.reset();

				let delay = token.refresh_delay(self.config.token_refresh_margin);
				self.timers.token_refresh = (!delay.is_zero()).then(|| Instant::now() + delay);

				self.connect_stream(&token);
				self.token = Some(token);
				self.set_phase(ConnectionState::Connected);
			}
			AuthOutcome::InvalidCredentials => {
				error!("Streaming credentials rejected, falling back to polling");
				self.disable_streaming();
			}
			AuthOutcome::StreamingDisabled => {
				warn!("Streaming disabled for this SDK key, falling back to polling");
				self.disable_streaming();
			}
			AuthOutcome::Transient(reason) => {
				let delay = self.auth_backoff.next_delay();
				warn!(
					reason = %reason,
					attempt = self.auth_backoff.attempts(),
					retry_in_secs = delay.as_secs_f64(),
					"Streaming authentication failed"
				);
				self.timers.auth_retry = Some(Instant::now() + delay);
				if self.stream.is_some() {
					self.set_phase(ConnectionState::Connected);
				} else {
					self.set_phase(ConnectionState::Disconnected);
				}
				self.update_status();
			}
		}
	}

	/// Opens a new stream, replacing any current one. Events still queued
	/// from the old stream are discarded with its receiver.
	///
	/// The keep-alive window starts at connect time, so a stream that never
	/// reports `Open` is torn down like a silent one.
	fn connect_stream(&mut self, token: &StreamToken) {
		let (tx, rx) = mpsc::channel(TRANSPORT_BUFFER);
		let handle = self.transport.connect(token, tx);
		if let Some(previous) = self.stream.replace(handle) {
			previous.close();
		}
		self.events = Some(rx);
		self.arm_keep_alive();
	}

	fn close_stream(&mut self) {
		if let Some(stream) = self.stream.take() {
			stream.close();
		}
		self.events = None;
		self.stream_open = false;
		self.timers.keep_alive = None;
	}

	fn handle_transport(&mut self, event: TransportEvent) {
		match event {
			TransportEvent::Open => {
				info!("Stream open");
				self.stream_backoff.reset();
				self.stream_open = true;
				self.paused = false;
				self.occupancy.clear();
				self.arm_keep_alive();
				self.update_status();
			}
			TransportEvent::KeepAlive => self.arm_keep_alive(),
			TransportEvent::Frame(frame) => {
				self.arm_keep_alive();
				self.handle_frame(frame);
			}
			TransportEvent::Error {
				message,
				recoverable: true,
			} => self.on_stream_failure(&message),
			TransportEvent::Error {
				message,
				recoverable: false,
			} => {
				error!(error = %message, "Stream rejected, falling back to polling");
				self.disable_streaming();
			}
			TransportEvent::Closed => self.on_stream_failure("stream closed by server"),
		}
	}

	fn handle_frame(&mut self, frame: RawFrame) {
		let notification = match decode(&frame) {
			Ok(notification) => notification,
			Err(e) => {
				warn!(event = %frame.event, error = %e, "Dropping undecodable stream frame");
				return;
			}
		};

		match notification {
			Notification::KeepAlive => {}
			Notification::StreamError(err) if err.is_token_expired() => {
				info!(code = err.code, "Streaming token expired, re-authenticating");
				self.close_stream();
				self.update_status();
				self.begin_auth();
			}
			Notification::StreamError(err) if err.is_recoverable() => {
				self.on_stream_failure(&err.message);
			}
			Notification::StreamError(err) => {
				error!(code = err.code, message = %err.message, "Non-recoverable stream error");
				self.disable_streaming();
			}
			Notification::Control(ControlType::StreamingPaused) => {
				info!("Streaming paused by server");
				self.paused = true;
				self.update_status();
			}
			Notification::Control(ControlType::StreamingResumed) => {
				info!("Streaming resumed by server");
				self.paused = false;
				self.update_status();
			}
			Notification::Control(ControlType::StreamingDisabled) => {
				warn!("Streaming disabled by server");
				self.disable_streaming();
			}
			Notification::Occupancy { channel, publishers } => {
				debug!(channel = %channel, publishers, "Occupancy update");
				self.occupancy.insert(channel, publishers);
				self.update_status();
			}
			other => {
				self.router.dispatch(other);
			}
		}
	}

	fn on_stream_failure(&mut self, reason: &str) {
		self.close_stream();
		self.update_status();

		if self.background {
			debug!(reason, "Stream dropped while in background");
			self.timers.background_disconnect = None;
			self.set_phase(ConnectionState::Disconnected);
			return;
		}

		let delay = self.stream_backoff.next_delay();
		warn!(
			reason,
			attempt = self.stream_backoff.attempts(),
			retry_in_secs = delay.as_secs_f64(),
			"Stream connection lost"
		);
		self.timers.reconnect = Some(Instant::now() + delay);
		self.set_phase(ConnectionState::Disconnected);
	}

	fn background_disconnect(&mut self) {
		info!("Disconnecting stream after background delay");
		if let Some(task) = self.auth_task.take() {
			task.abort();
		}
		self.close_stream();
		self.timers.clear();
		self.set_phase(ConnectionState::Disconnected);
		self.update_status();
	}

	/// Permanent stop for this session; polling takes over.
	fn disable_streaming(&mut self) {
		self.stop();
	}

	fn stop(&mut self) {
		if let Some(task) = self.auth_task.take() {
			task.abort();
		}
		self.close_stream();
		self.timers.clear();
		self.token = None;
		self.set_phase(ConnectionState::Stopped);
		self.update_status();
		info!("Streaming stopped");
	}

	/// No stream, no authentication and nothing scheduled.
	fn is_idle(&self) -> bool {
		self.stream.is_none()
			&& self.auth_task.is_none()
			&& self.timers.auth_retry.is_none()
			&& self.timers.reconnect.is_none()
	}

	fn arm_keep_alive(&mut self) {
		self.timers.keep_alive = Some(Instant::now() + self.config.keep_alive_timeout);
	}

	fn set_phase(&mut self, phase: ConnectionState) {
		self.phase = phase;
		self.publish_state();
	}

	fn publish_state(&self) {
		let visible = if self.background && self.phase != ConnectionState::Stopped {
			ConnectionState::Suspended
		} else {
			self.phase
		};
		self.state_tx.send_if_modified(|current| {
			if *current == visible {
				return false;
			}
			debug!(from = %current, to = %visible, "Connection state changed");
			*current = visible;
			true
		});
	}

	fn update_status(&mut self) {
		let publishers_ok = self.occupancy.is_empty() || self.occupancy.values().any(|p| *p > 0);
		let status = if self.stream_open
			&& !self.paused
			&& publishers_ok
			&& self.phase != ConnectionState::Stopped
		{
			StreamStatus::Available
		} else {
			StreamStatus::Unavailable
		};
		if self.last_status != Some(status) {
			self.last_status = Some(status);
			let _ = self.status_tx.send(status);
		}
	}
}

async fn join_auth(task: &mut Option<JoinHandle<AuthOutcome>>) -> AuthOutcome {
	match task {
		Some(handle) => handle
			.await
			.unwrap_or_else(|e| AuthOutcome::Transient(format!("auth task failed: {e}"))),
		None => pending().await,
	}
}

async fn recv_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
	match events {
		Some(rx) => rx.recv().await,
		None => pending().await,
	}
}

async fn sleep_until_opt(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => sleep_until(deadline).await,
		None => pending().await,
	}
}
