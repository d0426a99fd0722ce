// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SSE (Server-Sent Events) transport for the streaming endpoint.
//!
//! A transport owns exactly one connection attempt. It reports lifecycle
//! changes and raw frames over a channel and never reconnects on its own;
//! reconnection policy belongs to the connection manager.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use loom_rollout_core::{RawFrame, StreamToken};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, RolloutError};
use crate::http;

/// Streaming protocol version requested from the server.
const PROTOCOL_VERSION: &str = "1.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
	/// The server accepted the connection.
	Open,
	Frame(RawFrame),
	/// Heartbeat comment line.
	KeepAlive,
	Error { message: String, recoverable: bool },
	/// The server ended the stream.
	Closed,
}

/// Opens streaming connections.
pub trait StreamTransport: Send + Sync {
	/// Starts a connection that reports through `events` until the returned
	/// handle is closed or dropped.
	fn connect(&self, token: &StreamToken, events: mpsc::Sender<TransportEvent>) -> TransportHandle;
}

/// Owns a running connection; closing or dropping it tears the connection down.
#[derive(Debug)]
pub struct TransportHandle {
	task: Option<JoinHandle<()>>,
}

impl TransportHandle {
	pub fn new(task: JoinHandle<()>) -> Self {
		Self { task: Some(task) }
	}

	/// A handle with no background task, for transports driven externally.
	pub fn detached() -> Self {
		Self { task: None }
	}

	pub fn close(mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

impl Drop for TransportHandle {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

/// [`StreamTransport`] over reqwest and `eventsource-stream`.
pub struct SseTransport {
	client: Client,
	stream_url: String,
}

impl SseTransport {
	pub fn new(stream_url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
		let client = http::builder()
			.connect_timeout(connect_timeout)
			.build()
			.map_err(RolloutError::RequestFailed)?;
		Ok(Self {
			client,
			stream_url: stream_url.into(),
		})
	}
}

impl StreamTransport for SseTransport {
	fn connect(&self, token: &StreamToken, events: mpsc::Sender<TransportEvent>) -> TransportHandle {
		let client = self.client.clone();
		let url = self.stream_url.clone();
		let query = vec![
			("channels", token.channels_param()),
			("accessToken", token.raw().to_string()),
			("v", PROTOCOL_VERSION.to_string()),
		];
		TransportHandle::new(tokio::spawn(run_stream(client, url, query, events)))
	}
}

async fn run_stream(
	client: Client,
	url: String,
	query: Vec<(&'static str, String)>,
	events: mpsc::Sender<TransportEvent>,
) {
	info!(url = %url, "Connecting to SSE stream");

	let response = match client
		.get(&url)
		.query(&query)
		.header("Accept", "text/event-stream")
		.header("Cache-Control", "no-cache")
		.send()
		.await
	{
		Ok(response) => response,
		Err(e) => {
			let _ = events
				.send(TransportEvent::Error {
					message: e.to_string(),
					recoverable: true,
				})
				.await;
			return;
		}
	};

	let status = response.status();
	if !status.is_success() {
		let recoverable = !status.is_client_error() || status == StatusCode::TOO_MANY_REQUESTS;
		warn!(status = status.as_u16(), recoverable, "SSE connection rejected");
		let _ = events
			.send(TransportEvent::Error {
				message: format!("stream rejected with status {status}"),
				recoverable,
			})
			.await;
		return;
	}

	if events.send(TransportEvent::Open).await.is_err() {
		return;
	}
	info!("SSE connection established");

	let heartbeat = events.clone();
	let mut stream = response
		.bytes_stream()
		.inspect(move |chunk| {
			if let Ok(bytes) = chunk {
				if has_comment_line(bytes) {
					let _ = heartbeat.try_send(TransportEvent::KeepAlive);
				}
			}
		})
		.eventsource();

	while let Some(item) = stream.next().await {
		let event = match item {
			Ok(event) => TransportEvent::Frame(RawFrame::new(event.event, event.data)),
			Err(e) => TransportEvent::Error {
				message: e.to_string(),
				recoverable: true,
			},
		};
		let is_error = matches!(event, TransportEvent::Error { .. });
		if events.send(event).await.is_err() || is_error {
			return;
		}
	}

	debug!("SSE stream ended");
	let _ = events.send(TransportEvent::Closed).await;
}

fn has_comment_line(chunk: &[u8]) -> bool {
	chunk
		.split(|byte| *byte == b'\n')
		.any(|line| line.first() == Some(&b':'))
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn token() -> StreamToken {
		StreamToken::from_parts("jwt", vec!["abc_mySegments".to_string()], 0, 3600)
	}

	async fn collect(mut rx: mpsc::Receiver<TransportEvent>) -> Vec<TransportEvent> {
		let mut out = Vec::new();
		while let Some(event) = rx.recv().await {
			out.push(event);
		}
		out
	}

	#[test]
	fn detects_comment_lines() {
		assert!(has_comment_line(b":keepalive\n\n"));
		assert!(has_comment_line(b"data: x\n\n:\n"));
		assert!(!has_comment_line(b"event: message\ndata: {}\n\n"));
	}

	#[tokio::test]
	async fn streams_frames_then_closes() {
		let server = MockServer::start().await;
		let body = concat!(
			":\n\n",
			"event: message\n",
			"data: {\"channel\":\"c\",\"data\":\"{}\"}\n\n",
			"event: keepalive\n",
			"data: \n\n",
		);
		Mock::given(method("GET"))
			.and(path("/sse"))
			.and(query_param("accessToken", "jwt"))
			.and(query_param("channels", "abc_mySegments"))
			.and(query_param("v", "1.1"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("Content-Type", "text/event-stream")
					.set_body_string(body),
			)
			.mount(&server)
			.await;

		let transport = SseTransport::new(format!("{}/sse", server.uri()), Duration::from_secs(5)).unwrap();
		let (tx, rx) = mpsc::channel(16);
		let _handle = transport.connect(&token(), tx);
		let events = collect(rx).await;

		assert_eq!(events.first(), Some(&TransportEvent::Open));
		assert!(events.contains(&TransportEvent::KeepAlive));
		assert!(events.contains(&TransportEvent::Frame(RawFrame::new(
			"message",
			"{\"channel\":\"c\",\"data\":\"{}\"}"
		))));
		assert!(events
			.iter()
			.any(|e| matches!(e, TransportEvent::Frame(f) if f.event == "keepalive")));
		assert_eq!(events.last(), Some(&TransportEvent::Closed));
	}

	#[tokio::test]
	async fn client_errors_are_not_recoverable() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/sse"))
			.respond_with(ResponseTemplate::new(403))
			.mount(&server)
			.await;

		let transport = SseTransport::new(format!("{}/sse", server.uri()), Duration::from_secs(5)).unwrap();
		let (tx, rx) = mpsc::channel(4);
		let _handle = transport.connect(&token(), tx);
		let events = collect(rx).await;

		assert!(matches!(
			events.as_slice(),
			[TransportEvent::Error {
				recoverable: false,
				..
			}]
		));
	}

	#[tokio::test]
	async fn server_errors_are_recoverable() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/sse"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&server)
			.await;

		let transport = SseTransport::new(format!("{}/sse", server.uri()), Duration::from_secs(5)).unwrap();
		let (tx, rx) = mpsc::channel(4);
		let _handle = transport.connect(&token(), tx);
		let events = collect(rx).await;

		assert!(matches!(
			events.as_slice(),
			[TransportEvent::Error {
				recoverable: true,
				..
			}]
		));
	}
}
