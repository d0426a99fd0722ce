// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Rollout client engine for Loom.
//!
//! Keeps feature flag definitions and per-identity segment memberships in
//! sync with the server and evaluates flags locally, without a network round
//! trip per evaluation.
//!
//! # Features
//!
//! - **Streaming Sync**: SSE push notifications with token refresh, keepalive and backoff
//! - **Polling Fallback**: Periodic fetches whenever the stream is unavailable
//! - **Multiple Identities**: Memberships tracked per matching key on one connection
//! - **Local Evaluation**: Conditions, matchers and bucketing run in-process
//! - **Localhost Mode**: Flags served from a JSON file for development and tests
//!
//! # Example
//!
//! ```ignore
//! use loom_rollout::{Attributes, Key, LifecycleEvent, RolloutClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RolloutClient::builder()
//!         .sdk_key("client-sdk-key")
//!         .base_url("https://sdk.example.com")
//!         .build()
//!         .await?;
//!
//!     client.register_identity("user-123")?;
//!     client.wait_ready("user-123", Duration::from_secs(10)).await?;
//!
//!     let mut attributes = Attributes::new();
//!     attributes.insert("plan".to_string(), serde_json::json!("enterprise"));
//!     let result = client.evaluate("new_checkout", &Key::new("user-123"), &attributes);
//!     println!("{} ({})", result.treatment, result.label);
//!
//!     // Host went to the background.
//!     client.on_lifecycle(LifecycleEvent::Background);
//!
//!     client.destroy().await;
//!     Ok(())
//! }
//! ```

mod auth;
mod client;
mod config;
mod connection;
mod error;
mod events;
mod http;
mod impressions;
mod lifecycle;
mod localhost;
mod router;
mod segments;
mod storage;
mod sync;
mod transport;

pub use auth::{AuthOutcome, Authenticator, SdkAuthenticator};
pub use client::{RolloutClient, RolloutClientBuilder};
pub use config::{ClientConfig, Endpoints, SdkKey};
pub use connection::{ConnectionConfig, ConnectionManager};
pub use error::{Result, RolloutError};
pub use events::{EventBus, Resource, SdkEvent, Subscription};
pub use http::{AuthResponseDto, HttpRolloutApi, RolloutApi};
pub use impressions::{
	Impression, ImpressionListener, ImpressionQueue, NoOpImpressionListener,
	SharedImpressionListener,
};
pub use lifecycle::{LifecycleBridge, LifecycleEvent};
pub use localhost::LocalhostApi;
pub use router::NotificationRouter;
pub use segments::IdentitySegmentsProcessor;
pub use storage::{
	FlagStorage, MemoryFlagStorage, MemorySegmentStorage, SegmentChange, SegmentStorage,
	StorageLookup, UpdateSummary, INITIAL_CHANGE_NUMBER,
};
pub use sync::{FlagChange, RefreshRequester, SyncConfig, SyncOrchestrator};
pub use transport::{SseTransport, StreamTransport, TransportEvent, TransportHandle};

// Re-export core types for convenience
pub use loom_rollout_core::{
	labels, Attributes, ConnectionState, EvaluationResult, FlagDefinition, Key, Notification,
	StreamStatus, StreamToken, CONTROL,
};
