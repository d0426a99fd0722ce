// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end client behaviour against a mock SDK server.

use std::io::{Seek, Write};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use loom_rollout::{labels, Attributes, ClientConfig, Key, RolloutClient, CONTROL};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter("loom_rollout=debug")
		.with_test_writer()
		.try_init();
}

fn flag_changes(splits: Value, since: i64, till: i64) -> Value {
	json!({ "splits": splits, "since": since, "till": till })
}

fn segment_flag() -> Value {
	json!({
		"name": "beta_only",
		"defaultTreatment": "off",
		"changeNumber": 100,
		"conditions": [{
			"conditionType": "ROLLOUT",
			"label": "in segment beta",
			"partitions": [{"treatment": "on", "size": 100}],
			"matcherGroup": {
				"combiner": "AND",
				"matchers": [{
					"matcherType": "IN_SEGMENT",
					"userDefinedSegmentMatcherData": {"segmentName": "beta"}
				}]
			}
		}]
	})
}

fn rollout_flag() -> Value {
	json!({
		"name": "checkout",
		"defaultTreatment": "off",
		"changeNumber": 100,
		"conditions": [{
			"conditionType": "ROLLOUT",
			"label": "default rule",
			"partitions": [{"treatment": "on", "size": 100}],
			"matcherGroup": {
				"combiner": "AND",
				"matchers": [{"matcherType": "ALL_KEYS"}]
			}
		}]
	})
}

fn polling_config() -> ClientConfig {
	ClientConfig {
		streaming_enabled: false,
		..ClientConfig::default()
	}
}

async fn mount_memberships(server: &MockServer, key: &str, segments: &[&str]) {
	let body: Vec<Value> = segments.iter().map(|s| json!({ "name": s })).collect();
	Mock::given(method("GET"))
		.and(path(format!("/api/memberships/{key}")))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "mySegments": body })))
		.mount(server)
		.await;
}

fn stream_token(channels: &[&str]) -> String {
	let now = chrono::Utc::now().timestamp();
	let capability: serde_json::Map<String, Value> = channels
		.iter()
		.map(|c| (c.to_string(), json!(["subscribe"])))
		.collect();
	let claims = json!({
		"x-ably-capability": Value::Object(capability).to_string(),
		"iat": now,
		"exp": now + 3600,
	});
	format!(
		"{}.{}.sig",
		URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#),
		URL_SAFE_NO_PAD.encode(claims.to_string())
	)
}

fn sse_message(channel: &str, inner: Value) -> String {
	let envelope = json!({
		"id": "m1",
		"timestamp": 1_700_000_000_000_i64,
		"encoding": "json",
		"channel": channel,
		"data": inner.to_string(),
	});
	format!("event: message\ndata: {envelope}\n\n")
}

#[tokio::test]
async fn evaluations_before_first_sync_are_not_ready() {
	init_tracing();
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/api/flagChanges"))
		.and(query_param("since", "-1"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(flag_changes(json!([segment_flag()]), -1, 100))
				.set_delay(Duration::from_millis(300)),
		)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/api/flagChanges"))
		.and(query_param("since", "100"))
		.respond_with(ResponseTemplate::new(200).set_body_json(flag_changes(json!([]), 100, 100)))
		.mount(&server)
		.await;
	mount_memberships(&server, "alice", &["beta"]).await;
	mount_memberships(&server, "bob", &[]).await;

	let client = RolloutClient::builder()
		.sdk_key("client-key")
		.base_url(server.uri())
		.config(polling_config())
		.build()
		.await
		.unwrap();
	client.register_identity("alice").unwrap();
	client.register_identity("bob").unwrap();

	let early = client.evaluate("beta_only", &Key::new("alice"), &Attributes::new());
	assert_eq!(early.treatment, CONTROL);
	assert_eq!(early.label, labels::NOT_READY);

	client.wait_ready("alice", Duration::from_secs(5)).await.unwrap();
	client.wait_ready("bob", Duration::from_secs(5)).await.unwrap();

	let alice = client.evaluate("beta_only", &Key::new("alice"), &Attributes::new());
	assert_eq!(alice.treatment, "on");
	assert_eq!(alice.change_number, Some(100));
	assert_eq!(client.treatment("beta_only", &Key::new("bob")), "off");

	client.destroy().await;
}

#[tokio::test]
async fn failing_server_leaves_client_not_ready() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;

	let client = RolloutClient::builder()
		.sdk_key("client-key")
		.base_url(server.uri())
		.config(polling_config())
		.build()
		.await
		.unwrap();
	client.register_identity("alice").unwrap();

	let result = client.wait_ready("alice", Duration::from_millis(300)).await;
	assert!(matches!(result, Err(loom_rollout::RolloutError::ReadyTimeout)));
	assert_eq!(client.treatment("checkout", &Key::new("alice")), CONTROL);

	client.destroy().await;
}

#[tokio::test]
async fn pushed_kill_overrides_cached_flag() {
	init_tracing();
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/api/flagChanges"))
		.respond_with(ResponseTemplate::new(200).set_body_json(flag_changes(
			json!([rollout_flag()]),
			-1,
			100,
		)))
		.mount(&server)
		.await;
	mount_memberships(&server, "alice", &[]).await;
	Mock::given(method("GET"))
		.and(path("/api/v2/auth"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"pushEnabled": true,
			"token": stream_token(&["xyz_splits", "xyz_abc_mySegments"]),
		})))
		.mount(&server)
		.await;
	let kill = sse_message(
		"xyz_splits",
		json!({
			"type": "SPLIT_KILL",
			"changeNumber": 200,
			"splitName": "checkout",
			"defaultTreatment": "off",
		}),
	);
	Mock::given(method("GET"))
		.and(path_regex("^/sse$"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "text/event-stream")
				.set_body_string(kill),
		)
		.mount(&server)
		.await;

	let client = RolloutClient::builder()
		.sdk_key("client-key")
		.base_url(server.uri())
		.build()
		.await
		.unwrap();
	client.register_identity("alice").unwrap();
	client.wait_ready("alice", Duration::from_secs(5)).await.unwrap();

	let key = Key::new("alice");
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let result = client.evaluate("checkout", &key, &Attributes::new());
		if result.label == labels::KILLED {
			assert_eq!(result.treatment, "off");
			assert_eq!(result.change_number, Some(200));
			break;
		}
		assert!(tokio::time::Instant::now() < deadline, "kill was never applied");
		tokio::time::sleep(Duration::from_millis(20)).await;
	}

	client.destroy().await;
	assert!(client.connection_state().is_some());
}

#[tokio::test]
async fn localhost_file_reloads_on_refresh() {
	let mut file = tempfile::NamedTempFile::new().unwrap();
	file.write_all(br#"{"checkout": "off"}"#).unwrap();
	file.flush().unwrap();

	let client = RolloutClient::builder()
		.localhost(file.path())
		.build()
		.await
		.unwrap();
	client.register_identity("alice").unwrap();
	client.wait_ready("alice", Duration::from_secs(5)).await.unwrap();
	let key = Key::new("alice");
	assert_eq!(client.treatment("checkout", &key), "off");

	let handle = file.as_file_mut();
	handle.set_len(0).unwrap();
	handle.rewind().unwrap();
	handle.write_all(br#"{"checkout": "on"}"#).unwrap();
	handle.flush().unwrap();
	client.force_refresh();

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while client.treatment("checkout", &key) != "on" {
		assert!(tokio::time::Instant::now() < deadline, "reload was never applied");
		tokio::time::sleep(Duration::from_millis(20)).await;
	}

	client.destroy().await;
}
