// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Typed notifications decoded from streaming frames.
//!
//! # Events
//!
//! - `message` - Envelope carrying a JSON-encoded notification in `data`
//! - `error` - Stream-level error with an error code and HTTP status
//! - `keepalive` - Heartbeat
//!
//! Inner notification types inside a `message` envelope:
//!
//! - `SPLIT_UPDATE` - A flag changed; fetch changes since the cached change number
//! - `SPLIT_KILL` - A flag was killed; apply immediately
//! - `MY_SEGMENTS_UPDATE` - Segment change for the identity named by the channel
//! - `MY_SEGMENTS_UPDATE_V2` - Segment change with an encoded payload
//! - `CONTROL` - Streaming paused, resumed or disabled
//!
//! Envelopes named `[meta]occupancy` carry publisher counts for control channels.
//!
//! Decoding is pure: a frame either becomes exactly one [`Notification`] or
//! a [`CoreError`] the caller logs before moving on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

const SEGMENTS_CHANNEL_SUFFIX: &str = "_mySegments";
const OCCUPANCY_NAME: &str = "[meta]occupancy";
const TOKEN_EXPIRED_CODE: i64 = 40142;

/// One SSE event as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
	pub event: String,
	pub data: String,
}

impl RawFrame {
	pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
		Self {
			event: event.into(),
			data: data.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
	FlagUpdate {
		change_number: i64,
	},
	FlagKill {
		name: String,
		default_treatment: String,
		change_number: i64,
	},
	SegmentUpdateV1(SegmentUpdateV1),
	SegmentUpdateV2(SegmentUpdateV2),
	StreamError(StreamError),
	Control(ControlType),
	Occupancy {
		channel: String,
		publishers: u32,
	},
	KeepAlive,
}

impl Notification {
	/// Short name for logging.
	pub fn kind(&self) -> &'static str {
		match self {
			Notification::FlagUpdate { .. } => "flag_update",
			Notification::FlagKill { .. } => "flag_kill",
			Notification::SegmentUpdateV1(_) => "segment_update_v1",
			Notification::SegmentUpdateV2(_) => "segment_update_v2",
			Notification::StreamError(_) => "stream_error",
			Notification::Control(_) => "control",
			Notification::Occupancy { .. } => "occupancy",
			Notification::KeepAlive => "keepalive",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentUpdateV1 {
	/// `base64(sha256(matching_key))` of the targeted identity.
	pub identity_hash: String,
	pub change_number: i64,
	pub change: SegmentChangeV1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentChangeV1 {
	/// A single segment gained or lost the identity.
	Member { segment: String, added: bool },
	/// Full replacement list.
	Replace(Vec<String>),
	/// No payload; the identity must refetch its memberships.
	Refetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateMode {
	Unbounded,
	Bounded,
	KeyList,
	SegmentRemoval,
}

impl UpdateMode {
	pub fn from_wire(value: i64) -> Option<Self> {
		match value {
			0 => Some(UpdateMode::Unbounded),
			1 => Some(UpdateMode::Bounded),
			2 => Some(UpdateMode::KeyList),
			3 => Some(UpdateMode::SegmentRemoval),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
	None,
	Gzip,
	Zlib,
}

impl Compression {
	pub fn from_wire(value: i64) -> Option<Self> {
		match value {
			0 => Some(Compression::None),
			1 => Some(Compression::Gzip),
			2 => Some(Compression::Zlib),
			_ => None,
		}
	}
}

/// V2 segment update as it arrived.
///
/// `mode` and `compression` are `None` when the hints were missing or
/// unrecognised; the payload itself is decoded later by
/// [`crate::segment_payload::decode_instruction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentUpdateV2 {
	pub change_number: i64,
	pub segment_name: Option<String>,
	pub mode: Option<UpdateMode>,
	pub compression: Option<Compression>,
	pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
	#[serde(default)]
	pub message: String,
	#[serde(default)]
	pub code: i64,
	#[serde(default)]
	pub status_code: i64,
}

impl StreamError {
	/// Token and server-side errors are worth reconnecting for.
	pub fn is_recoverable(&self) -> bool {
		(40140..=40149).contains(&self.code)
			|| (50000..=59999).contains(&self.code)
			|| self.status_code >= 500
	}

	pub fn is_token_expired(&self) -> bool {
		self.code == TOKEN_EXPIRED_CODE
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
	StreamingPaused,
	StreamingResumed,
	StreamingDisabled,
}

#[derive(Deserialize)]
struct Envelope {
	#[serde(default)]
	name: Option<String>,
	#[serde(default)]
	channel: String,
	data: String,
}

#[derive(Deserialize)]
struct OccupancyDto {
	metrics: OccupancyMetrics,
}

#[derive(Deserialize)]
struct OccupancyMetrics {
	publishers: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagUpdateDto {
	change_number: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagKillDto {
	change_number: i64,
	split_name: String,
	default_treatment: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentV1Dto {
	#[serde(default)]
	change_number: i64,
	#[serde(default)]
	includes_payload: bool,
	#[serde(default)]
	segment_list: Option<Vec<String>>,
	#[serde(default)]
	segment_name: Option<String>,
	#[serde(default)]
	added: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentV2Dto {
	#[serde(default)]
	change_number: i64,
	#[serde(default)]
	segment_name: Option<String>,
	#[serde(default)]
	c: Option<i64>,
	#[serde(default)]
	u: Option<i64>,
	#[serde(default)]
	d: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlDto {
	control_type: ControlType,
}

/// Decodes one frame.
pub fn decode(frame: &RawFrame) -> Result<Notification> {
	match frame.event.as_str() {
		"message" | "" => decode_message(&frame.data),
		"error" => Ok(Notification::StreamError(serde_json::from_str(&frame.data)?)),
		"keepalive" => Ok(Notification::KeepAlive),
		other => Err(CoreError::UnknownEvent(other.to_string())),
	}
}

fn decode_message(data: &str) -> Result<Notification> {
	let envelope: Envelope = serde_json::from_str(data)?;

	if envelope.name.as_deref() == Some(OCCUPANCY_NAME) {
		let occupancy: OccupancyDto = serde_json::from_str(&envelope.data)?;
		return Ok(Notification::Occupancy {
			channel: envelope.channel,
			publishers: occupancy.metrics.publishers,
		});
	}

	let inner: Value = serde_json::from_str(&envelope.data)?;
	let kind = inner
		.get("type")
		.and_then(Value::as_str)
		.ok_or_else(|| CoreError::InvalidPayload("notification without type".to_string()))?
		.to_string();

	match kind.as_str() {
		"SPLIT_UPDATE" => {
			let dto: FlagUpdateDto = serde_json::from_value(inner)?;
			Ok(Notification::FlagUpdate {
				change_number: dto.change_number,
			})
		}
		"SPLIT_KILL" => {
			let dto: FlagKillDto = serde_json::from_value(inner)?;
			Ok(Notification::FlagKill {
				name: dto.split_name,
				default_treatment: dto.default_treatment,
				change_number: dto.change_number,
			})
		}
		"MY_SEGMENTS_UPDATE" => {
			let dto: SegmentV1Dto = serde_json::from_value(inner)?;
			let identity_hash = identity_hash_from_channel(&envelope.channel).ok_or_else(|| {
				CoreError::InvalidPayload(format!("not a segments channel: {}", envelope.channel))
			})?;
			let change = match (dto.includes_payload, dto.segment_list, dto.segment_name, dto.added) {
				(true, Some(list), _, _) => SegmentChangeV1::Replace(list),
				(_, _, Some(segment), Some(added)) => SegmentChangeV1::Member { segment, added },
				_ => SegmentChangeV1::Refetch,
			};
			Ok(Notification::SegmentUpdateV1(SegmentUpdateV1 {
				identity_hash,
				change_number: dto.change_number,
				change,
			}))
		}
		"MY_SEGMENTS_UPDATE_V2" => {
			let dto: SegmentV2Dto = serde_json::from_value(inner)?;
			Ok(Notification::SegmentUpdateV2(SegmentUpdateV2 {
				change_number: dto.change_number,
				segment_name: dto.segment_name,
				mode: dto.u.and_then(UpdateMode::from_wire),
				compression: dto.c.and_then(Compression::from_wire),
				data: dto.d,
			}))
		}
		"CONTROL" => {
			let dto: ControlDto = serde_json::from_value(inner)?;
			Ok(Notification::Control(dto.control_type))
		}
		_ => Err(CoreError::UnknownNotification(kind)),
	}
}

/// Extracts the identity hash from a `..._<hash>_mySegments` channel name.
pub fn identity_hash_from_channel(channel: &str) -> Option<String> {
	let prefix = channel.strip_suffix(SEGMENTS_CHANNEL_SUFFIX)?;
	let hash = prefix.rsplit('_').next()?;
	(!hash.is_empty()).then(|| hash.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn message(channel: &str, inner: Value) -> RawFrame {
		let envelope = serde_json::json!({
			"id": "x1",
			"timestamp": 1700000000000_i64,
			"encoding": "json",
			"channel": channel,
			"data": inner.to_string(),
		});
		RawFrame::new("message", envelope.to_string())
	}

	#[test]
	fn decodes_flag_update_and_kill() {
		let frame = message(
			"xxxx_xxxx_splits",
			serde_json::json!({"type": "SPLIT_UPDATE", "changeNumber": 1700}),
		);
		assert_eq!(
			decode(&frame).unwrap(),
			Notification::FlagUpdate { change_number: 1700 }
		);

		let frame = message(
			"xxxx_xxxx_splits",
			serde_json::json!({
				"type": "SPLIT_KILL",
				"changeNumber": 1701,
				"splitName": "checkout_flow",
				"defaultTreatment": "off"
			}),
		);
		assert_eq!(
			decode(&frame).unwrap(),
			Notification::FlagKill {
				name: "checkout_flow".to_string(),
				default_treatment: "off".to_string(),
				change_number: 1701,
			}
		);
	}

	#[test]
	fn decodes_segment_v1_variants() {
		let channel = "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_aGFzaA==_mySegments";

		let frame = message(
			channel,
			serde_json::json!({"type": "MY_SEGMENTS_UPDATE", "changeNumber": 5, "includesPayload": true, "segmentList": ["a", "b"]}),
		);
		let Notification::SegmentUpdateV1(update) = decode(&frame).unwrap() else {
			panic!("expected v1 update");
		};
		assert_eq!(update.identity_hash, "aGFzaA==");
		assert_eq!(
			update.change,
			SegmentChangeV1::Replace(vec!["a".to_string(), "b".to_string()])
		);

		let frame = message(
			channel,
			serde_json::json!({"type": "MY_SEGMENTS_UPDATE", "changeNumber": 6, "segmentName": "beta", "added": false}),
		);
		let Notification::SegmentUpdateV1(update) = decode(&frame).unwrap() else {
			panic!("expected v1 update");
		};
		assert_eq!(
			update.change,
			SegmentChangeV1::Member {
				segment: "beta".to_string(),
				added: false
			}
		);

		let frame = message(
			channel,
			serde_json::json!({"type": "MY_SEGMENTS_UPDATE", "changeNumber": 7, "includesPayload": false}),
		);
		let Notification::SegmentUpdateV1(update) = decode(&frame).unwrap() else {
			panic!("expected v1 update");
		};
		assert_eq!(update.change, SegmentChangeV1::Refetch);
	}

	#[test]
	fn v1_requires_segments_channel() {
		let frame = message(
			"xxxx_splits",
			serde_json::json!({"type": "MY_SEGMENTS_UPDATE", "changeNumber": 5}),
		);
		assert!(matches!(decode(&frame), Err(CoreError::InvalidPayload(_))));
	}

	#[test]
	fn v2_keeps_unrecognised_hints_as_none() {
		let frame = message(
			"xxxx_mySegments",
			serde_json::json!({"type": "MY_SEGMENTS_UPDATE_V2", "changeNumber": 9, "segmentName": "s", "c": 7, "u": 2, "d": "AAAA"}),
		);
		let Notification::SegmentUpdateV2(update) = decode(&frame).unwrap() else {
			panic!("expected v2 update");
		};
		assert_eq!(update.mode, Some(UpdateMode::KeyList));
		assert_eq!(update.compression, None);
		assert_eq!(update.data.as_deref(), Some("AAAA"));
	}

	#[test]
	fn decodes_control_and_occupancy() {
		let frame = message(
			"control_pri",
			serde_json::json!({"type": "CONTROL", "controlType": "STREAMING_PAUSED"}),
		);
		assert_eq!(
			decode(&frame).unwrap(),
			Notification::Control(ControlType::StreamingPaused)
		);

		let envelope = serde_json::json!({
			"name": "[meta]occupancy",
			"channel": "[?occupancy=metrics.publishers]control_pri",
			"data": "{\"metrics\":{\"publishers\":2}}",
		});
		assert_eq!(
			decode(&RawFrame::new("message", envelope.to_string())).unwrap(),
			Notification::Occupancy {
				channel: "[?occupancy=metrics.publishers]control_pri".to_string(),
				publishers: 2
			}
		);
	}

	#[test]
	fn decodes_errors() {
		let frame = RawFrame::new(
			"error",
			r#"{"message":"Token expired","code":40142,"statusCode":401}"#,
		);
		let Notification::StreamError(error) = decode(&frame).unwrap() else {
			panic!("expected error");
		};
		assert!(error.is_token_expired());
		assert!(error.is_recoverable());

		let fatal = StreamError {
			message: "invalid key".to_string(),
			code: 40300,
			status_code: 403,
		};
		assert!(!fatal.is_recoverable());
	}

	#[test]
	fn rejects_unknown_and_malformed_frames() {
		assert!(matches!(
			decode(&RawFrame::new("bogus", "{}")),
			Err(CoreError::UnknownEvent(_))
		));
		assert!(matches!(
			decode(&message("c", serde_json::json!({"type": "NEW_THING"}))),
			Err(CoreError::UnknownNotification(_))
		));
		assert!(matches!(
			decode(&RawFrame::new("message", "{not json")),
			Err(CoreError::Json(_))
		));
		assert_eq!(
			decode(&RawFrame::new("keepalive", "")).unwrap(),
			Notification::KeepAlive
		);
	}
}
