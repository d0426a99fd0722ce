// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom rollout client engine.
//!
//! This crate holds the I/O-free half of the SDK: flag definitions and their
//! wire format, the matcher tree and evaluator, streaming tokens, the
//! notification model with its decoder, V2 segment payload decoding and the
//! retry backoff counter. The runtime that drives them lives in `loom-rollout`.
//!
//! # Example
//!
//! ```
//! use loom_rollout_core::{
//!     AttributeMatcher, Attributes, Condition, Evaluator, FlagDefinition, Key, MatcherNode,
//!     NoSegments,
//! };
//!
//! let flag = FlagDefinition::new("new_checkout", "off", 1).with_condition(Condition::rollout(
//!     MatcherNode::and(vec![AttributeMatcher::vanilla(MatcherNode::whitelist(["beta-user"]))]),
//!     "on",
//!     "whitelisted",
//! ));
//!
//! let result = Evaluator::default().evaluate_definition(
//!     &flag,
//!     &Key::new("beta-user"),
//!     &Attributes::new(),
//!     &NoSegments,
//! );
//! assert_eq!(result.treatment, "on");
//! ```

pub mod backoff;
pub mod connection;
pub mod error;
pub mod evaluation;
pub mod flag;
pub mod key;
pub mod matcher;
pub mod notification;
pub mod segment_payload;
pub mod token;

pub use backoff::{backoff_delay, BackoffCounter};
pub use connection::{ConnectionState, StreamStatus};
pub use error::{CoreError, Result};
pub use evaluation::{
	labels, Bucketer, EvaluationResult, Evaluator, FlagLookup, Murmur3Bucketer, CONTROL,
};
pub use flag::{
	ArchivedFlag, Condition, ConditionType, FlagChangeSet, FlagChangesDto, FlagDefinition, FlagDto,
	Partition,
};
pub use key::{Attributes, Key, MAX_KEY_LENGTH};
pub use matcher::{
	AttributeMatcher, Combiner, DataType, MatchContext, MatchValue, MatcherNode, NoSegments,
	SegmentLookup,
};
pub use notification::{
	decode, Compression, ControlType, Notification, RawFrame, SegmentChangeV1, SegmentUpdateV1,
	SegmentUpdateV2, StreamError, UpdateMode,
};
pub use segment_payload::{
	decode_instruction, BoundedFilter, IdentityHashes, KeyList, KeyListAction, SegmentInstruction,
};
pub use token::StreamToken;

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use proptest::prelude::*;

	fn key_matcher(node: MatcherNode) -> AttributeMatcher {
		AttributeMatcher::vanilla(node)
	}

	fn eval(node: &AttributeMatcher, key: &str) -> bool {
		let attributes = Attributes::new();
		let ctx = MatchContext {
			matching_key: key,
			bucketing_key: key,
			attributes: &attributes,
			segments: &NoSegments,
		};
		node.matches(&ctx)
	}

	// Property-based tests for matchers
	proptest! {
		#[test]
		fn negation_inverts(key in "[a-z0-9]{1,20}", list in prop::collection::vec("[a-z0-9]{1,20}", 0..8)) {
			let plain = key_matcher(MatcherNode::whitelist(list.clone()));
			let negated = key_matcher(MatcherNode::whitelist(list).negate());
			prop_assert_eq!(eval(&plain, &key), !eval(&negated, &key));
			prop_assert_eq!(eval(&plain, &key), !eval(&plain.clone().negated(), &key));
		}

		#[test]
		fn whitelist_is_set_membership(list in prop::collection::vec("[a-z]{1,10}", 1..10), idx in 0usize..10) {
			let needle = list[idx % list.len()].clone();
			let matcher = key_matcher(MatcherNode::whitelist(list));
			prop_assert!(eval(&matcher, &needle));
			let absent = format!("{}-absent-0", needle);
			prop_assert!(!eval(&matcher, &absent));
		}

		#[test]
		fn less_or_equal_agrees_with_integers(threshold: i64, value: i64) {
			let matcher = AttributeMatcher::on_attribute(
				"n",
				MatcherNode::LessOrEqual { value: threshold, data_type: DataType::Number },
			);
			let mut attributes = Attributes::new();
			attributes.insert("n".to_string(), serde_json::json!(value));
			let ctx = MatchContext {
				matching_key: "k",
				bucketing_key: "k",
				attributes: &attributes,
				segments: &NoSegments,
			};
			prop_assert_eq!(matcher.matches(&ctx), value <= threshold);
		}

		#[test]
		fn equal_matchers_hash_equal(list in prop::collection::vec("[a-z]{1,5}", 0..6)) {
			use std::collections::hash_map::DefaultHasher;
			use std::hash::{Hash, Hasher};

			let mut reversed = list.clone();
			reversed.reverse();
			let a = MatcherNode::whitelist(list);
			let b = MatcherNode::whitelist(reversed);
			prop_assert_eq!(&a, &b);

			let hash = |m: &MatcherNode| {
				let mut hasher = DefaultHasher::new();
				m.hash(&mut hasher);
				hasher.finish()
			};
			prop_assert_eq!(hash(&a), hash(&b));
		}
	}

	// Property-based tests for evaluation
	proptest! {
		#[test]
		fn killed_flag_always_returns_default(
			key in "[a-zA-Z0-9]{1,40}",
			default in "[a-z]{1,10}",
			conditions in 0usize..5,
		) {
			let mut flag = FlagDefinition::new("f", default.clone(), 1);
			for i in 0..conditions {
				flag = flag.with_condition(Condition::rollout(
					MatcherNode::and(vec![key_matcher(MatcherNode::AllKeys)]),
					format!("t{i}"),
					"rule",
				));
			}
			flag.killed = true;
			let result = Evaluator::default().evaluate_definition(&flag, &Key::new(key), &Attributes::new(), &NoSegments);
			prop_assert_eq!(result.treatment, default);
			prop_assert_eq!(result.label, labels::KILLED);
		}

		#[test]
		fn stale_kill_never_applies(current in 0i64..1_000_000, older in 0i64..1_000_000) {
			prop_assume!(older < current);
			let mut flag = FlagDefinition::new("f", "on", current);
			prop_assert!(!flag.apply_kill("off", older));
			prop_assert!(!flag.killed);
			prop_assert_eq!(flag.change_number, current);
		}
	}

	// Property-based tests for backoff and token timing
	proptest! {
		#[test]
		fn backoff_is_non_decreasing_and_bounded(
			base_ms in 1u64..5_000,
			max_ms in 1u64..3_600_000,
			failures in 1usize..40,
		) {
			let mut counter = BackoffCounter::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
			let mut previous = Duration::ZERO;
			for _ in 0..failures {
				let delay = counter.next_delay();
				prop_assert!(delay >= previous);
				prop_assert!(delay <= counter.max());
				previous = delay;
			}
			counter.reset();
			prop_assert_eq!(counter.next_delay(), Duration::from_millis(base_ms).min(counter.max()));
		}

		#[test]
		fn refresh_delay_never_exceeds_lifetime(iat in 0i64..10_000_000, lifetime in 0i64..100_000, margin in 0u64..10_000) {
			let token = StreamToken::from_parts("t", vec![], iat, iat + lifetime);
			let delay = token.refresh_delay(Duration::from_secs(margin));
			prop_assert!(delay.as_secs() as i64 <= lifetime);
			prop_assert_eq!(delay.as_secs() as i64, (lifetime - margin as i64).max(0));
		}
	}

	// Property-based tests for segment payloads
	proptest! {
		#[test]
		fn unrecognised_compression_is_an_error(c in 3i64..100, data in "[A-Za-z0-9+/]{0,40}") {
			let update = SegmentUpdateV2 {
				change_number: 1,
				segment_name: Some("s".to_string()),
				mode: Some(UpdateMode::KeyList),
				compression: Compression::from_wire(c),
				data: Some(data),
			};
			prop_assert!(decode_instruction(&update).is_err());
		}

		#[test]
		fn garbage_frames_never_panic(event in "[a-z]{0,10}", data in ".{0,200}") {
			let _ = decode(&RawFrame::new(event, data));
		}
	}

	#[test]
	fn token_refresh_scenario() {
		let token = StreamToken::from_parts("t", vec![], 1000, 4000);
		let fires_at = token.issued_at() + token.refresh_delay(Duration::from_secs(600)).as_secs() as i64;
		assert_eq!(fires_at, 3400);
	}
}
