// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Treatment resolution against locally cached flag definitions.
//!
//! Evaluation order:
//! 1. Reject invalid keys
//! 2. Return control until the cache has completed an initial load
//! 3. Return control if the flag is unknown
//! 4. Return the default treatment if the flag is killed
//! 5. Walk conditions in order; the first matching condition picks a partition
//! 6. Fall back to the default treatment

use std::io::Cursor;
use std::sync::Arc;

use murmur3::murmur3_32;
use serde::{Deserialize, Serialize};

use crate::flag::{ConditionType, FlagDefinition, Partition};
use crate::key::{Attributes, Key};
use crate::matcher::{MatchContext, SegmentLookup};

/// Reserved treatment returned whenever a real one cannot be resolved.
pub const CONTROL: &str = "control";

pub mod labels {
	pub const DEFINITION_NOT_FOUND: &str = "definition not found";
	pub const NOT_READY: &str = "not ready";
	pub const KILLED: &str = "killed";
	pub const DEFAULT_RULE: &str = "default rule";
	pub const NOT_IN_SPLIT: &str = "not in split";
	pub const INVALID_KEY: &str = "invalid key";
	pub const CLIENT_DESTROYED: &str = "client destroyed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
	pub treatment: String,
	pub label: String,
	/// Change number of the definition used, when one was found.
	pub change_number: Option<i64>,
	/// Configuration attached to the served treatment.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub config: Option<String>,
}

impl EvaluationResult {
	pub fn control(label: &str) -> Self {
		Self {
			treatment: CONTROL.to_string(),
			label: label.to_string(),
			change_number: None,
			config: None,
		}
	}

	fn from_flag(flag: &FlagDefinition, treatment: &str, label: &str) -> Self {
		Self {
			treatment: treatment.to_string(),
			label: label.to_string(),
			change_number: Some(flag.change_number),
			config: flag.configurations.get(treatment).cloned(),
		}
	}

	pub fn is_control(&self) -> bool {
		self.treatment == CONTROL
	}
}

/// Maps a bucketing key and seed to a bucket in `1..=100`.
pub trait Bucketer: Send + Sync {
	fn bucket(&self, key: &str, seed: i32) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Bucketer;

impl Bucketer for Murmur3Bucketer {
	fn bucket(&self, key: &str, seed: i32) -> u32 {
		let hash = murmur3_32(&mut Cursor::new(key.as_bytes()), seed as u32).unwrap_or(0);
		(hash % 100) + 1
	}
}

/// Read side of the flag cache as seen by the evaluator.
pub trait FlagLookup {
	/// Whether an initial load has completed.
	fn is_ready(&self) -> bool;
	fn flag(&self, name: &str) -> Option<Arc<FlagDefinition>>;
}

pub struct Evaluator<B = Murmur3Bucketer> {
	bucketer: B,
}

impl Default for Evaluator<Murmur3Bucketer> {
	fn default() -> Self {
		Self::new(Murmur3Bucketer)
	}
}

impl<B: Bucketer> Evaluator<B> {
	pub fn new(bucketer: B) -> Self {
		Self { bucketer }
	}

	pub fn evaluate(
		&self,
		flags: &dyn FlagLookup,
		flag_name: &str,
		key: &Key,
		attributes: &Attributes,
		segments: &dyn SegmentLookup,
	) -> EvaluationResult {
		if !key.is_valid() {
			return EvaluationResult::control(labels::INVALID_KEY);
		}
		if !flags.is_ready() {
			return EvaluationResult::control(labels::NOT_READY);
		}
		match flags.flag(flag_name) {
			Some(flag) => self.evaluate_definition(&flag, key, attributes, segments),
			None => EvaluationResult::control(labels::DEFINITION_NOT_FOUND),
		}
	}

	/// Resolves a treatment for a definition already in hand.
	pub fn evaluate_definition(
		&self,
		flag: &FlagDefinition,
		key: &Key,
		attributes: &Attributes,
		segments: &dyn SegmentLookup,
	) -> EvaluationResult {
		if flag.killed {
			return EvaluationResult::from_flag(flag, &flag.default_treatment, labels::KILLED);
		}

		let ctx = MatchContext {
			matching_key: key.matching_key(),
			bucketing_key: key.bucketing_key(),
			attributes,
			segments,
		};

		let mut allocation_checked = false;
		for condition in &flag.conditions {
			if !allocation_checked && condition.condition_type == ConditionType::Rollout {
				allocation_checked = true;
				if flag.traffic_allocation < 100 {
					let bucket = self
						.bucketer
						.bucket(ctx.bucketing_key, flag.traffic_allocation_seed);
					if bucket > flag.traffic_allocation {
						return EvaluationResult::from_flag(
							flag,
							&flag.default_treatment,
							labels::NOT_IN_SPLIT,
						);
					}
				}
			}

			if condition.matcher.matches(None, &ctx) {
				return match self.select_partition(&condition.partitions, ctx.bucketing_key, flag.seed) {
					Some(treatment) => EvaluationResult::from_flag(flag, treatment, &condition.label),
					None => EvaluationResult {
						change_number: Some(flag.change_number),
						..EvaluationResult::control(&condition.label)
					},
				};
			}
		}

		EvaluationResult::from_flag(flag, &flag.default_treatment, labels::DEFAULT_RULE)
	}

	fn select_partition<'a>(&self, partitions: &'a [Partition], key: &str, seed: i32) -> Option<&'a str> {
		if let [only] = partitions {
			if only.size == 100 {
				return Some(&only.treatment);
			}
		}
		let bucket = self.bucketer.bucket(key, seed);
		let mut cumulative = 0u32;
		for partition in partitions {
			cumulative += partition.size;
			if bucket <= cumulative {
				return Some(&partition.treatment);
			}
		}
		None
	}
}
