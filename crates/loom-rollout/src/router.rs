// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Routes decoded stream notifications to their consumers.
//!
//! Flag updates and kills go onto the orchestrator's change queue. Segment
//! updates go to the per-identity processors they target.

use std::collections::HashMap;
use std::sync::Arc;

use loom_rollout_core::{decode_instruction, Notification, SegmentInstruction, SegmentUpdateV2};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::segments::IdentitySegmentsProcessor;
use crate::sync::FlagChange;

pub struct NotificationRouter {
	processors: RwLock<HashMap<String, Arc<IdentitySegmentsProcessor>>>,
	flag_changes: mpsc::UnboundedSender<FlagChange>,
}

impl NotificationRouter {
	pub fn new(flag_changes: mpsc::UnboundedSender<FlagChange>) -> Self {
		Self {
			processors: RwLock::new(HashMap::new()),
			flag_changes,
		}
	}

	/// Adds a processor. Returns `false` if its identity was already registered.
	pub fn register(&self, processor: Arc<IdentitySegmentsProcessor>) -> bool {
		let mut processors = self.processors.write();
		if processors.contains_key(processor.matching_key()) {
			return false;
		}
		processors.insert(processor.matching_key().to_string(), processor);
		true
	}

	pub fn unregister(&self, matching_key: &str) -> bool {
		self.processors.write().remove(matching_key).is_some()
	}

	pub fn is_registered(&self, matching_key: &str) -> bool {
		self.processors.read().contains_key(matching_key)
	}

	/// Matching keys of every registered identity, sorted.
	pub fn registered_keys(&self) -> Vec<String> {
		let mut keys: Vec<String> = self.processors.read().keys().cloned().collect();
		keys.sort();
		keys
	}

	/// Delivers one notification. Returns how many consumers received it.
	pub fn dispatch(&self, notification: Notification) -> usize {
		match notification {
			Notification::FlagUpdate { change_number } => {
				self.enqueue(FlagChange::Update { change_number })
			}
			Notification::FlagKill {
				name,
				default_treatment,
				change_number,
			} => self.enqueue(FlagChange::Kill {
				name,
				default_treatment,
				change_number,
			}),
			Notification::SegmentUpdateV1(update) => {
				let targets: Vec<_> = self
					.snapshot()
					.into_iter()
					.filter(|p| p.hashes().v1 == update.identity_hash)
					.collect();
				for processor in &targets {
					processor.apply_v1(&update);
				}
				if targets.is_empty() {
					debug!(hash = %update.identity_hash, "Segment update for unknown identity");
				}
				targets.len()
			}
			Notification::SegmentUpdateV2(update) => self.dispatch_v2(&update),
			other => {
				debug!(kind = other.kind(), "Notification not routable");
				0
			}
		}
	}

	fn dispatch_v2(&self, update: &SegmentUpdateV2) -> usize {
		let instruction = decode_instruction(update).unwrap_or_else(|e| {
			warn!(
				segment = ?update.segment_name,
				change_number = update.change_number,
				error = %e,
				"Undecodable segment payload, treating as unbounded"
			);
			SegmentInstruction::Unbounded
		});

		let targets = self.snapshot();
		for processor in &targets {
			processor.apply_v2(update.segment_name.as_deref(), &instruction);
		}
		targets.len()
	}

	fn enqueue(&self, change: FlagChange) -> usize {
		match self.flag_changes.send(change) {
			Ok(()) => 1,
			Err(_) => {
				debug!("Flag change queue closed");
				0
			}
		}
	}

	fn snapshot(&self) -> Vec<Arc<IdentitySegmentsProcessor>> {
		self.processors.read().values().cloned().collect()
	}
}
