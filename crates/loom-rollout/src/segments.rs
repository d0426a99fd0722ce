// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Applies pushed segment updates to one identity's cached memberships.

use std::sync::Arc;

use loom_rollout_core::{IdentityHashes, KeyListAction, SegmentChangeV1, SegmentInstruction, SegmentUpdateV1};
use tracing::debug;

use crate::events::{EventBus, Resource, SdkEvent};
use crate::storage::{SegmentChange, SegmentStorage};
use crate::sync::RefreshRequester;

/// Per-identity handler registered with the notification router.
pub struct IdentitySegmentsProcessor {
	matching_key: String,
	hashes: IdentityHashes,
	storage: Arc<dyn SegmentStorage>,
	refresh: RefreshRequester,
	events: EventBus,
}

impl IdentitySegmentsProcessor {
	pub fn new(
		matching_key: impl Into<String>,
		storage: Arc<dyn SegmentStorage>,
		refresh: RefreshRequester,
		events: EventBus,
	) -> Self {
		let matching_key = matching_key.into();
		Self {
			hashes: IdentityHashes::for_key(&matching_key),
			matching_key,
			storage,
			refresh,
			events,
		}
	}

	pub fn matching_key(&self) -> &str {
		&self.matching_key
	}

	pub fn hashes(&self) -> &IdentityHashes {
		&self.hashes
	}

	/// Applies a V1 update already matched to this identity's hash.
	pub fn apply_v1(&self, update: &SegmentUpdateV1) {
		match &update.change {
			SegmentChangeV1::Member { segment, added: true } => {
				self.apply(SegmentChange::Add(segment.clone()));
			}
			SegmentChangeV1::Member { segment, added: false } => {
				self.apply(SegmentChange::Remove(segment.clone()));
			}
			SegmentChangeV1::Replace(list) => {
				self.apply(SegmentChange::Replace(list.clone()));
			}
			SegmentChangeV1::Refetch => self.request_refetch(),
		}
	}

	/// Applies a decoded V2 instruction for `segment`.
	pub fn apply_v2(&self, segment: Option<&str>, instruction: &SegmentInstruction) {
		match instruction {
			SegmentInstruction::Unbounded => self.request_refetch(),
			SegmentInstruction::Bounded(filter) => {
				if filter.may_contain(self.hashes.bounded) {
					self.request_refetch();
				}
			}
			SegmentInstruction::KeyList(list) => {
				let Some(segment) = segment else {
					self.request_refetch();
					return;
				};
				match list.action_for(self.hashes.key_list) {
					Some(KeyListAction::Add) => self.apply(SegmentChange::Add(segment.to_string())),
					Some(KeyListAction::Remove) => {
						self.apply(SegmentChange::Remove(segment.to_string()))
					}
					None => {}
				}
			}
			SegmentInstruction::Removal => match segment {
				Some(segment) => self.apply(SegmentChange::Remove(segment.to_string())),
				None => self.request_refetch(),
			},
		}
	}

	pub fn request_refetch(&self) {
		debug!(identity = %self.matching_key, "Segment refetch requested by push");
		self.refresh.request(self.resource());
	}

	fn apply(&self, change: SegmentChange) {
		if self.storage.update(&self.matching_key, change) {
			self.events.emit(SdkEvent::Updated {
				resource: self.resource(),
			});
		}
	}

	fn resource(&self) -> Resource {
		Resource::Segments(self.matching_key.clone())
	}
}
