// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local cache of flag definitions and per-identity segment memberships.
//!
//! Readers load an immutable snapshot and never block. Writers are
//! serialized by a short mutex and publish a fresh snapshot when they finish,
//! so an evaluation sees either the whole update or none of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use loom_rollout_core::{FlagChangeSet, FlagDefinition, FlagLookup};
use parking_lot::Mutex;
use tracing::debug;

/// Change number of a cache that has never synced.
pub const INITIAL_CHANGE_NUMBER: i64 = -1;

/// What an [`FlagStorage::update`] actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
	pub updated: Vec<String>,
	pub removed: Vec<String>,
	/// Entries ignored because the cache already held a newer version.
	pub stale: usize,
}

impl UpdateSummary {
	pub fn is_empty(&self) -> bool {
		self.updated.is_empty() && self.removed.is_empty()
	}
}

/// Storage for flag definitions.
pub trait FlagStorage: Send + Sync {
	fn get(&self, name: &str) -> Option<Arc<FlagDefinition>>;
	fn get_all(&self) -> Vec<Arc<FlagDefinition>>;
	/// Highest change number applied so far.
	fn change_number(&self) -> i64;
	/// Whether at least one sync has been applied.
	fn is_ready(&self) -> bool;
	/// Applies a change set. Entries not newer than the cached version are ignored.
	fn update(&self, changes: FlagChangeSet) -> UpdateSummary;
	/// Marks a flag killed unless the kill predates the cached definition.
	fn kill(&self, name: &str, default_treatment: &str, change_number: i64) -> bool;
	fn clear(&self);
}

#[derive(Debug)]
struct FlagSnapshot {
	flags: HashMap<String, Arc<FlagDefinition>>,
	change_number: i64,
	ready: bool,
}

impl FlagSnapshot {
	fn empty() -> Self {
		Self {
			flags: HashMap::new(),
			change_number: INITIAL_CHANGE_NUMBER,
			ready: false,
		}
	}
}

/// Copy-on-write in-memory [`FlagStorage`].
pub struct MemoryFlagStorage {
	snapshot: ArcSwap<FlagSnapshot>,
	writer: Mutex<()>,
}

impl MemoryFlagStorage {
	pub fn new() -> Self {
		Self {
			snapshot: ArcSwap::from_pointee(FlagSnapshot::empty()),
			writer: Mutex::new(()),
		}
	}
}

impl Default for MemoryFlagStorage {
	fn default() -> Self {
		Self::new()
	}
}

impl FlagStorage for MemoryFlagStorage {
	fn get(&self, name: &str) -> Option<Arc<FlagDefinition>> {
		self.snapshot.load().flags.get(name).cloned()
	}

	fn get_all(&self) -> Vec<Arc<FlagDefinition>> {
		self.snapshot.load().flags.values().cloned().collect()
	}

	fn change_number(&self) -> i64 {
		self.snapshot.load().change_number
	}

	fn is_ready(&self) -> bool {
		self.snapshot.load().ready
	}

	fn update(&self, changes: FlagChangeSet) -> UpdateSummary {
		let _guard = self.writer.lock();
		let current = self.snapshot.load_full();
		let mut flags = current.flags.clone();
		let mut summary = UpdateSummary::default();

		for flag in changes.active {
			if let Some(cached) = flags.get(&flag.name) {
				if flag.change_number <= cached.change_number {
					debug!(
						flag = %flag.name,
						incoming = flag.change_number,
						cached = cached.change_number,
						"Ignoring stale flag definition"
					);
					summary.stale += 1;
					continue;
				}
			}
			summary.updated.push(flag.name.clone());
			flags.insert(flag.name.clone(), Arc::new(flag));
		}

		for archived in changes.archived {
			let Some(cached) = flags.get(&archived.name) else {
				continue;
			};
			if archived.change_number <= cached.change_number {
				summary.stale += 1;
				continue;
			}
			flags.remove(&archived.name);
			summary.removed.push(archived.name);
		}

		self.snapshot.store(Arc::new(FlagSnapshot {
			flags,
			change_number: current.change_number.max(changes.till),
			ready: true,
		}));
		summary
	}

	fn kill(&self, name: &str, default_treatment: &str, change_number: i64) -> bool {
		let _guard = self.writer.lock();
		let current = self.snapshot.load_full();
		let Some(cached) = current.flags.get(name) else {
			return false;
		};

		let mut flag = FlagDefinition::clone(cached);
		if !flag.apply_kill(default_treatment, change_number) {
			return false;
		}

		let mut flags = current.flags.clone();
		flags.insert(name.to_string(), Arc::new(flag));
		self.snapshot.store(Arc::new(FlagSnapshot {
			flags,
			change_number: current.change_number,
			ready: current.ready,
		}));
		true
	}

	fn clear(&self) {
		let _guard = self.writer.lock();
		self.snapshot.store(Arc::new(FlagSnapshot::empty()));
	}
}

/// Adapts a [`FlagStorage`] to the evaluator's read interface.
pub struct StorageLookup<'a>(pub &'a dyn FlagStorage);

impl FlagLookup for StorageLookup<'_> {
	fn is_ready(&self) -> bool {
		self.0.is_ready()
	}

	fn flag(&self, name: &str) -> Option<Arc<FlagDefinition>> {
		self.0.get(name)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentChange {
	/// Full membership list from a poll or a V1 payload.
	Replace(Vec<String>),
	Add(String),
	Remove(String),
}

/// Storage for per-identity segment memberships.
pub trait SegmentStorage: Send + Sync {
	/// Current memberships of `matching_key`; empty when unknown.
	fn get(&self, matching_key: &str) -> Arc<HashSet<String>>;
	fn get_all(&self) -> HashMap<String, Arc<HashSet<String>>>;
	/// Starts tracking `matching_key` with an empty membership set. A no-op
	/// when it is already tracked.
	fn register(&self, matching_key: &str);
	/// Returns whether the membership set changed. Identities that were never
	/// registered, or were cleared since, are left untouched.
	fn update(&self, matching_key: &str, change: SegmentChange) -> bool;
	fn clear(&self, matching_key: &str);
}

struct IdentitySegments {
	current: ArcSwap<HashSet<String>>,
	writer: Mutex<()>,
}

impl IdentitySegments {
	fn new() -> Self {
		Self {
			current: ArcSwap::from_pointee(HashSet::new()),
			writer: Mutex::new(()),
		}
	}
}

/// In-memory [`SegmentStorage`] with one writer lock per identity.
///
/// Identities update independently; lookups never take a lock.
pub struct MemorySegmentStorage {
	identities: ArcSwap<HashMap<String, Arc<IdentitySegments>>>,
	writer: Mutex<()>,
}

impl MemorySegmentStorage {
	pub fn new() -> Self {
		Self {
			identities: ArcSwap::from_pointee(HashMap::new()),
			writer: Mutex::new(()),
		}
	}

}

impl Default for MemorySegmentStorage {
	fn default() -> Self {
		Self::new()
	}
}

impl SegmentStorage for MemorySegmentStorage {
	fn get(&self, matching_key: &str) -> Arc<HashSet<String>> {
		self.identities
			.load()
			.get(matching_key)
			.map(|entry| entry.current.load_full())
			.unwrap_or_default()
	}

	fn get_all(&self) -> HashMap<String, Arc<HashSet<String>>> {
		self.identities
			.load()
			.iter()
			.map(|(key, entry)| (key.clone(), entry.current.load_full()))
			.collect()
	}

	fn register(&self, matching_key: &str) {
		let _guard = self.writer.lock();
		let current = self.identities.load_full();
		if current.contains_key(matching_key) {
			return;
		}
		let mut identities = HashMap::clone(&current);
		identities.insert(matching_key.to_string(), Arc::new(IdentitySegments::new()));
		self.identities.store(Arc::new(identities));
	}

	fn update(&self, matching_key: &str, change: SegmentChange) -> bool {
		let Some(entry) = self.identities.load().get(matching_key).cloned() else {
			debug!(identity = %matching_key, "Ignoring segment update for untracked identity");
			return false;
		};
		let _guard = entry.writer.lock();
		// A concurrent clear may have dropped this entry from the map.
		if !self
			.identities
			.load()
			.get(matching_key)
			.is_some_and(|live| Arc::ptr_eq(live, &entry))
		{
			return false;
		}
		let current = entry.current.load_full();

		let next = match change {
			SegmentChange::Replace(list) => {
				let next: HashSet<String> = list.into_iter().collect();
				if next == *current {
					return false;
				}
				next
			}
			SegmentChange::Add(segment) => {
				if current.contains(&segment) {
					return false;
				}
				let mut next = HashSet::clone(&current);
				next.insert(segment);
				next
			}
			SegmentChange::Remove(segment) => {
				if !current.contains(&segment) {
					return false;
				}
				let mut next = HashSet::clone(&current);
				next.remove(&segment);
				next
			}
		};

		entry.current.store(Arc::new(next));
		true
	}

	fn clear(&self, matching_key: &str) {
		let _guard = self.writer.lock();
		let current = self.identities.load_full();
		if !current.contains_key(matching_key) {
			return;
		}
		let mut identities = HashMap::clone(&current);
		identities.remove(matching_key);
		self.identities.store(Arc::new(identities));
	}
}
