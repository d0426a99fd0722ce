// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Decoding of V2 segment update payloads and the identity hashes they target.

use std::collections::HashSet;
use std::io::{Cursor, Read};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::{GzDecoder, ZlibDecoder};
use murmur3::{murmur3_32, murmur3_x64_128};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::notification::{Compression, SegmentUpdateV2, UpdateMode};

/// Hash forms of one matching key, precomputed at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityHashes {
	/// Matches the V1 channel prefix.
	pub v1: String,
	pub key_list: u64,
	pub bounded: u32,
}

impl IdentityHashes {
	pub fn for_key(matching_key: &str) -> Self {
		Self {
			v1: v1_hash(matching_key),
			key_list: key_list_hash(matching_key),
			bounded: bounded_hash(matching_key),
		}
	}
}

/// `base64(sha256(key))`.
pub fn v1_hash(matching_key: &str) -> String {
	STANDARD.encode(Sha256::digest(matching_key.as_bytes()))
}

/// Low 64 bits of murmur3 x64_128.
pub fn key_list_hash(matching_key: &str) -> u64 {
	murmur3_x64_128(&mut Cursor::new(matching_key.as_bytes()), 0).unwrap_or(0) as u64
}

pub fn bounded_hash(matching_key: &str) -> u32 {
	murmur3_32(&mut Cursor::new(matching_key.as_bytes()), 0).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyListAction {
	Add,
	Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct KeyList {
	#[serde(rename = "a", default)]
	added: HashSet<u64>,
	#[serde(rename = "r", default)]
	removed: HashSet<u64>,
}

impl KeyList {
	pub fn new(added: impl IntoIterator<Item = u64>, removed: impl IntoIterator<Item = u64>) -> Self {
		Self {
			added: added.into_iter().collect(),
			removed: removed.into_iter().collect(),
		}
	}

	/// What this list asks of the identity with `hash`, if anything.
	pub fn action_for(&self, hash: u64) -> Option<KeyListAction> {
		if self.added.contains(&hash) {
			Some(KeyListAction::Add)
		} else if self.removed.contains(&hash) {
			Some(KeyListAction::Remove)
		} else {
			None
		}
	}
}

/// Probabilistic membership bitmap; false positives only cost a refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedFilter {
	bitmap: Vec<u8>,
}

impl BoundedFilter {
	pub fn new(bitmap: Vec<u8>) -> Self {
		Self { bitmap }
	}

	pub fn may_contain(&self, hash: u32) -> bool {
		if self.bitmap.is_empty() {
			return false;
		}
		let index = hash as usize % (self.bitmap.len() * 8);
		self.bitmap[index / 8] & (1 << (index % 8)) != 0
	}
}

/// What a V2 update asks processors to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentInstruction {
	/// Membership unknown; every receiving identity refetches.
	Unbounded,
	/// Identities passing the filter refetch.
	Bounded(BoundedFilter),
	KeyList(KeyList),
	/// Drop the named segment outright.
	Removal,
}

/// Decodes the payload of a V2 update.
///
/// Any failure (unknown mode, unknown compression, bad base64, corrupt
/// stream, bad JSON) is an error; callers treat it as `Unbounded`.
pub fn decode_instruction(update: &SegmentUpdateV2) -> Result<SegmentInstruction> {
	let mode = update
		.mode
		.ok_or_else(|| CoreError::InvalidPayload("unknown update mode".to_string()))?;
	match mode {
		UpdateMode::Unbounded => Ok(SegmentInstruction::Unbounded),
		UpdateMode::SegmentRemoval => {
			require_segment(update)?;
			Ok(SegmentInstruction::Removal)
		}
		UpdateMode::Bounded => Ok(SegmentInstruction::Bounded(BoundedFilter::new(payload_bytes(update)?))),
		UpdateMode::KeyList => {
			require_segment(update)?;
			let bytes = payload_bytes(update)?;
			Ok(SegmentInstruction::KeyList(serde_json::from_slice(&bytes)?))
		}
	}
}

fn require_segment(update: &SegmentUpdateV2) -> Result<()> {
	match update.segment_name.as_deref() {
		Some(name) if !name.is_empty() => Ok(()),
		_ => Err(CoreError::InvalidPayload("segment name missing".to_string())),
	}
}

fn payload_bytes(update: &SegmentUpdateV2) -> Result<Vec<u8>> {
	let compression = update
		.compression
		.ok_or_else(|| CoreError::InvalidPayload("unknown compression".to_string()))?;
	let data = update
		.data
		.as_deref()
		.ok_or_else(|| CoreError::InvalidPayload("payload missing".to_string()))?;
	let raw = STANDARD
		.decode(data)
		.map_err(|e| CoreError::InvalidPayload(format!("base64: {e}")))?;
	decompress(compression, raw)
}

/// Upper bound on a decoded segment payload.
pub const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

fn decompress(compression: Compression, raw: Vec<u8>) -> Result<Vec<u8>> {
	let mut out = Vec::new();
	// One byte past the limit is enough to tell an oversized payload apart.
	let read = match compression {
		Compression::None => {
			out = raw;
			Ok(out.len())
		}
		Compression::Gzip => GzDecoder::new(raw.as_slice())
			.take(MAX_PAYLOAD_LEN + 1)
			.read_to_end(&mut out),
		Compression::Zlib => ZlibDecoder::new(raw.as_slice())
			.take(MAX_PAYLOAD_LEN + 1)
			.read_to_end(&mut out),
	};
	read.map_err(|e| CoreError::InvalidPayload(format!("{compression:?}: {e}")))?;
	if out.len() as u64 > MAX_PAYLOAD_LEN {
		return Err(CoreError::InvalidPayload(format!(
			"{compression:?}: payload exceeds {MAX_PAYLOAD_LEN} bytes"
		)));
	}
	Ok(out)
}

#[cfg(test)]
pub(crate) fn encode_test_payload(compression: Compression, bytes: &[u8]) -> String {
	use std::io::Write;

	use flate2::write::{GzEncoder, ZlibEncoder};

	let compressed = match compression {
		Compression::None => bytes.to_vec(),
		Compression::Gzip => {
			let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
			encoder.write_all(bytes).unwrap();
			encoder.finish().unwrap()
		}
		Compression::Zlib => {
			let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
			encoder.write_all(bytes).unwrap();
			encoder.finish().unwrap()
		}
	};
	STANDARD.encode(compressed)
}
