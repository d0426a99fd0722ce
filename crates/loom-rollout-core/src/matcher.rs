// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Predicate tree used inside flag conditions.
//!
//! A condition owns one [`MatcherNode`], usually a [`MatcherNode::Combining`]
//! root whose children are [`AttributeMatcher`]s. Each attribute matcher picks
//! the value it tests (the matching key, or a named attribute) and may negate
//! the result. Every node is a pure function of its configuration and the
//! [`MatchContext`]; equality and hashing are structural.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::Attributes;

/// How an attribute value is coerced before a numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
	Number,
	/// Milliseconds since the Unix epoch, compared at reduced precision.
	Datetime,
}

/// Boolean operator joining the children of a combining node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Combiner {
	And,
}

/// Read-only view over the segments an identity currently belongs to.
pub trait SegmentLookup {
	fn contains_segment(&self, segment: &str) -> bool;
}

impl SegmentLookup for HashSet<String> {
	fn contains_segment(&self, segment: &str) -> bool {
		self.contains(segment)
	}
}

/// Lookup for identities with no cached memberships.
pub struct NoSegments;

impl SegmentLookup for NoSegments {
	fn contains_segment(&self, _segment: &str) -> bool {
		false
	}
}

/// Everything a matcher may consult while evaluating.
pub struct MatchContext<'a> {
	pub matching_key: &'a str,
	pub bucketing_key: &'a str,
	pub attributes: &'a Attributes,
	pub segments: &'a dyn SegmentLookup,
}

/// The value under test: either the identity's matching key or an attribute.
#[derive(Debug, Clone, Copy)]
pub enum MatchValue<'a> {
	Key(&'a str),
	Value(&'a Value),
}

#[derive(Debug, Clone, Copy)]
enum Precision {
	Day,
	Minute,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatcherNode {
	AllKeys,
	EqualTo { value: i64, data_type: DataType },
	LessOrEqual { value: i64, data_type: DataType },
	Whitelist(BTreeSet<String>),
	/// Identity belongs to the named segment.
	InSegment(String),
	Combining {
		combiner: Combiner,
		children: Vec<AttributeMatcher>,
	},
	Negated(Box<MatcherNode>),
}

impl MatcherNode {
	pub fn whitelist<I, S>(values: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		MatcherNode::Whitelist(values.into_iter().map(Into::into).collect())
	}

	pub fn and(children: Vec<AttributeMatcher>) -> Self {
		MatcherNode::Combining {
			combiner: Combiner::And,
			children,
		}
	}

	pub fn negate(self) -> Self {
		MatcherNode::Negated(Box::new(self))
	}

	/// Evaluates this node against `value`.
	///
	/// `None` means the value is absent or null. Combining nodes ignore `value`
	/// and let each child select its own.
	pub fn matches(&self, value: Option<MatchValue<'_>>, ctx: &MatchContext<'_>) -> bool {
		match self {
			MatcherNode::AllKeys => value.is_some(),
			MatcherNode::EqualTo { value: expected, data_type } => {
				match (
					coerce(value, *data_type, Precision::Day),
					normalize(*expected, *data_type, Precision::Day),
				) {
					(Some(actual), Some(expected)) => actual == expected,
					_ => false,
				}
			}
			MatcherNode::LessOrEqual { value: expected, data_type } => {
				match (
					coerce(value, *data_type, Precision::Minute),
					normalize(*expected, *data_type, Precision::Minute),
				) {
					(Some(actual), Some(expected)) => actual <= expected,
					_ => false,
				}
			}
			MatcherNode::Whitelist(set) => value.and_then(as_str).is_some_and(|s| set.contains(s)),
			MatcherNode::InSegment(segment) => value.is_some() && ctx.segments.contains_segment(segment),
			MatcherNode::Combining { combiner, children } => {
				if children.is_empty() {
					return false;
				}
				match combiner {
					Combiner::And => children.iter().all(|child| child.matches(ctx)),
				}
			}
			MatcherNode::Negated(delegate) => !delegate.matches(value, ctx),
		}
	}
}

impl fmt::Display for MatcherNode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MatcherNode::AllKeys => write!(f, "in segment all"),
			MatcherNode::EqualTo { value, .. } => write!(f, "== {value}"),
			MatcherNode::LessOrEqual { value, .. } => write!(f, "<= {value}"),
			MatcherNode::Whitelist(set) => {
				let items: Vec<String> = set.iter().map(|s| format!("\"{s}\"")).collect();
				write!(f, "in segment [{}]", items.join(","))
			}
			MatcherNode::InSegment(segment) => write!(f, "in segment {segment}"),
			MatcherNode::Combining { children, .. } => {
				let parts: Vec<String> = children.iter().map(ToString::to_string).collect();
				write!(f, "{}", parts.join(" and "))
			}
			MatcherNode::Negated(delegate) => write!(f, "not {delegate}"),
		}
	}
}

/// A matcher bound to the value it tests, with optional negation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeMatcher {
	/// Attribute to read; `None` tests the matching key.
	pub attribute: Option<String>,
	pub matcher: MatcherNode,
	pub negate: bool,
}

impl AttributeMatcher {
	/// Tests the matching key without negation.
	pub fn vanilla(matcher: MatcherNode) -> Self {
		Self {
			attribute: None,
			matcher,
			negate: false,
		}
	}

	pub fn on_attribute(attribute: impl Into<String>, matcher: MatcherNode) -> Self {
		Self {
			attribute: Some(attribute.into()),
			matcher,
			negate: false,
		}
	}

	pub fn negated(mut self) -> Self {
		self.negate = !self.negate;
		self
	}

	pub fn matches(&self, ctx: &MatchContext<'_>) -> bool {
		let value = match &self.attribute {
			None => Some(MatchValue::Key(ctx.matching_key)),
			Some(name) => ctx
				.attributes
				.get(name)
				.filter(|v| !v.is_null())
				.map(MatchValue::Value),
		};
		self.matcher.matches(value, ctx) != self.negate
	}
}

impl fmt::Display for AttributeMatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.negate {
			write!(f, "not ")?;
		}
		match &self.attribute {
			Some(attribute) => write!(f, "{attribute} {}", self.matcher),
			None => write!(f, "{}", self.matcher),
		}
	}
}

fn as_str<'a>(value: MatchValue<'a>) -> Option<&'a str> {
	match value {
		MatchValue::Key(k) => Some(k),
		MatchValue::Value(Value::String(s)) => Some(s.as_str()),
		MatchValue::Value(_) => None,
	}
}

fn as_i64(value: MatchValue<'_>) -> Option<i64> {
	match value {
		MatchValue::Key(k) => k.trim().parse().ok(),
		MatchValue::Value(Value::String(s)) => s.trim().parse().ok(),
		MatchValue::Value(Value::Number(n)) => n.as_i64().or_else(|| {
			n.as_f64()
				.filter(|f| f.is_finite() && f.fract() == 0.0)
				.map(|f| f as i64)
		}),
		MatchValue::Value(_) => None,
	}
}

fn coerce(value: Option<MatchValue<'_>>, data_type: DataType, precision: Precision) -> Option<i64> {
	normalize(as_i64(value?)?, data_type, precision)
}

fn normalize(raw: i64, data_type: DataType, precision: Precision) -> Option<i64> {
	match data_type {
		DataType::Number => Some(raw),
		DataType::Datetime => truncate_millis(raw, precision),
	}
}

fn truncate_millis(millis: i64, precision: Precision) -> Option<i64> {
	let at = DateTime::<Utc>::from_timestamp_millis(millis)?;
	let truncated = match precision {
		Precision::Day => at.date_naive().and_hms_opt(0, 0, 0)?.and_utc(),
		Precision::Minute => at.with_second(0)?.with_nanosecond(0)?,
	};
	Some(truncated.timestamp_millis())
}
