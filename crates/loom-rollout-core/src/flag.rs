// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag definitions and the wire format they are fetched in.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::matcher::{AttributeMatcher, Combiner, DataType, MatcherNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
	/// Explicit key targeting; never subject to traffic allocation.
	Whitelist,
	#[default]
	Rollout,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
	pub treatment: String,
	/// Share of the bucket space, 0..=100.
	pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
	pub condition_type: ConditionType,
	pub matcher: MatcherNode,
	pub partitions: Vec<Partition>,
	pub label: String,
}

impl Condition {
	/// A rollout condition serving `treatment` to every matching identity.
	pub fn rollout(matcher: MatcherNode, treatment: impl Into<String>, label: impl Into<String>) -> Self {
		Self {
			condition_type: ConditionType::Rollout,
			matcher,
			partitions: vec![Partition {
				treatment: treatment.into(),
				size: 100,
			}],
			label: label.into(),
		}
	}

	pub fn whitelist(matcher: MatcherNode, treatment: impl Into<String>, label: impl Into<String>) -> Self {
		Self {
			condition_type: ConditionType::Whitelist,
			..Self::rollout(matcher, treatment, label)
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagDefinition {
	pub name: String,
	pub killed: bool,
	pub default_treatment: String,
	pub change_number: i64,
	/// Percentage of identities eligible for rollout conditions, 0..=100.
	pub traffic_allocation: u32,
	pub traffic_allocation_seed: i32,
	pub seed: i32,
	/// Evaluated in order; first match wins.
	pub conditions: Vec<Condition>,
	/// Opaque configuration string per treatment.
	pub configurations: BTreeMap<String, String>,
}

impl FlagDefinition {
	pub fn new(name: impl Into<String>, default_treatment: impl Into<String>, change_number: i64) -> Self {
		Self {
			name: name.into(),
			killed: false,
			default_treatment: default_treatment.into(),
			change_number,
			traffic_allocation: 100,
			traffic_allocation_seed: 0,
			seed: 0,
			conditions: Vec::new(),
			configurations: BTreeMap::new(),
		}
	}

	pub fn with_condition(mut self, condition: Condition) -> Self {
		self.conditions.push(condition);
		self
	}

	/// Marks the flag killed unless `change_number` predates the cached one.
	///
	/// Returns whether the flag changed.
	pub fn apply_kill(&mut self, default_treatment: &str, change_number: i64) -> bool {
		if change_number < self.change_number {
			return false;
		}
		let changed = !self.killed
			|| self.default_treatment != default_treatment
			|| self.change_number != change_number;
		self.killed = true;
		self.default_treatment = default_treatment.to_string();
		self.change_number = change_number;
		changed
	}
}

/// A flag removed on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFlag {
	pub name: String,
	pub change_number: i64,
}

/// Incremental update produced by one `flagChanges` poll.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlagChangeSet {
	pub active: Vec<FlagDefinition>,
	pub archived: Vec<ArchivedFlag>,
	pub since: i64,
	pub till: i64,
}

impl FlagChangeSet {
	pub fn is_empty(&self) -> bool {
		self.active.is_empty() && self.archived.is_empty()
	}

	/// Converts a server response, skipping flags that fail to convert.
	///
	/// Skipped flags are returned with their error so the caller can log them.
	pub fn from_dto(dto: FlagChangesDto) -> (Self, Vec<(String, CoreError)>) {
		let mut set = FlagChangeSet {
			since: dto.since,
			till: dto.till,
			..Default::default()
		};
		let mut skipped = Vec::new();
		for flag in dto.splits {
			if flag.status == FlagStatus::Archived {
				set.archived.push(ArchivedFlag {
					name: flag.name,
					change_number: flag.change_number,
				});
				continue;
			}
			let name = flag.name.clone();
			match FlagDefinition::try_from(flag) {
				Ok(definition) => set.active.push(definition),
				Err(e) => skipped.push((name, e)),
			}
		}
		(set, skipped)
	}
}

// Wire format

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagChangesDto {
	#[serde(default)]
	pub splits: Vec<FlagDto>,
	pub since: i64,
	pub till: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagStatus {
	#[default]
	Active,
	Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagDto {
	pub name: String,
	#[serde(default)]
	pub killed: bool,
	pub default_treatment: String,
	pub change_number: i64,
	#[serde(default)]
	pub status: FlagStatus,
	#[serde(default = "full_allocation")]
	pub traffic_allocation: u32,
	#[serde(default)]
	pub traffic_allocation_seed: i32,
	#[serde(default)]
	pub seed: i32,
	#[serde(default)]
	pub conditions: Vec<ConditionDto>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub configurations: Option<BTreeMap<String, String>>,
}

fn full_allocation() -> u32 {
	100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDto {
	#[serde(default)]
	pub condition_type: ConditionType,
	#[serde(default)]
	pub label: String,
	#[serde(default)]
	pub partitions: Vec<Partition>,
	pub matcher_group: MatcherGroupDto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroupDto {
	#[serde(default)]
	pub combiner: Option<Combiner>,
	#[serde(default)]
	pub matchers: Vec<MatcherDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatcherDto {
	#[serde(default)]
	pub key_selector: Option<KeySelectorDto>,
	pub matcher_type: String,
	#[serde(default)]
	pub negate: bool,
	#[serde(default)]
	pub whitelist_matcher_data: Option<WhitelistDataDto>,
	#[serde(default)]
	pub unary_numeric_matcher_data: Option<UnaryNumericDataDto>,
	#[serde(default)]
	pub user_defined_segment_matcher_data: Option<SegmentDataDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeySelectorDto {
	#[serde(default)]
	pub attribute: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WhitelistDataDto {
	#[serde(default)]
	pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnaryNumericDataDto {
	#[serde(default = "number_type")]
	pub data_type: DataType,
	pub value: i64,
}

fn number_type() -> DataType {
	DataType::Number
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDataDto {
	pub segment_name: String,
}

impl TryFrom<MatcherDto> for AttributeMatcher {
	type Error = CoreError;

	fn try_from(dto: MatcherDto) -> Result<Self> {
		let missing = |field: &str| CoreError::InvalidFlag(format!("{} requires {field}", dto.matcher_type));
		let matcher = match dto.matcher_type.as_str() {
			"ALL_KEYS" => MatcherNode::AllKeys,
			"EQUAL_TO" | "LESS_THAN_OR_EQUAL_TO" => {
				let data = dto
					.unary_numeric_matcher_data
					.as_ref()
					.ok_or_else(|| missing("unaryNumericMatcherData"))?;
				if dto.matcher_type == "EQUAL_TO" {
					MatcherNode::EqualTo {
						value: data.value,
						data_type: data.data_type,
					}
				} else {
					MatcherNode::LessOrEqual {
						value: data.value,
						data_type: data.data_type,
					}
				}
			}
			"WHITELIST" => {
				let data = dto
					.whitelist_matcher_data
					.as_ref()
					.ok_or_else(|| missing("whitelistMatcherData"))?;
				MatcherNode::Whitelist(data.whitelist.iter().cloned().collect::<BTreeSet<_>>())
			}
			"IN_SEGMENT" => {
				let data = dto
					.user_defined_segment_matcher_data
					.as_ref()
					.ok_or_else(|| missing("userDefinedSegmentMatcherData"))?;
				MatcherNode::InSegment(data.segment_name.clone())
			}
			other => return Err(CoreError::UnsupportedMatcher(other.to_string())),
		};
		Ok(AttributeMatcher {
			attribute: dto.key_selector.and_then(|s| s.attribute),
			matcher,
			negate: dto.negate,
		})
	}
}

impl TryFrom<ConditionDto> for Condition {
	type Error = CoreError;

	fn try_from(dto: ConditionDto) -> Result<Self> {
		let children = dto
			.matcher_group
			.matchers
			.into_iter()
			.map(AttributeMatcher::try_from)
			.collect::<Result<Vec<_>>>()?;
		if children.is_empty() {
			return Err(CoreError::InvalidFlag("condition has no matchers".to_string()));
		}
		if dto.partitions.iter().any(|p| p.size > 100) {
			return Err(CoreError::InvalidFlag("partition size above 100".to_string()));
		}
		Ok(Condition {
			condition_type: dto.condition_type,
			matcher: MatcherNode::Combining {
				combiner: dto.matcher_group.combiner.unwrap_or(Combiner::And),
				children,
			},
			partitions: dto.partitions,
			label: dto.label,
		})
	}
}

impl TryFrom<FlagDto> for FlagDefinition {
	type Error = CoreError;

	fn try_from(dto: FlagDto) -> Result<Self> {
		if dto.name.trim().is_empty() {
			return Err(CoreError::InvalidFlag("empty flag name".to_string()));
		}
		let conditions = dto
			.conditions
			.into_iter()
			.map(Condition::try_from)
			.collect::<Result<Vec<_>>>()?;
		Ok(FlagDefinition {
			name: dto.name,
			killed: dto.killed,
			default_treatment: dto.default_treatment,
			change_number: dto.change_number,
			traffic_allocation: dto.traffic_allocation.min(100),
			traffic_allocation_seed: dto.traffic_allocation_seed,
			seed: dto.seed,
			conditions,
			configurations: dto.configurations.unwrap_or_default(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const CHANGES: &str = r#"{
		"splits": [
			{
				"name": "checkout_flow",
				"killed": false,
				"defaultTreatment": "off",
				"changeNumber": 1700,
				"status": "ACTIVE",
				"trafficAllocation": 80,
				"trafficAllocationSeed": 42,
				"seed": -7,
				"conditions": [
					{
						"conditionType": "WHITELIST",
						"label": "whitelisted",
						"partitions": [{"treatment": "on", "size": 100}],
						"matcherGroup": {
							"combiner": "AND",
							"matchers": [
								{"matcherType": "WHITELIST", "negate": false,
								 "whitelistMatcherData": {"whitelist": ["qa-1", "qa-2"]}}
							]
						}
					},
					{
						"conditionType": "ROLLOUT",
						"label": "young users",
						"partitions": [{"treatment": "on", "size": 50}, {"treatment": "off", "size": 50}],
						"matcherGroup": {
							"combiner": "AND",
							"matchers": [
								{"keySelector": {"attribute": "age"}, "matcherType": "LESS_THAN_OR_EQUAL_TO",
								 "negate": false, "unaryNumericMatcherData": {"dataType": "NUMBER", "value": 30}}
							]
						}
					}
				]
			},
			{"name": "legacy", "defaultTreatment": "off", "changeNumber": 1650, "status": "ARCHIVED"},
			{
				"name": "exotic",
				"defaultTreatment": "off",
				"changeNumber": 1600,
				"conditions": [
					{"matcherGroup": {"matchers": [{"matcherType": "MATCHES_STRING"}]}}
				]
			}
		],
		"since": 1500,
		"till": 1700
	}"#;

	#[test]
	fn change_set_from_wire() {
		let dto: FlagChangesDto = serde_json::from_str(CHANGES).unwrap();
		let (set, skipped) = FlagChangeSet::from_dto(dto);

		assert_eq!(set.since, 1500);
		assert_eq!(set.till, 1700);
		assert_eq!(set.active.len(), 1);
		assert_eq!(
			set.archived,
			vec![ArchivedFlag {
				name: "legacy".to_string(),
				change_number: 1650
			}]
		);
		assert_eq!(skipped.len(), 1);
		assert_eq!(skipped[0].0, "exotic");
		assert!(matches!(skipped[0].1, CoreError::UnsupportedMatcher(_)));

		let flag = &set.active[0];
		assert_eq!(flag.name, "checkout_flow");
		assert_eq!(flag.traffic_allocation, 80);
		assert_eq!(flag.seed, -7);
		assert_eq!(flag.conditions.len(), 2);
		assert_eq!(flag.conditions[0].condition_type, ConditionType::Whitelist);
		assert_eq!(
			flag.conditions[0].matcher,
			MatcherNode::and(vec![AttributeMatcher::vanilla(MatcherNode::whitelist([
				"qa-1", "qa-2"
			]))])
		);
		assert_eq!(
			flag.conditions[1].matcher,
			MatcherNode::and(vec![AttributeMatcher::on_attribute(
				"age",
				MatcherNode::LessOrEqual {
					value: 30,
					data_type: DataType::Number
				}
			)])
		);
	}

	#[test]
	fn missing_matcher_data_is_invalid() {
		let dto = MatcherDto {
			key_selector: None,
			matcher_type: "EQUAL_TO".to_string(),
			negate: false,
			whitelist_matcher_data: None,
			unary_numeric_matcher_data: None,
			user_defined_segment_matcher_data: None,
		};
		assert!(matches!(
			AttributeMatcher::try_from(dto),
			Err(CoreError::InvalidFlag(_))
		));
	}

	#[test]
	fn kill_respects_change_number() {
		let mut flag = FlagDefinition::new("f", "on", 10);

		assert!(!flag.apply_kill("off", 9));
		assert!(!flag.killed);

		assert!(flag.apply_kill("off", 11));
		assert!(flag.killed);
		assert_eq!(flag.default_treatment, "off");
		assert_eq!(flag.change_number, 11);

		assert!(!flag.apply_kill("off", 11));
	}
}
