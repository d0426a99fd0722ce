// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Localhost mode: flags served from a local file instead of the network.
//!
//! A JSON file holds either a `flagChanges` response or a map from flag name
//! to a treatment, a rule `{"treatment": .., "keys": [..]}`, or a list of rules.
//!
//! ```json
//! {
//!   "new_checkout": "on",
//!   "beta_banner": [
//!     {"treatment": "on", "keys": ["alice", "bob"]},
//!     {"treatment": "off"}
//!   ]
//! }
//! ```
//!
//! Files ending in `.yaml` or `.yml` hold a list of single-flag entries.
//! Repeating a flag adds another rule. `keys` is one key or a list, and
//! `config` is returned with the treatment it sits next to.
//!
//! ```yaml
//! - beta_banner:
//!     treatment: "on"
//!     keys: ["alice", "bob"]
//!     config: "{\"color\": \"blue\"}"
//! - beta_banner:
//!     treatment: "off"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use loom_rollout_core::flag::{
	ConditionDto, FlagStatus, MatcherDto, MatcherGroupDto, WhitelistDataDto,
};
use loom_rollout_core::{Combiner, ConditionType, FlagChangesDto, FlagDto, Partition, CONTROL};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::error::{Result, RolloutError};
use crate::http::{AuthResponseDto, RolloutApi};

#[derive(Deserialize)]
#[serde(untagged)]
enum LocalFile {
	Changes(FlagChangesDto),
	Flags(BTreeMap<String, LocalEntry>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocalEntry {
	Treatment(String),
	Rule(LocalRule),
	Rules(Vec<LocalRule>),
}

#[derive(Deserialize)]
struct LocalRule {
	treatment: String,
	#[serde(default, deserialize_with = "one_or_many")]
	keys: Vec<String>,
	#[serde(default)]
	config: Option<String>,
}

/// YAML files: `- flag_name: {treatment, keys, config}` per rule.
type YamlFile = Vec<BTreeMap<String, LocalRule>>;

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Keys {
		One(String),
		Many(Vec<String>),
	}

	Ok(match Keys::deserialize(deserializer)? {
		Keys::One(key) => vec![key],
		Keys::Many(keys) => keys,
	})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
	Json,
	Yaml,
}

impl FileFormat {
	fn for_path(path: &Path) -> Self {
		let extension = path
			.extension()
			.and_then(|e| e.to_str())
			.map(str::to_ascii_lowercase);
		match extension.as_deref() {
			Some("yaml" | "yml") => FileFormat::Yaml,
			_ => FileFormat::Json,
		}
	}
}

#[derive(Default)]
struct LocalState {
	contents: Option<String>,
	version: i64,
	known: BTreeSet<String>,
}

/// [`crate::http::RolloutApi`] backed by a local file.
///
/// Every content change bumps a version that is used as the change number
/// of all flags, so reloads always supersede the cache.
pub struct LocalhostApi {
	path: PathBuf,
	format: FileFormat,
	state: Mutex<LocalState>,
}

impl LocalhostApi {
	/// The file format follows the extension: YAML for `.yaml`/`.yml`, JSON
	/// otherwise.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		Self {
			format: FileFormat::for_path(&path),
			path,
			state: Mutex::new(LocalState::default()),
		}
	}

	fn parse(&self, contents: &str) -> Result<Vec<FlagDto>> {
		match self.format {
			FileFormat::Json => parse_json(contents),
			FileFormat::Yaml => parse_yaml(contents),
		}
	}
}

fn parse_json(contents: &str) -> Result<Vec<FlagDto>> {
	let file: LocalFile = serde_json::from_str(contents)
		.map_err(|e| RolloutError::ParseFailed(format!("localhost file: {e}")))?;
	Ok(match file {
		LocalFile::Changes(changes) => changes.splits,
		LocalFile::Flags(flags) => flags
			.into_iter()
			.map(|(name, entry)| flag_from_entry(name, entry))
			.collect(),
	})
}

fn parse_yaml(contents: &str) -> Result<Vec<FlagDto>> {
	let entries: YamlFile = serde_yaml::from_str(contents)
		.map_err(|e| RolloutError::ParseFailed(format!("localhost yaml file: {e}")))?;

	let mut rules: BTreeMap<String, Vec<LocalRule>> = BTreeMap::new();
	for entry in entries {
		if entry.len() != 1 {
			return Err(RolloutError::ParseFailed(format!(
				"localhost yaml file: expected one flag per entry, found {}",
				entry.len()
			)));
		}
		for (name, rule) in entry {
			if name.trim().is_empty() {
				return Err(RolloutError::ParseFailed(
					"localhost yaml file: entry without a flag name".to_string(),
				));
			}
			rules.entry(name).or_default().push(rule);
		}
	}
	Ok(rules
		.into_iter()
		.map(|(name, rules)| flag_from_entry(name, LocalEntry::Rules(rules)))
		.collect())
}

#[async_trait]
impl RolloutApi for LocalhostApi {
	async fn fetch_flag_changes(&self, since: i64) -> Result<FlagChangesDto> {
		let contents = tokio::fs::read_to_string(&self.path).await?;
		let flags = self.parse(&contents)?;

		let mut state = self.state.lock();
		if state.contents.as_deref() != Some(contents.as_str()) {
			state.version += 1;
			state.contents = Some(contents);
			info!(
				path = %self.path.display(),
				version = state.version,
				flags = flags.len(),
				"Loaded localhost flags"
			);
		}
		let version = state.version;
		if since >= version {
			return Ok(FlagChangesDto {
				splits: Vec::new(),
				since,
				till: since,
			});
		}

		let current: BTreeSet<String> = flags.iter().map(|f| f.name.clone()).collect();
		let archived: Vec<FlagDto> = state
			.known
			.difference(&current)
			.map(|name| archived_flag(name, version))
			.collect();
		state.known.extend(current);
		debug!(version, archived = archived.len(), "Serving localhost flags");

		let splits = flags
			.into_iter()
			.map(|mut flag| {
				flag.change_number = version;
				flag
			})
			.chain(archived)
			.collect();
		Ok(FlagChangesDto {
			splits,
			since,
			till: version,
		})
	}

	async fn fetch_memberships(&self, _matching_key: &str) -> Result<Vec<String>> {
		Ok(Vec::new())
	}

	async fn authenticate(&self, _matching_keys: &[String]) -> Result<AuthResponseDto> {
		Ok(AuthResponseDto {
			push_enabled: false,
			token: None,
		})
	}
}

fn flag_from_entry(name: String, entry: LocalEntry) -> FlagDto {
	let rules = match entry {
		LocalEntry::Treatment(treatment) => vec![LocalRule {
			treatment,
			keys: Vec::new(),
			config: None,
		}],
		LocalEntry::Rule(rule) => vec![rule],
		LocalEntry::Rules(rules) => rules,
	};

	// A later config for the same treatment replaces an earlier one.
	let configurations: BTreeMap<String, String> = rules
		.iter()
		.filter_map(|r| Some((r.treatment.clone(), r.config.clone()?)))
		.collect();

	let (keyed, keyless): (Vec<_>, Vec<_>) = rules.into_iter().partition(|r| !r.keys.is_empty());
	let default_treatment = keyless
		.first()
		.map(|r| r.treatment.clone())
		.unwrap_or_else(|| CONTROL.to_string());

	let mut conditions: Vec<ConditionDto> = keyed
		.into_iter()
		.map(|rule| {
			condition(
				ConditionType::Whitelist,
				"whitelisted",
				rule.treatment,
				MatcherDto {
					key_selector: None,
					matcher_type: "WHITELIST".to_string(),
					negate: false,
					whitelist_matcher_data: Some(WhitelistDataDto { whitelist: rule.keys }),
					unary_numeric_matcher_data: None,
					user_defined_segment_matcher_data: None,
				},
			)
		})
		.collect();
	if let Some(rule) = keyless.into_iter().next() {
		conditions.push(condition(
			ConditionType::Rollout,
			"default rule",
			rule.treatment,
			MatcherDto {
				key_selector: None,
				matcher_type: "ALL_KEYS".to_string(),
				negate: false,
				whitelist_matcher_data: None,
				unary_numeric_matcher_data: None,
				user_defined_segment_matcher_data: None,
			},
		));
	}

	FlagDto {
		name,
		killed: false,
		default_treatment,
		change_number: 0,
		status: FlagStatus::Active,
		traffic_allocation: 100,
		traffic_allocation_seed: 0,
		seed: 0,
		conditions,
		configurations: (!configurations.is_empty()).then_some(configurations),
	}
}

fn condition(condition_type: ConditionType, label: &str, treatment: String, matcher: MatcherDto) -> ConditionDto {
	ConditionDto {
		condition_type,
		label: label.to_string(),
		partitions: vec![Partition { treatment, size: 100 }],
		matcher_group: MatcherGroupDto {
			combiner: Some(Combiner::And),
			matchers: vec![matcher],
		},
	}
}

fn archived_flag(name: &str, version: i64) -> FlagDto {
	FlagDto {
		name: name.to_string(),
		killed: false,
		default_treatment: CONTROL.to_string(),
		change_number: version,
		status: FlagStatus::Archived,
		traffic_allocation: 100,
		traffic_allocation_seed: 0,
		seed: 0,
		conditions: Vec::new(),
		configurations: None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_rollout_core::{Attributes, Evaluator, FlagChangeSet, FlagDefinition, Key, NoSegments};
	use std::io::Write;

	fn write(file: &mut tempfile::NamedTempFile, contents: &str) {
		let handle = file.as_file_mut();
		handle.set_len(0).unwrap();
		std::io::Seek::rewind(handle).unwrap();
		handle.write_all(contents.as_bytes()).unwrap();
		handle.flush().unwrap();
	}

	fn definitions(dto: FlagChangesDto) -> Vec<FlagDefinition> {
		let (set, skipped) = FlagChangeSet::from_dto(dto);
		assert!(skipped.is_empty());
		set.active
	}

	fn treatment(flag: &FlagDefinition, key: &str) -> String {
		Evaluator::default()
			.evaluate_definition(flag, &Key::new(key), &Attributes::new(), &NoSegments)
			.treatment
	}

	#[tokio::test]
	async fn map_form_builds_whitelists_and_default() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write(
			&mut file,
			r#"{
				"simple": "on",
				"targeted": [{"treatment": "on", "keys": ["alice"]}, {"treatment": "off"}],
				"keys_only": {"treatment": "beta", "keys": ["bob"]}
			}"#,
		);
		let api = LocalhostApi::new(file.path());

		let changes = api.fetch_flag_changes(-1).await.unwrap();
		assert_eq!(changes.till, 1);
		let flags = definitions(changes);
		let by_name = |name: &str| flags.iter().find(|f| f.name == name).unwrap().clone();

		assert_eq!(treatment(&by_name("simple"), "anyone"), "on");
		assert_eq!(treatment(&by_name("targeted"), "alice"), "on");
		assert_eq!(treatment(&by_name("targeted"), "carol"), "off");
		assert_eq!(treatment(&by_name("keys_only"), "bob"), "beta");
		assert_eq!(treatment(&by_name("keys_only"), "carol"), CONTROL);
	}

	#[tokio::test]
	async fn unchanged_file_reports_no_changes() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write(&mut file, r#"{"a": "on"}"#);
		let api = LocalhostApi::new(file.path());

		let first = api.fetch_flag_changes(-1).await.unwrap();
		let second = api.fetch_flag_changes(first.till).await.unwrap();
		assert!(second.splits.is_empty());
		assert_eq!(second.till, first.till);
	}

	#[tokio::test]
	async fn edits_bump_version_and_archive_removed_flags() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write(&mut file, r#"{"a": "on", "b": "on"}"#);
		let api = LocalhostApi::new(file.path());
		api.fetch_flag_changes(-1).await.unwrap();

		write(&mut file, r#"{"a": "off"}"#);
		let changes = api.fetch_flag_changes(1).await.unwrap();
		assert_eq!(changes.till, 2);

		let (set, _) = FlagChangeSet::from_dto(changes);
		assert_eq!(set.active.len(), 1);
		assert_eq!(set.active[0].change_number, 2);
		assert_eq!(set.archived.len(), 1);
		assert_eq!(set.archived[0].name, "b");
	}

	#[tokio::test]
	async fn accepts_flag_changes_shape() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write(
			&mut file,
			r#"{"splits": [{"name": "f", "defaultTreatment": "on", "changeNumber": 99}], "since": -1, "till": 99}"#,
		);
		let api = LocalhostApi::new(file.path());
		let flags = definitions(api.fetch_flag_changes(-1).await.unwrap());
		assert_eq!(flags.len(), 1);
		assert_eq!(flags[0].change_number, 1);
	}

	#[tokio::test]
	async fn missing_or_invalid_file_is_an_error() {
		let api = LocalhostApi::new("/definitely/not/here.json");
		assert!(matches!(api.fetch_flag_changes(-1).await, Err(RolloutError::Io(_))));

		let mut file = tempfile::NamedTempFile::new().unwrap();
		write(&mut file, "[1, 2");
		let api = LocalhostApi::new(file.path());
		assert!(matches!(
			api.fetch_flag_changes(-1).await,
			Err(RolloutError::ParseFailed(_))
		));
	}

	#[tokio::test]
	async fn never_streams_and_has_no_segments() {
		let api = LocalhostApi::new("unused.json");
		assert!(!api.authenticate(&[]).await.unwrap().push_enabled);
		assert!(api.fetch_memberships("user").await.unwrap().is_empty());
	}

	fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
		let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
		write(&mut file, contents);
		file
	}

	const YAML_FLAGS: &str = r#"
- split_0:
    treatment: "off"
    config: "{ \"size\" : 20 }"
- split_1:
    treatment: "on"
- my_feature:
    treatment: "on"
    keys: "key"
    config: "{\"desc\" : \"this applies only to ON treatment\"}"
- my_feature:
    treatment: "white"
    keys: ["key2", "key3"]
- x_feature:
    treatment: "on"
- x_feature:
    treatment: "off"
    keys: ["only_key"]
    config: "{\"desc\" : \"only_key gets OFF\"}"
- other_feature:
    treatment: "on"
    keys: ["key_1", "key_2"]
"#;

	#[tokio::test]
	async fn yaml_entries_build_rules_and_configs() {
		let file = yaml_file(YAML_FLAGS);
		let api = LocalhostApi::new(file.path());
		let flags = definitions(api.fetch_flag_changes(-1).await.unwrap());
		assert_eq!(flags.len(), 5);
		let by_name = |name: &str| flags.iter().find(|f| f.name == name).unwrap().clone();

		let split_0 = by_name("split_0");
		assert_eq!(split_0.default_treatment, "off");
		assert_eq!(treatment(&split_0, "anyone"), "off");
		assert_eq!(
			split_0.configurations.get("off").map(String::as_str),
			Some(r#"{ "size" : 20 }"#)
		);
		assert!(by_name("split_1").configurations.is_empty());

		let my_feature = by_name("my_feature");
		assert_eq!(treatment(&my_feature, "key"), "on");
		assert_eq!(treatment(&my_feature, "key3"), "white");
		assert_eq!(treatment(&my_feature, "someone"), CONTROL);
		let result = Evaluator::default().evaluate_definition(
			&my_feature,
			&Key::new("key"),
			&Attributes::new(),
			&NoSegments,
		);
		assert_eq!(
			result.config.as_deref(),
			Some(r#"{"desc" : "this applies only to ON treatment"}"#)
		);

		let x_feature = by_name("x_feature");
		assert_eq!(treatment(&x_feature, "only_key"), "off");
		assert_eq!(treatment(&x_feature, "other"), "on");
		assert!(x_feature.configurations.contains_key("off"));

		let other = by_name("other_feature");
		assert_eq!(treatment(&other, "key_2"), "on");
		assert_eq!(treatment(&other, "key_3"), CONTROL);
	}

	#[tokio::test]
	async fn invalid_yaml_is_a_parse_error() {
		let cases = [
			"this is: not: valid yaml: [",
			"- split_0:\n    keys: [\"a\"]\n",
			"- split_0:\n    treatment: \"on\"\n  split_1:\n    treatment: \"off\"\n",
			"- \"\":\n    treatment: \"on\"\n",
		];
		for contents in cases {
			let file = yaml_file(contents);
			let api = LocalhostApi::new(file.path());
			assert!(
				matches!(api.fetch_flag_changes(-1).await, Err(RolloutError::ParseFailed(_))),
				"{contents}"
			);
		}
	}

	#[test]
	fn format_follows_extension() {
		assert_eq!(FileFormat::for_path(Path::new("flags.yaml")), FileFormat::Yaml);
		assert_eq!(FileFormat::for_path(Path::new("flags.YML")), FileFormat::Yaml);
		assert_eq!(FileFormat::for_path(Path::new("flags.json")), FileFormat::Json);
		assert_eq!(FileFormat::for_path(Path::new("flags")), FileFormat::Json);
	}

	#[tokio::test]
	async fn json_rules_accept_single_key_and_config() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write(
			&mut file,
			r#"{"f": [{"treatment": "on", "keys": "alice", "config": "{}"}, {"treatment": "off"}]}"#,
		);
		let api = LocalhostApi::new(file.path());
		let flags = definitions(api.fetch_flag_changes(-1).await.unwrap());
		assert_eq!(treatment(&flags[0], "alice"), "on");
		assert_eq!(treatment(&flags[0], "bob"), "off");
		assert_eq!(flags[0].configurations.get("on").map(String::as_str), Some("{}"));
	}
}
