use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Reserved id for the supervisor process itself.
pub const SELF_ID: &str = "-1";

/// One entry of the desired-server list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
	#[serde(deserialize_with = "id_string")]
	pub id: String,
	pub command: String,
	#[serde(default)]
	pub filename: Option<String>,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub working_directory: Option<PathBuf>,
	#[serde(default)]
	pub run_as_user: Option<String>,
	#[serde(default)]
	pub priority: Option<i32>,
	#[serde(default)]
	pub non_stoppable: bool,
	#[serde(default)]
	pub env: HashMap<String, String>,
	/// Fields we don't interpret; carried through to status entries.
	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_json::Value>,
}

impl ServerSpec {
	pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			command: command.into(),
			filename: None,
			args: Vec::new(),
			working_directory: None,
			run_as_user: None,
			priority: None,
			non_stoppable: false,
			env: HashMap::new(),
			extra: BTreeMap::new(),
		}
	}

	pub fn working_dir(&self, base_dir: &Path) -> PathBuf {
		match &self.working_directory {
			Some(dir) if dir.is_absolute() => dir.clone(),
			Some(dir) => base_dir.join(dir),
			None => base_dir.to_path_buf(),
		}
	}

	/// `filename` followed by `args`.
	pub fn argv(&self) -> Vec<String> {
		self.filename.iter().cloned().chain(self.args.iter().cloned()).collect()
	}

	/// Extra fields to copy into a status entry. Keys the entry reports
	/// itself are dropped so a list can't shadow live state.
	pub fn status_extra(&self) -> BTreeMap<String, serde_json::Value> {
		self.extra
			.iter()
			.filter(|(key, _)| !STATUS_KEYS.contains(&key.as_str()))
			.map(|(key, value)| (key.clone(), value.clone()))
			.collect()
	}
}

/// Rejects lists with duplicate ids or the reserved supervisor id.
pub fn validate_specs(specs: &[ServerSpec]) -> Result<()> {
	let mut seen = HashSet::new();
	for spec in specs {
		if spec.id == SELF_ID {
			return Err(Error::InvalidConfig(format!("server id {} is reserved", SELF_ID)));
		}
		if !seen.insert(spec.id.as_str()) {
			return Err(Error::InvalidConfig(format!("duplicate server id: {}", spec.id)));
		}
	}
	Ok(())
}

/// Whether processes owned by `user` run behind the privilege-dropping wrapper
/// and are therefore torn down as a whole process group.
pub fn drops_privileges(user: Option<&str>) -> bool {
	matches!(user, Some(u) if !u.is_empty() && u != "root")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GoalState {
	Running,
	Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CurrentState {
	Starting,
	Running,
	Stopped,
}

/// Connection parameters for a child node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSpec {
	#[serde(deserialize_with = "id_string")]
	pub id: String,
	pub hostname: String,
	pub port: u16,
	#[serde(default = "default_peer_path")]
	pub path: String,
}

fn default_peer_path() -> String {
	"/ws".to_string()
}

impl PeerSpec {
	pub fn new(id: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
		Self {
			id: id.into(),
			hostname: hostname.into(),
			port,
			path: default_peer_path(),
		}
	}

	pub fn url(&self) -> String {
		let path = if self.path.starts_with('/') {
			self.path.clone()
		} else {
			format!("/{}", self.path)
		};
		format!("ws://{}:{}{}", self.hostname, self.port, path)
	}
}

pub fn validate_peers(peers: &[PeerSpec]) -> Result<()> {
	let mut seen = HashSet::new();
	for peer in peers {
		if !seen.insert(peer.id.as_str()) {
			return Err(Error::InvalidConfig(format!("duplicate peer id: {}", peer.id)));
		}
	}
	Ok(())
}

/// Wire names of the fields `StatusEntry` serializes itself.
const STATUS_KEYS: &[&str] = &[
	"id",
	"command",
	"filename",
	"args",
	"workingDirectory",
	"runAsUser",
	"priority",
	"nonStoppable",
	"goalState",
	"currentState",
	"startTime",
	"endTime",
	"pid",
];

/// Read-only view of one supervised process, as reported by `get`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
	pub id: String,
	pub command: String,
	#[serde(default)]
	pub filename: Option<String>,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub working_directory: Option<String>,
	#[serde(default)]
	pub run_as_user: Option<String>,
	#[serde(default)]
	pub priority: Option<i32>,
	#[serde(default)]
	pub non_stoppable: bool,
	pub goal_state: GoalState,
	pub current_state: CurrentState,
	#[serde(default)]
	pub start_time: Option<DateTime<Utc>>,
	#[serde(default)]
	pub end_time: Option<DateTime<Utc>>,
	#[serde(default)]
	pub pid: Option<u32>,
	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_json::Value>,
}

impl StatusEntry {
	pub fn is_running(&self) -> bool {
		self.current_state == CurrentState::Running
	}
}

/// Renders `path` relative to `base` when it lives underneath it.
pub fn display_path(path: &Path, base: &Path) -> String {
	match path.strip_prefix(base) {
		Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
		Ok(rel) => rel.to_string_lossy().to_string(),
		Err(_) => path.to_string_lossy().to_string(),
	}
}

/// Ids appear as strings or bare integers in hand-written lists.
fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum RawId {
		Text(String),
		Int(i64),
	}

	Ok(match RawId::deserialize(deserializer)? {
		RawId::Text(s) => s,
		RawId::Int(n) => n.to_string(),
	})
}

pub(crate) fn optional_id_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum RawId {
		Text(String),
		Int(i64),
	}

	Ok(Option::<RawId>::deserialize(deserializer)?.map(|raw| match raw {
		RawId::Text(s) => s,
		RawId::Int(n) => n.to_string(),
	}))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spec_accepts_numeric_id_and_keeps_extra_fields() {
		let spec: ServerSpec = serde_json::from_str(
			r#"{"id": 7, "command": "node", "filename": "web.js", "label": "frontend"}"#,
		)
		.unwrap();
		assert_eq!(spec.id, "7");
		assert_eq!(spec.argv(), vec!["web.js".to_string()]);
		assert_eq!(spec.extra.get("label"), Some(&serde_json::json!("frontend")));
	}

	#[test]
	fn status_extra_drops_fields_the_entry_owns() {
		let spec: ServerSpec = serde_json::from_str(
			r#"{"id": "web", "command": "node", "label": "frontend",
				"pid": 7, "goalState": "stopped", "currentState": "running",
				"startTime": "2020-01-01T00:00:00Z", "endTime": null}"#,
		)
		.unwrap();
		assert!(spec.extra.contains_key("pid"));

		let extra = spec.status_extra();
		assert_eq!(extra.len(), 1);
		assert_eq!(extra.get("label"), Some(&serde_json::json!("frontend")));

		let entry = StatusEntry {
			id: spec.id.clone(),
			command: spec.command.clone(),
			filename: None,
			args: Vec::new(),
			working_directory: None,
			run_as_user: None,
			priority: None,
			non_stoppable: false,
			goal_state: GoalState::Running,
			current_state: CurrentState::Starting,
			start_time: None,
			end_time: None,
			pid: Some(4242),
			extra,
		};
		let json = serde_json::to_string(&entry).unwrap();
		assert_eq!(json.matches("\"pid\"").count(), 1);
		assert_eq!(json.matches("\"goalState\"").count(), 1);
		let back: StatusEntry = serde_json::from_str(&json).unwrap();
		assert_eq!(back.pid, Some(4242));
		assert_eq!(back.goal_state, GoalState::Running);
		assert_eq!(back.current_state, CurrentState::Starting);
	}

	#[test]
	fn working_dir_resolves_against_base() {
		let base = Path::new("/srv/app");
		let mut spec = ServerSpec::new("a", "true");
		assert_eq!(spec.working_dir(base), PathBuf::from("/srv/app"));
		spec.working_directory = Some("api".into());
		assert_eq!(spec.working_dir(base), PathBuf::from("/srv/app/api"));
		spec.working_directory = Some("/opt/other".into());
		assert_eq!(spec.working_dir(base), PathBuf::from("/opt/other"));
	}

	#[test]
	fn validate_rejects_duplicates_and_reserved_id() {
		let ok = vec![ServerSpec::new("a", "true"), ServerSpec::new("b", "true")];
		assert!(validate_specs(&ok).is_ok());

		let dup = vec![ServerSpec::new("a", "true"), ServerSpec::new("a", "false")];
		assert!(validate_specs(&dup).is_err());

		let reserved = vec![ServerSpec::new(SELF_ID, "true")];
		assert!(validate_specs(&reserved).is_err());
	}

	#[test]
	fn privilege_drop_only_for_named_non_root_users() {
		assert!(drops_privileges(Some("www-data")));
		assert!(!drops_privileges(Some("root")));
		assert!(!drops_privileges(Some("")));
		assert!(!drops_privileges(None));
	}

	#[test]
	fn peer_url_normalises_path() {
		let mut peer = PeerSpec::new("east", "10.0.0.2", 13369);
		assert_eq!(peer.url(), "ws://10.0.0.2:13369/ws");
		peer.path = "supervisor/ws".into();
		assert_eq!(peer.url(), "ws://10.0.0.2:13369/supervisor/ws");
	}

	#[test]
	fn display_path_is_relative_under_base() {
		let base = Path::new("/srv/app");
		assert_eq!(display_path(Path::new("/srv/app"), base), ".");
		assert_eq!(display_path(Path::new("/srv/app/api"), base), "api");
		assert_eq!(display_path(Path::new("/opt/x"), base), "/opt/x");
	}
}
