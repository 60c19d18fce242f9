use serde::{Deserialize, Serialize};

use crate::types::{optional_id_string, StatusEntry};

/// Inbound command, as sent on the socket or assembled from an HTTP route.
///
/// The command name stays a free string so unrecognised names can be
/// answered with an `unknown command` error instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
	pub event: String,
	#[serde(default, deserialize_with = "optional_id_string", skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
}

impl CommandRequest {
	pub fn new(event: impl Into<String>, id: Option<String>) -> Self {
		Self {
			event: event.into(),
			id,
		}
	}

	pub fn get() -> Self {
		Self::new("get", None)
	}
}

/// Parsed form of a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Start(String),
	Reboot(String),
	Kill(String),
	Get,
}

impl Command {
	pub fn name(&self) -> &'static str {
		match self {
			Command::Start(_) => "start",
			Command::Reboot(_) => "reboot",
			Command::Kill(_) => "kill",
			Command::Get => "get",
		}
	}

	pub fn id(&self) -> Option<&str> {
		match self {
			Command::Start(id) | Command::Reboot(id) | Command::Kill(id) => Some(id),
			Command::Get => None,
		}
	}
}

/// Outbound frames on the socket surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
	Ok { command: String, id: Option<String> },
	Status { entries: Vec<StatusEntry> },
	StatusChanged { entries: Vec<StatusEntry> },
	Error { message: String },
}
