use std::net::IpAddr;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid id: {0}")]
	InvalidId(String),

	#[error("unknown command: {0}")]
	UnknownCommand(String),

	#[error("{0}: missing id")]
	MissingId(String),

	#[error("unauthorized origin: {0}")]
	Unauthorized(IpAddr),

	#[error("failed to spawn {id}: {source}")]
	Spawn {
		id: String,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to read {}: {source}", path.display())]
	ConfigRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse {}: {source}", path.display())]
	ConfigParse {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	#[error("peer {node}: {message}")]
	Peer { node: String, message: String },
}

impl Error {
	/// Errors that are reported back to the calling client rather than only logged.
	pub fn is_command_error(&self) -> bool {
		matches!(
			self,
			Error::InvalidId(_) | Error::UnknownCommand(_) | Error::MissingId(_) | Error::Unauthorized(_)
		)
	}
}
