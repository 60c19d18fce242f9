use std::net::IpAddr;
use std::sync::Arc;

use crate::aggregate::Aggregator;
use crate::error::{Error, Result};
use crate::protocol::{Command, CommandRequest, ServerEvent};
use crate::supervisor::Supervisor;

/// Turns inbound requests from either surface into supervisor or
/// aggregation calls.
#[derive(Clone)]
pub struct CommandRouter {
	supervisor: Arc<Supervisor>,
	aggregator: Arc<Aggregator>,
}

impl CommandRouter {
	pub fn new(aggregator: Arc<Aggregator>) -> Self {
		Self {
			supervisor: aggregator.supervisor().clone(),
			aggregator,
		}
	}

	pub fn aggregator(&self) -> &Arc<Aggregator> {
		&self.aggregator
	}

	pub fn supervisor(&self) -> &Arc<Supervisor> {
		&self.supervisor
	}

	/// Only loopback peers may issue commands. IPv4-mapped IPv6 addresses
	/// count as their IPv4 form.
	pub fn authorize(origin: IpAddr) -> Result<()> {
		if origin.to_canonical().is_loopback() {
			Ok(())
		} else {
			tracing::warn!(origin = %origin, "rejected request from non-loopback address");
			Err(Error::Unauthorized(origin))
		}
	}

	pub fn parse(request: &CommandRequest) -> Result<Command> {
		let with_id = |ctor: fn(String) -> Command| match &request.id {
			Some(id) => Ok(ctor(id.clone())),
			None => Err(Error::MissingId(request.event.clone())),
		};
		match request.event.as_str() {
			"start" => with_id(Command::Start),
			"reboot" => with_id(Command::Reboot),
			"kill" => with_id(Command::Kill),
			"get" => Ok(Command::Get),
			other => Err(Error::UnknownCommand(other.to_string())),
		}
	}

	/// Authorizes, parses and runs one request. `caller` is recorded in the
	/// audit log and nowhere else.
	pub async fn dispatch(&self, origin: IpAddr, caller: &str, request: CommandRequest) -> Result<ServerEvent> {
		Self::authorize(origin)?;
		let command = Self::parse(&request)?;

		match &command {
			Command::Get => tracing::debug!(caller, origin = %origin, "get"),
			_ => tracing::info!(
				caller,
				origin = %origin,
				id = command.id().unwrap_or_default(),
				"{}",
				command.name()
			),
		}

		match command {
			Command::Start(id) | Command::Reboot(id) => {
				self.supervisor.reboot(&id).await?;
				Ok(ServerEvent::Ok {
					command: request.event,
					id: Some(id),
				})
			}
			Command::Kill(id) => {
				self.supervisor.kill(&id).await?;
				Ok(ServerEvent::Ok {
					command: request.event,
					id: Some(id),
				})
			}
			Command::Get => Ok(ServerEvent::Status {
				entries: self.aggregator.aggregated_status().await,
			}),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::{Ipv4Addr, Ipv6Addr};

	#[test]
	fn loopback_only() {
		assert!(CommandRouter::authorize(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_ok());
		assert!(CommandRouter::authorize(IpAddr::V6(Ipv6Addr::LOCALHOST)).is_ok());
		let mapped = Ipv4Addr::LOCALHOST.to_ipv6_mapped();
		assert!(CommandRouter::authorize(IpAddr::V6(mapped)).is_ok());

		let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
		assert!(matches!(CommandRouter::authorize(remote), Err(Error::Unauthorized(ip)) if ip == remote));
	}

	#[test]
	fn parse_commands() {
		let parse = |event: &str, id: Option<&str>| CommandRouter::parse(&CommandRequest::new(event, id.map(String::from)));

		assert_eq!(parse("start", Some("web")).unwrap(), Command::Start("web".into()));
		assert_eq!(parse("reboot", Some("-1")).unwrap(), Command::Reboot("-1".into()));
		assert_eq!(parse("kill", Some("db")).unwrap(), Command::Kill("db".into()));
		assert_eq!(parse("get", None).unwrap(), Command::Get);
		assert!(matches!(parse("kill", None), Err(Error::MissingId(_))));
		assert!(matches!(parse("restart", Some("web")), Err(Error::UnknownCommand(c)) if c == "restart"));
	}
}
