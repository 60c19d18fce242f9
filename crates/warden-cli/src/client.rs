use futures_util::{SinkExt, StreamExt};
use owo_colors::OwoColorize;
use tokio_tungstenite::tungstenite::Message;

use crate::config::GlobalConfig;
use warden::{CommandRequest, CurrentState, GoalState, ServerEvent, StatusEntry};

fn daemon_url(config: &GlobalConfig) -> String {
	let host = match config.daemon.bind.as_str() {
		"0.0.0.0" | "::" | "" => "127.0.0.1",
		host => host,
	};
	format!("ws://{}:{}/ws", host, config.daemon.port)
}

/// Sends one request to the local daemon and waits for its direct reply,
/// skipping any `status-changed` pushes in between.
async fn request(config: &GlobalConfig, req: &CommandRequest) -> Result<ServerEvent, String> {
	let url = daemon_url(config);
	let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.map_err(|e| format!("daemon not reachable at {}: {}", url, e))?;

	let json = serde_json::to_string(req).map_err(|e| e.to_string())?;
	socket
		.send(Message::Text(json.into()))
		.await
		.map_err(|e| e.to_string())?;

	while let Some(msg) = socket.next().await {
		let text = match msg.map_err(|e| e.to_string())? {
			Message::Text(text) => text,
			Message::Close(_) => break,
			_ => continue,
		};
		match serde_json::from_str::<ServerEvent>(text.as_str()) {
			Ok(ServerEvent::StatusChanged { .. }) => continue,
			Ok(event) => {
				let _ = socket.close(None).await;
				return Ok(event);
			}
			Err(e) => return Err(format!("unreadable reply: {}", e)),
		}
	}
	Err("daemon closed the connection".into())
}

pub async fn cmd_status(config: &GlobalConfig) -> Result<(), String> {
	match request(config, &CommandRequest::get()).await? {
		ServerEvent::Status { entries } => {
			render_status(&entries);
			Ok(())
		}
		ServerEvent::Error { message } => Err(message),
		other => Err(format!("unexpected reply: {:?}", other)),
	}
}

pub async fn cmd_command(config: &GlobalConfig, command: &str, id: &str) -> Result<(), String> {
	let req = CommandRequest::new(command, Some(id.to_string()));
	match request(config, &req).await? {
		ServerEvent::Ok { command, id } => {
			eprintln!("{} {} {}", "ok".green(), command, id.unwrap_or_default().bold());
			Ok(())
		}
		ServerEvent::Error { message } => Err(message),
		other => Err(format!("unexpected reply: {:?}", other)),
	}
}

fn render_status(entries: &[StatusEntry]) {
	let id_width = entries.iter().map(|e| e.id.len()).max().unwrap_or(0).max(2);
	for entry in entries {
		print_entry_line(entry, id_width);
	}
}

fn print_entry_line(entry: &StatusEntry, id_width: usize) {
	let (circle, label) = match (entry.current_state, entry.goal_state) {
		(CurrentState::Running, _) => ("●".green().to_string(), "on".green().to_string()),
		(CurrentState::Starting, _) => ("●".yellow().to_string(), "starting".yellow().to_string()),
		(CurrentState::Stopped, GoalState::Running) => ("●".red().to_string(), "down".red().to_string()),
		(CurrentState::Stopped, GoalState::Stopped) => ("○".dimmed().to_string(), "off".dimmed().to_string()),
	};
	let uptime = match (entry.start_time, entry.end_time) {
		(Some(start), None) => format_uptime((chrono::Utc::now() - start).num_seconds().max(0) as u64),
		_ => "-".to_string(),
	};
	let pid = entry.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
	let mut command = entry.command.clone();
	for arg in &entry.args {
		command.push(' ');
		command.push_str(arg);
	}
	println!(
		"{} {:<width$} {:<8} {:<8} {:<8} {}",
		circle,
		entry.id,
		uptime,
		pid,
		label,
		command.dimmed(),
		width = id_width
	);
}

fn format_uptime(secs: u64) -> String {
	if secs < 60 {
		format!("{}s", secs)
	} else if secs < 3600 {
		format!("{}m", secs / 60)
	} else if secs < 86400 {
		format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
	} else {
		format!("{}d{}h", secs / 86400, (secs % 86400) / 3600)
	}
}
