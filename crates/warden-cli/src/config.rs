use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Global config (~/.config/warden/config.toml) ────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalConfig {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default)]
	pub supervisor: SupervisorSection,
	#[serde(default)]
	pub sources: SourcesConfig,
	#[serde(default)]
	pub aggregation: AggregationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	#[serde(default = "default_bind")]
	pub bind: String,
	#[serde(default = "default_port")]
	pub port: u16,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self { bind: default_bind(), port: default_port() }
	}
}

fn default_bind() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 13369 }

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
	pub base_dir: Option<PathBuf>,
	#[serde(default = "default_restart_interval")]
	pub restart_interval_ms: u64,
	#[serde(default = "default_promote_delay")]
	pub promote_delay_ms: u64,
	#[serde(default = "warden::supervisor::default_privilege_wrapper")]
	pub privilege_wrapper: Vec<String>,
}

impl Default for SupervisorSection {
	fn default() -> Self {
		Self {
			base_dir: None,
			restart_interval_ms: default_restart_interval(),
			promote_delay_ms: default_promote_delay(),
			privilege_wrapper: warden::supervisor::default_privilege_wrapper(),
		}
	}
}

fn default_restart_interval() -> u64 { 2000 }
fn default_promote_delay() -> u64 { 3000 }

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
	#[serde(default = "default_servers")]
	pub servers: PathBuf,
	#[serde(default = "default_peers")]
	pub peers: PathBuf,
	#[serde(default = "default_poll_interval")]
	pub poll_interval_ms: u64,
}

impl Default for SourcesConfig {
	fn default() -> Self {
		Self {
			servers: default_servers(),
			peers: default_peers(),
			poll_interval_ms: default_poll_interval(),
		}
	}
}

fn default_servers() -> PathBuf { "servers.json".into() }
fn default_peers() -> PathBuf { "peers.json".into() }
fn default_poll_interval() -> u64 { 1000 }

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
	/// 0 waits on a child node indefinitely.
	#[serde(default = "default_peer_timeout")]
	pub peer_timeout_ms: u64,
	#[serde(default = "default_reconnect_delay")]
	pub reconnect_delay_ms: u64,
}

impl Default for AggregationConfig {
	fn default() -> Self {
		Self {
			peer_timeout_ms: default_peer_timeout(),
			reconnect_delay_ms: default_reconnect_delay(),
		}
	}
}

fn default_peer_timeout() -> u64 { 5000 }
fn default_reconnect_delay() -> u64 { 2000 }

impl GlobalConfig {
	pub fn supervisor_config(&self, config_dir: &Path) -> warden::SupervisorConfig {
		let base_dir = match &self.supervisor.base_dir {
			Some(dir) => resolve(config_dir, dir),
			None => std::env::current_dir().unwrap_or_else(|_| config_dir.to_path_buf()),
		};
		warden::SupervisorConfig {
			base_dir,
			restart_interval: Duration::from_millis(self.supervisor.restart_interval_ms),
			promote_delay: Duration::from_millis(self.supervisor.promote_delay_ms),
			privilege_wrapper: self.supervisor.privilege_wrapper.clone(),
		}
	}

	pub fn peer_timeout(&self) -> Option<Duration> {
		match self.aggregation.peer_timeout_ms {
			0 => None,
			ms => Some(Duration::from_millis(ms)),
		}
	}

	pub fn reconnect_delay(&self) -> Duration {
		Duration::from_millis(self.aggregation.reconnect_delay_ms)
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.sources.poll_interval_ms.max(1))
	}

	pub fn servers_path(&self, config_dir: &Path) -> PathBuf {
		resolve(config_dir, &self.sources.servers)
	}

	pub fn peers_path(&self, config_dir: &Path) -> PathBuf {
		resolve(config_dir, &self.sources.peers)
	}
}

fn resolve(config_dir: &Path, path: &Path) -> PathBuf {
	if path.is_absolute() {
		path.to_path_buf()
	} else {
		config_dir.join(path)
	}
}

pub fn config_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		PathBuf::from(dir).join("warden")
	} else if let Ok(home) = std::env::var("HOME") {
		PathBuf::from(home).join(".config").join("warden")
	} else {
		PathBuf::from("/tmp").join("warden").join("config")
	}
}

pub fn default_config_path() -> PathBuf {
	config_dir().join("config.toml")
}

/// Missing or broken config falls back to defaults with a warning.
pub fn load_global_config(path: &Path) -> GlobalConfig {
	if path.exists() {
		match std::fs::read_to_string(path) {
			Ok(content) => match toml::from_str(&content) {
				Ok(config) => return config,
				Err(e) => tracing::warn!("failed to parse {}: {}", path.display(), e),
			},
			Err(e) => tracing::warn!("failed to read {}: {}", path.display(), e),
		}
	}
	GlobalConfig::default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_config_uses_defaults() {
		let config: GlobalConfig = toml::from_str("").unwrap();
		assert_eq!(config.daemon.port, 13369);
		assert_eq!(config.daemon.bind, "127.0.0.1");
		assert_eq!(config.supervisor.restart_interval_ms, 2000);
		assert_eq!(config.supervisor.privilege_wrapper[0], "sudo");
		assert_eq!(config.peer_timeout(), Some(Duration::from_secs(5)));
	}

	#[test]
	fn sections_override_and_paths_resolve() {
		let config: GlobalConfig = toml::from_str(
			r#"
			[daemon]
			port = 9000

			[supervisor]
			base_dir = "apps"
			restart_interval_ms = 500

			[sources]
			peers = "/etc/warden/peers.json"

			[aggregation]
			peer_timeout_ms = 0
			"#,
		)
		.unwrap();
		let dir = Path::new("/home/op/.config/warden");

		assert_eq!(config.daemon.port, 9000);
		assert_eq!(config.peer_timeout(), None);
		assert_eq!(config.servers_path(dir), dir.join("servers.json"));
		assert_eq!(config.peers_path(dir), PathBuf::from("/etc/warden/peers.json"));

		let sup = config.supervisor_config(dir);
		assert_eq!(sup.base_dir, dir.join("apps"));
		assert_eq!(sup.restart_interval, Duration::from_millis(500));
		assert_eq!(sup.promote_delay, Duration::from_secs(3));
	}
}
