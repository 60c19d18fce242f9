mod client;
mod config;
mod daemon;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Desired-state process supervisor")]
struct Cli {
	/// Global config file (default: $XDG_CONFIG_HOME/warden/config.toml)
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Run the supervisor in the foreground
	Run,
	/// Show status of this node and its child nodes
	#[command(alias = "st")]
	Status,
	/// Start a server (restarts it if already running)
	Start {
		#[arg(allow_hyphen_values = true)]
		id: String,
	},
	/// Restart a server; `-1` restarts the supervisor
	Reboot {
		#[arg(allow_hyphen_values = true)]
		id: String,
	},
	/// Stop a server and keep it stopped; `-1` stops the supervisor
	Kill {
		#[arg(allow_hyphen_values = true)]
		id: String,
	},
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let config_path = cli.config.unwrap_or_else(config::default_config_path);

	let result = match cli.command {
		Commands::Run => daemon::run(&config_path).await.map_err(|e| e.to_string()),
		Commands::Status => client::cmd_status(&config::load_global_config(&config_path)).await,
		Commands::Start { id } => client::cmd_command(&config::load_global_config(&config_path), "start", &id).await,
		Commands::Reboot { id } => client::cmd_command(&config::load_global_config(&config_path), "reboot", &id).await,
		Commands::Kill { id } => client::cmd_command(&config::load_global_config(&config_path), "kill", &id).await,
	};

	if let Err(e) = result {
		eprintln!("error: {}", e);
		std::process::exit(1);
	}
}
