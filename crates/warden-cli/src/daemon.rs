use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::{self, GlobalConfig};
use warden::peer::WsConnector;
use warden::source::{self, FileSource};
use warden::{Aggregator, CommandRouter, PeerSpec, ServerSpec, Supervisor};

pub async fn run(config_path: &Path) -> std::io::Result<()> {
	let global_config = config::load_global_config(config_path);
	let config_dir = config_path
		.parent()
		.map(Path::to_path_buf)
		.unwrap_or_else(config::config_dir);

	let supervisor = Supervisor::new(global_config.supervisor_config(&config_dir));
	let (peer_changes_tx, peer_changes_rx) = mpsc::unbounded_channel();
	let connector = Arc::new(WsConnector::new(peer_changes_tx, global_config.reconnect_delay()));
	let aggregator = Aggregator::new(Arc::clone(&supervisor), connector, global_config.peer_timeout());

	tokio::spawn(Arc::clone(&aggregator).run(peer_changes_rx));
	spawn_sources(&global_config, &config_dir, &supervisor, &aggregator);

	let addr = format!("{}:{}", global_config.daemon.bind, global_config.daemon.port);
	let listener = tokio::net::TcpListener::bind(&addr).await?;
	tracing::info!(
		pid = std::process::id(),
		base_dir = %supervisor.config().base_dir.display(),
		"listening on {}",
		addr
	);

	let app = warden::api::router(CommandRouter::new(aggregator));
	let mut sigterm = signal(SignalKind::terminate())?;

	tokio::select! {
		res = warden::api::serve(listener, app) => {
			if let Err(e) = &res {
				tracing::error!("HTTP server error: {}", e);
			}
		}
		_ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
		_ = sigterm.recv() => tracing::info!("terminated, shutting down"),
		_ = supervisor.terminated() => tracing::info!("terminate requested, exiting"),
	}

	supervisor.shutdown().await;
	Ok(())
}

fn spawn_sources(global_config: &GlobalConfig, config_dir: &Path, supervisor: &Arc<Supervisor>, aggregator: &Arc<Aggregator>) {
	let interval = global_config.poll_interval();

	let servers = FileSource::new(global_config.servers_path(config_dir));
	tracing::info!(path = %servers.path().display(), "watching desired server list");
	let sup = Arc::clone(supervisor);
	tokio::spawn(source::watch(servers, interval, move |specs: Vec<ServerSpec>| {
		let sup = Arc::clone(&sup);
		async move { sup.load_specs(specs).await }
	}));

	let peers = FileSource::new(global_config.peers_path(config_dir));
	tracing::info!(path = %peers.path().display(), "watching peer list");
	let agg = Arc::clone(aggregator);
	tokio::spawn(source::watch(peers, interval, move |peers: Vec<PeerSpec>| {
		let agg = Arc::clone(&agg);
		async move { agg.reconcile_peers(peers).await }
	}));
}
