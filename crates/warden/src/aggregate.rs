use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::error::Result;
use crate::registry::{ChildNodeRegistry, Connector};
use crate::supervisor::Supervisor;
use crate::types::{PeerSpec, StatusEntry};

/// Merges local status with the status of every connected child node and
/// pushes the result to subscribers whenever something changes.
pub struct Aggregator {
	supervisor: Arc<Supervisor>,
	registry: Mutex<ChildNodeRegistry>,
	peer_timeout: Option<Duration>,
	updates: broadcast::Sender<Vec<StatusEntry>>,
}

impl Aggregator {
	/// `peer_timeout` bounds how long a `get` waits on any one child. With
	/// `None` a child that never answers stalls the whole call.
	pub fn new(supervisor: Arc<Supervisor>, connector: Arc<dyn Connector>, peer_timeout: Option<Duration>) -> Arc<Self> {
		let (updates, _) = broadcast::channel(64);
		Arc::new(Self {
			supervisor,
			registry: Mutex::new(ChildNodeRegistry::new(connector)),
			peer_timeout,
			updates,
		})
	}

	pub fn supervisor(&self) -> &Arc<Supervisor> {
		&self.supervisor
	}

	/// Aggregated status pushes (`status-changed`).
	pub fn subscribe(&self) -> broadcast::Receiver<Vec<StatusEntry>> {
		self.updates.subscribe()
	}

	pub async fn aggregated_status(&self) -> Vec<StatusEntry> {
		let local = self.supervisor.snapshot(true).await;
		self.merge(local).await
	}

	/// Appends every connected child's entries to `local`, ids prefixed with
	/// the node id. Children are queried in parallel; results keep node order.
	async fn merge(&self, mut local: Vec<StatusEntry>) -> Vec<StatusEntry> {
		let handles = self.registry.lock().await.handles();
		if handles.is_empty() {
			return local;
		}

		let timeout = self.peer_timeout;
		let requests = handles.into_iter().map(|(node, handle)| async move {
			let entries = match timeout {
				Some(limit) => match tokio::time::timeout(limit, handle.request_status()).await {
					Ok(entries) => entries,
					Err(_) => {
						tracing::warn!(node = %node, "child node did not answer within {:?}", limit);
						Vec::new()
					}
				},
				None => handle.request_status().await,
			};
			entries
				.into_iter()
				.map(|mut entry| {
					entry.id = format!("{}:{}", node, entry.id);
					entry
				})
				.collect::<Vec<_>>()
		});

		for remote in join_all(requests).await {
			local.extend(remote);
		}
		local
	}

	/// Applies a new peer list, then re-publishes status.
	pub async fn reconcile_peers(&self, peers: Vec<PeerSpec>) -> Result<()> {
		{
			let mut registry = self.registry.lock().await;
			registry.reconcile(peers)?;
			tracing::info!(count = registry.len(), "peer list loaded");
		}
		self.publish(None).await;
		Ok(())
	}

	/// Peer ids with their current connection serial, for inspection.
	pub async fn peer_serials(&self) -> Vec<(String, Option<u64>)> {
		self.registry.lock().await.serials()
	}

	/// Pushes aggregated status to subscribers. `local` is the snapshot taken
	/// by the pass that caused the change; without one a fresh one is taken.
	pub async fn publish(&self, local: Option<Vec<StatusEntry>>) {
		let local = match local {
			Some(local) => local,
			None => self.supervisor.snapshot(true).await,
		};
		let entries = self.merge(local).await;
		let _ = self.updates.send(entries);
	}

	/// Forwards local changes and child-node notifications into [`publish`](Self::publish).
	pub async fn run(self: Arc<Self>, mut peer_changes: mpsc::UnboundedReceiver<String>) {
		let mut local_changes = self.supervisor.subscribe();
		loop {
			tokio::select! {
				change = local_changes.recv() => match change {
					Ok(snapshot) => self.publish(Some(snapshot)).await,
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						tracing::debug!(skipped, "status publisher lagged");
						self.publish(None).await;
					}
					Err(broadcast::error::RecvError::Closed) => return,
				},
				node = peer_changes.recv() => match node {
					Some(node) => {
						tracing::debug!(node = %node, "child node status changed");
						self.publish(None).await;
					}
					None => return,
				},
			}
		}
	}
}
