use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::Result;
use crate::types::{validate_peers, PeerSpec, StatusEntry};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A pending `get` against a child node; answered with its entries.
pub type StatusRequest = oneshot::Sender<Vec<StatusEntry>>;

/// Opens links to child nodes. The WebSocket implementation lives in
/// [`crate::peer`]; tests substitute their own.
pub trait Connector: Send + Sync {
	fn connect(&self, peer: &PeerSpec) -> Result<PeerConnection>;
}

/// Owning side of a child-node link. Dropping it closes the link.
#[derive(Debug)]
pub struct PeerConnection {
	serial: u64,
	handle: PeerHandle,
	close: watch::Sender<bool>,
}

/// Transport side of a link, driven by whatever task talks to the child.
pub struct PeerEndpoint {
	pub requests: mpsc::UnboundedReceiver<StatusRequest>,
	pub connected: watch::Sender<bool>,
	pub close: watch::Receiver<bool>,
}

/// Cheap clone used to query a child without holding the registry.
#[derive(Debug, Clone)]
pub struct PeerHandle {
	requests: mpsc::UnboundedSender<StatusRequest>,
	connected: watch::Receiver<bool>,
}

impl PeerConnection {
	pub fn channel() -> (PeerConnection, PeerEndpoint) {
		let (req_tx, req_rx) = mpsc::unbounded_channel();
		let (connected_tx, connected_rx) = watch::channel(false);
		let (close_tx, close_rx) = watch::channel(false);
		let connection = PeerConnection {
			serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
			handle: PeerHandle {
				requests: req_tx,
				connected: connected_rx,
			},
			close: close_tx,
		};
		let endpoint = PeerEndpoint {
			requests: req_rx,
			connected: connected_tx,
			close: close_rx,
		};
		(connection, endpoint)
	}

	/// Unique per opened connection; tells a preserved link from a recreated one.
	pub fn serial(&self) -> u64 {
		self.serial
	}

	pub fn handle(&self) -> PeerHandle {
		self.handle.clone()
	}

	pub fn disconnect(&self) {
		let _ = self.close.send(true);
	}
}

impl Drop for PeerConnection {
	fn drop(&mut self) {
		self.disconnect();
	}
}

impl PeerHandle {
	pub fn is_connected(&self) -> bool {
		*self.connected.borrow()
	}

	/// Asks the child for its status. A link that is down, or drops while the
	/// request is in flight, yields nothing.
	pub async fn request_status(&self) -> Vec<StatusEntry> {
		if !self.is_connected() {
			return Vec::new();
		}
		let (tx, rx) = oneshot::channel();
		if self.requests.send(tx).is_err() {
			return Vec::new();
		}
		rx.await.unwrap_or_default()
	}
}

#[derive(Debug)]
pub struct ChildNode {
	pub spec: PeerSpec,
	pub connection: Option<PeerConnection>,
}

/// One [`ChildNode`] per configured peer id, kept in id order.
pub struct ChildNodeRegistry {
	connector: Arc<dyn Connector>,
	nodes: BTreeMap<String, ChildNode>,
}

impl ChildNodeRegistry {
	pub fn new(connector: Arc<dyn Connector>) -> Self {
		Self {
			connector,
			nodes: BTreeMap::new(),
		}
	}

	/// Brings the node set in line with `peers`. Existing nodes keep their live
	/// connection even when their parameters change; nodes without one get a
	/// fresh attempt. A failed connect leaves the node disconnected until the
	/// next reconciliation.
	pub fn reconcile(&mut self, peers: Vec<PeerSpec>) -> Result<()> {
		validate_peers(&peers)?;

		self.nodes.retain(|id, node| {
			let keep = peers.iter().any(|p| &p.id == id);
			if !keep {
				if let Some(connection) = &node.connection {
					connection.disconnect();
				}
				tracing::info!(node = %id, "child node removed");
			}
			keep
		});

		for peer in peers {
			match self.nodes.get_mut(&peer.id) {
				Some(node) => {
					node.spec = peer;
					if node.connection.is_none() {
						node.connection = open(self.connector.as_ref(), &node.spec);
					}
				}
				None => {
					let connection = open(self.connector.as_ref(), &peer);
					tracing::info!(node = %peer.id, url = %peer.url(), "child node added");
					self.nodes.insert(peer.id.clone(), ChildNode { spec: peer, connection });
				}
			}
		}
		Ok(())
	}

	pub fn get(&self, id: &str) -> Option<&ChildNode> {
		self.nodes.get(id)
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn serials(&self) -> Vec<(String, Option<u64>)> {
		self.nodes
			.iter()
			.map(|(id, node)| (id.clone(), node.connection.as_ref().map(PeerConnection::serial)))
			.collect()
	}

	/// Query handles for every node that has a connection object, in id order.
	pub fn handles(&self) -> Vec<(String, PeerHandle)> {
		self.nodes
			.iter()
			.filter_map(|(id, node)| node.connection.as_ref().map(|c| (id.clone(), c.handle())))
			.collect()
	}
}

fn open(connector: &dyn Connector, peer: &PeerSpec) -> Option<PeerConnection> {
	match connector.connect(peer) {
		Ok(connection) => Some(connection),
		Err(e) => {
			tracing::warn!(node = %peer.id, "failed to connect: {}", e);
			None
		}
	}
}
