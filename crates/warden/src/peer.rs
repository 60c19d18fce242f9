use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};
use crate::protocol::{CommandRequest, ServerEvent};
use crate::registry::{Connector, PeerConnection, PeerEndpoint, StatusRequest};
use crate::types::PeerSpec;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Links to child nodes over their `/ws` socket.
///
/// Each link is a task that reconnects on its own until the owning
/// [`PeerConnection`] is dropped. Connects, disconnects and `status-changed`
/// pushes from the child are reported on `changes` by node id.
pub struct WsConnector {
	changes: mpsc::UnboundedSender<String>,
	reconnect_delay: Duration,
}

impl WsConnector {
	pub fn new(changes: mpsc::UnboundedSender<String>, reconnect_delay: Duration) -> Self {
		Self {
			changes,
			reconnect_delay,
		}
	}
}

impl Connector for WsConnector {
	fn connect(&self, peer: &PeerSpec) -> Result<PeerConnection> {
		let url = peer.url();
		url.as_str().into_client_request().map_err(|e| Error::Peer {
			node: peer.id.clone(),
			message: format!("bad url {}: {}", url, e),
		})?;

		let (connection, endpoint) = PeerConnection::channel();
		tokio::spawn(run_link(
			peer.id.clone(),
			url,
			endpoint,
			self.changes.clone(),
			self.reconnect_delay,
		));
		Ok(connection)
	}
}

async fn run_link(
	node: String,
	url: String,
	endpoint: PeerEndpoint,
	changes: mpsc::UnboundedSender<String>,
	reconnect_delay: Duration,
) {
	let PeerEndpoint {
		mut requests,
		connected,
		mut close,
	} = endpoint;

	loop {
		if *close.borrow() {
			return;
		}

		let attempt = tokio::select! {
			res = tokio_tungstenite::connect_async(url.as_str()) => res,
			_ = closed(&mut close) => return,
		};

		match attempt {
			Ok((socket, _)) => {
				tracing::info!(node = %node, url = %url, "connected to child node");
				connected.send_replace(true);
				let _ = changes.send(node.clone());

				let owner_closed = serve_link(&node, socket, &mut requests, &mut close, &changes).await;

				connected.send_replace(false);
				if owner_closed {
					return;
				}
				tracing::warn!(node = %node, "child node disconnected");
				let _ = changes.send(node.clone());
			}
			Err(e) => {
				tracing::debug!(node = %node, url = %url, "connect failed: {}", e);
			}
		}

		// Anything queued while the link was down gets an empty answer.
		while requests.try_recv().is_ok() {}

		tokio::select! {
			_ = tokio::time::sleep(reconnect_delay) => {}
			_ = closed(&mut close) => return,
		}
	}
}

/// Pumps one live socket. Returns true when the owner closed the link.
async fn serve_link(
	node: &str,
	socket: Socket,
	requests: &mut mpsc::UnboundedReceiver<StatusRequest>,
	close: &mut watch::Receiver<bool>,
	changes: &mpsc::UnboundedSender<String>,
) -> bool {
	let (mut sink, mut stream) = socket.split();
	let mut pending: VecDeque<StatusRequest> = VecDeque::new();
	let get = match serde_json::to_string(&CommandRequest::get()) {
		Ok(s) => s,
		Err(e) => {
			tracing::error!(node, "failed to encode request: {}", e);
			return false;
		}
	};

	loop {
		tokio::select! {
			_ = closed(close) => {
				let _ = sink.close().await;
				return true;
			}
			req = requests.recv() => {
				let Some(reply) = req else {
					return true;
				};
				if sink.send(Message::Text(get.clone().into())).await.is_err() {
					return false;
				}
				pending.push_back(reply);
			}
			msg = stream.next() => match msg {
				Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
					Ok(ServerEvent::Status { entries }) => {
						if let Some(reply) = pending.pop_front() {
							let _ = reply.send(entries);
						}
					}
					Ok(ServerEvent::StatusChanged { .. }) => {
						let _ = changes.send(node.to_string());
					}
					Ok(ServerEvent::Error { message }) => {
						tracing::warn!(node, "child node error: {}", message);
						pending.pop_front();
					}
					Ok(ServerEvent::Ok { .. }) => {}
					Err(e) => tracing::warn!(node, "unreadable frame from child node: {}", e),
				},
				Some(Ok(Message::Close(_))) | None => return false,
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					tracing::warn!(node, "socket error: {}", e);
					return false;
				}
			}
		}
	}
}

async fn closed(close: &mut watch::Receiver<bool>) {
	while !*close.borrow_and_update() {
		if close.changed().await.is_err() {
			return;
		}
	}
}
