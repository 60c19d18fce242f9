use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use warden::peer::WsConnector;
use warden::supervisor::{Supervisor, SupervisorConfig};
use warden::*;

struct Node {
	supervisor: Arc<Supervisor>,
	aggregator: Arc<Aggregator>,
	addr: SocketAddr,
}

async fn start_node(specs: Vec<ServerSpec>) -> Node {
	let supervisor = Supervisor::new(SupervisorConfig {
		base_dir: std::env::temp_dir(),
		restart_interval: Duration::from_millis(200),
		promote_delay: Duration::from_millis(100),
		..Default::default()
	});
	let (changes_tx, changes_rx) = mpsc::unbounded_channel();
	let connector = Arc::new(WsConnector::new(changes_tx, Duration::from_millis(100)));
	let aggregator = Aggregator::new(supervisor.clone(), connector, Some(Duration::from_secs(2)));
	tokio::spawn(aggregator.clone().run(changes_rx));

	supervisor.load_specs(specs).await.unwrap();

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let app = api::router(CommandRouter::new(aggregator.clone()));
	tokio::spawn(api::serve(listener, app));

	Node {
		supervisor,
		aggregator,
		addr,
	}
}

fn sleeper(id: &str) -> ServerSpec {
	let mut spec = ServerSpec::new(id, "sleep");
	spec.args = vec!["30".into()];
	spec
}

fn ids(entries: &[StatusEntry]) -> Vec<&str> {
	entries.iter().map(|e| e.id.as_str()).collect()
}

async fn wait_for_ids(node: &Node, expected: &[&str]) -> Vec<StatusEntry> {
	let deadline = Instant::now() + Duration::from_secs(5);
	loop {
		let status = node.aggregator.aggregated_status().await;
		if ids(&status) == expected {
			return status;
		}
		assert!(Instant::now() < deadline, "status never became {:?}: {:?}", expected, ids(&status));
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

/// Two-node tree: `parent` supervises `web` and aggregates `child`, which supervises `db`.
async fn tree() -> (Node, Node) {
	let child = start_node(vec![sleeper("db")]).await;
	let parent = start_node(vec![sleeper("web")]).await;
	parent
		.aggregator
		.reconcile_peers(vec![PeerSpec::new("child", "127.0.0.1", child.addr.port())])
		.await
		.unwrap();
	wait_for_ids(&parent, &["-1", "web", "child:-1", "child:db"]).await;
	(parent, child)
}

async fn shutdown(nodes: &[&Node]) {
	for node in nodes {
		node.supervisor.shutdown().await;
	}
}

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn ws_client(addr: SocketAddr) -> Client {
	let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await.unwrap();
	socket
}

/// Sends one frame and returns the first reply that is not a status push.
async fn ws_request(socket: &mut Client, frame: &str) -> ServerEvent {
	socket.send(Message::Text(frame.to_string().into())).await.unwrap();
	loop {
		let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
			.await
			.expect("no reply")
			.expect("socket closed")
			.unwrap();
		if let Message::Text(text) = msg {
			match serde_json::from_str::<ServerEvent>(text.as_str()).unwrap() {
				ServerEvent::StatusChanged { .. } => continue,
				event => return event,
			}
		}
	}
}

async fn http(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
	let mut stream = TcpStream::connect(addr).await.unwrap();
	let request = format!(
		"{} {} HTTP/1.1\r\nHost: {}\r\nX-Forwarded-User: tester\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
		method, path, addr
	);
	stream.write_all(request.as_bytes()).await.unwrap();
	let mut raw = String::new();
	stream.read_to_string(&mut raw).await.unwrap();

	let code = raw.split_whitespace().nth(1).and_then(|c| c.parse().ok()).unwrap_or(0);
	let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();
	(code, body)
}

#[tokio::test]
async fn parent_aggregates_child_status() {
	let (parent, child) = tree().await;

	let status = parent.aggregator.aggregated_status().await;
	let db = status.iter().find(|e| e.id == "child:db").unwrap();
	assert_eq!(db.command, "sleep");
	assert_eq!(db.goal_state, GoalState::Running);
	let child_local = child.supervisor.snapshot(true).await;
	assert_eq!(db.pid, child_local.iter().find(|e| e.id == "db").unwrap().pid);

	shutdown(&[&parent, &child]).await;
}

#[tokio::test]
async fn socket_commands_and_errors() {
	let (parent, child) = tree().await;
	let mut socket = ws_client(parent.addr).await;

	match ws_request(&mut socket, r#"{"event":"get"}"#).await {
		ServerEvent::Status { entries } => assert_eq!(ids(&entries), vec!["-1", "web", "child:-1", "child:db"]),
		other => panic!("unexpected {:?}", other),
	}

	let reply = ws_request(&mut socket, r#"{"event":"kill","id":"nope"}"#).await;
	assert_eq!(
		reply,
		ServerEvent::Error {
			message: "invalid id: nope".into()
		}
	);

	let reply = ws_request(&mut socket, r#"{"event":"restart","id":"web"}"#).await;
	assert_eq!(
		reply,
		ServerEvent::Error {
			message: "unknown command: restart".into()
		}
	);

	let reply = ws_request(&mut socket, r#"{"event":"kill","id":"web"}"#).await;
	assert_eq!(
		reply,
		ServerEvent::Ok {
			command: "kill".into(),
			id: Some("web".into())
		}
	);
	let web = parent.supervisor.snapshot(true).await.into_iter().find(|e| e.id == "web").unwrap();
	assert_eq!(web.goal_state, GoalState::Stopped);

	shutdown(&[&parent, &child]).await;
}

#[tokio::test]
async fn child_changes_propagate_to_parent_subscribers() {
	let (parent, child) = tree().await;
	let mut updates = parent.aggregator.subscribe();

	child.supervisor.kill("db").await.unwrap();

	let deadline = Instant::now() + Duration::from_secs(5);
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		let entries = tokio::time::timeout(remaining, updates.recv())
			.await
			.expect("child change never reached the parent")
			.unwrap();
		let stopped = entries
			.iter()
			.any(|e| e.id == "child:db" && e.goal_state == GoalState::Stopped);
		if stopped {
			break;
		}
	}

	shutdown(&[&parent, &child]).await;
}

#[tokio::test]
async fn http_surface() {
	let node = start_node(vec![sleeper("web")]).await;

	let (code, body) = http(node.addr, "GET", "/api/status").await;
	assert_eq!(code, 200);
	let entries: Vec<StatusEntry> = serde_json::from_str(&body).unwrap();
	assert_eq!(ids(&entries), vec!["-1", "web"]);

	let (code, body) = http(node.addr, "POST", "/api/servers/nope/kill").await;
	assert_eq!(code, 404);
	assert!(body.contains("invalid id: nope"));

	let (code, _) = http(node.addr, "POST", "/api/servers/web/restart").await;
	assert_eq!(code, 400);

	let (code, body) = http(node.addr, "POST", "/api/servers/web/reboot").await;
	assert_eq!(code, 200);
	let event: ServerEvent = serde_json::from_str(&body).unwrap();
	assert_eq!(
		event,
		ServerEvent::Ok {
			command: "reboot".into(),
			id: Some("web".into())
		}
	);

	let (code, body) = http(node.addr, "GET", "/api/servers/web/output").await;
	assert_eq!(code, 200);
	let _: Vec<String> = serde_json::from_str(&body).unwrap();

	node.supervisor.shutdown().await;
}

#[tokio::test]
async fn non_loopback_origin_is_unauthorized() {
	let node = start_node(Vec::new()).await;
	let router = CommandRouter::new(node.aggregator.clone());
	let remote = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

	let res = router.dispatch(remote, "mallory", CommandRequest::new("kill", Some(SELF_ID.into()))).await;
	assert!(matches!(res, Err(Error::Unauthorized(ip)) if ip == remote));
	assert!(!node.supervisor.is_terminated());

	let res = router.dispatch(IpAddr::V4(Ipv4Addr::LOCALHOST), "op", CommandRequest::get()).await;
	assert!(matches!(res, Ok(ServerEvent::Status { .. })));
}
