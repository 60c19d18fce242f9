use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::error::Error;
use crate::protocol::{CommandRequest, ServerEvent};
use crate::router::CommandRouter;
use crate::types::StatusEntry;

/// Header a fronting proxy sets to the authenticated user name.
pub const CALLER_HEADER: &str = "x-forwarded-user";
const ANONYMOUS: &str = "anonymous";

pub fn router(commands: CommandRouter) -> Router {
	Router::new()
		.route("/api/status", get(status))
		.route("/api/servers/{id}/output", get(output))
		.route("/api/servers/{id}/{command}", post(command))
		.route("/ws", get(ws))
		.layer(CorsLayer::permissive())
		.with_state(commands)
}

/// Serves `app` with peer addresses attached, which the loopback check needs.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
}

#[derive(Serialize)]
struct ErrorResponse {
	error: String,
}

struct ApiError(Error);

impl From<Error> for ApiError {
	fn from(e: Error) -> Self {
		Self(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		if !self.0.is_command_error() {
			tracing::error!("request failed: {}", self.0);
		}
		let status = match &self.0 {
			Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Error::InvalidId(_) => StatusCode::NOT_FOUND,
			Error::UnknownCommand(_) | Error::MissingId(_) => StatusCode::BAD_REQUEST,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		(status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
	}
}

fn caller(headers: &HeaderMap) -> String {
	headers
		.get(CALLER_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(str::trim)
		.filter(|v| !v.is_empty())
		.unwrap_or(ANONYMOUS)
		.to_string()
}

async fn status(
	State(commands): State<CommandRouter>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
) -> Result<Json<Vec<StatusEntry>>, ApiError> {
	match commands.dispatch(addr.ip(), &caller(&headers), CommandRequest::get()).await? {
		ServerEvent::Status { entries } => Ok(Json(entries)),
		_ => Ok(Json(Vec::new())),
	}
}

async fn command(
	State(commands): State<CommandRouter>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	Path((id, command)): Path<(String, String)>,
) -> Result<Json<ServerEvent>, ApiError> {
	let request = CommandRequest::new(command, Some(id));
	let event = commands.dispatch(addr.ip(), &caller(&headers), request).await?;
	Ok(Json(event))
}

async fn output(
	State(commands): State<CommandRouter>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	Path(id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
	CommandRouter::authorize(addr.ip())?;
	let capture = commands
		.supervisor()
		.output(&id)
		.await
		.ok_or_else(|| Error::InvalidId(id.clone()))?;
	Ok(Json(capture.snapshot().await))
}

async fn ws(
	State(commands): State<CommandRouter>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	upgrade: WebSocketUpgrade,
) -> Response {
	if let Err(e) = CommandRouter::authorize(addr.ip()) {
		return ApiError(e).into_response();
	}
	let caller = caller(&headers);
	upgrade.on_upgrade(move |socket| handle_socket(socket, commands, addr, caller))
}

/// Requests on one socket are answered in the order they arrive; child-node
/// links rely on that to pair replies with requests.
async fn handle_socket(mut socket: WebSocket, commands: CommandRouter, addr: SocketAddr, caller: String) {
	tracing::debug!(origin = %addr, caller = %caller, "socket opened");
	let mut updates = commands.aggregator().subscribe();

	loop {
		tokio::select! {
			msg = socket.recv() => {
				let text = match msg {
					Some(Ok(Message::Text(text))) => text,
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => continue,
					Some(Err(e)) => {
						tracing::debug!(origin = %addr, "socket error: {}", e);
						break;
					}
				};
				let event = match serde_json::from_str::<CommandRequest>(text.as_str()) {
					Ok(request) => match commands.dispatch(addr.ip(), &caller, request).await {
						Ok(event) => event,
						Err(e) => ServerEvent::Error { message: e.to_string() },
					},
					Err(e) => ServerEvent::Error {
						message: format!("malformed request: {}", e),
					},
				};
				if send(&mut socket, &event).await.is_err() {
					break;
				}
			}
			update = updates.recv() => match update {
				Ok(entries) => {
					if send(&mut socket, &ServerEvent::StatusChanged { entries }).await.is_err() {
						break;
					}
				}
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					tracing::debug!(origin = %addr, skipped, "subscriber lagged");
				}
				Err(broadcast::error::RecvError::Closed) => break,
			},
		}
	}
	tracing::debug!(origin = %addr, "socket closed");
}

async fn send(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
	let json = match serde_json::to_string(event) {
		Ok(json) => json,
		Err(e) => {
			tracing::error!("failed to encode event: {}", e);
			return Ok(());
		}
	};
	socket.send(Message::Text(json.into())).await
}
