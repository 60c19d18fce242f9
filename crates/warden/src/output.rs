use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio::sync::Mutex;

const RING_LINES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
	Stdout,
	Stderr,
}

/// Pass-through for a child's output: every line goes to the supervisor's own
/// stdout/stderr prefixed with the server id. The last few lines are kept so
/// they can be inspected over the API.
#[derive(Clone, Debug)]
pub struct OutputCapture {
	id: String,
	ring: Arc<Mutex<VecDeque<String>>>,
	sender: broadcast::Sender<String>,
}

impl OutputCapture {
	pub fn new(id: &str) -> Self {
		let (sender, _) = broadcast::channel(256);
		Self {
			id: id.to_string(),
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_LINES))),
			sender,
		}
	}

	pub async fn write_line(&self, stream: Stream, line: &str) {
		let prefixed = format!("[{}] {}", self.id, line);

		match stream {
			Stream::Stdout => {
				let mut out = std::io::stdout().lock();
				let _ = writeln!(out, "{}", prefixed);
			}
			Stream::Stderr => {
				let mut err = std::io::stderr().lock();
				let _ = writeln!(err, "{}", prefixed);
			}
		}

		{
			let mut ring = self.ring.lock().await;
			if ring.len() >= RING_LINES {
				ring.pop_front();
			}
			ring.push_back(prefixed.clone());
		}

		let _ = self.sender.send(prefixed);
	}

	pub async fn snapshot(&self) -> Vec<String> {
		let ring = self.ring.lock().await;
		ring.iter().cloned().collect()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<String> {
		self.sender.subscribe()
	}
}

pub(crate) async fn pipe_lines<R: AsyncRead + Unpin>(reader: R, stream: Stream, output: OutputCapture) {
	let mut lines = BufReader::new(reader).lines();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) => output.write_line(stream, &line).await,
			Ok(None) => break,
			Err(e) => {
				tracing::debug!(id = %output.id, "output stream closed: {}", e);
				break;
			}
		}
	}
}
