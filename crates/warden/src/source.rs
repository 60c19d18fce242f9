use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fingerprint {
	Missing,
	Present(SystemTime, u64),
}

/// A JSON list on disk, re-read whenever its modification time or length
/// changes.
#[derive(Debug)]
pub struct FileSource {
	path: PathBuf,
	last: Option<Fingerprint>,
}

impl FileSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			last: None,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// `None` when nothing changed since the previous poll. A file that
	/// disappears is reported once as a read error.
	pub async fn poll<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
		let current = match tokio::fs::metadata(&self.path).await {
			Ok(meta) => Fingerprint::Present(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), meta.len()),
			Err(_) => Fingerprint::Missing,
		};
		if self.last == Some(current) {
			return None;
		}
		self.last = Some(current);
		Some(load_json(&self.path).await)
	}

	/// Watches the parent directory, so the file may be created, replaced by
	/// rename, or deleted. Each event naming the file sends a wake-up.
	fn watcher(&self, wake: mpsc::UnboundedSender<()>) -> notify::Result<RecommendedWatcher> {
		let name = self.path.file_name().map(|n| n.to_os_string());
		let mut watcher = RecommendedWatcher::new(
			move |res: notify::Result<notify::Event>| match res {
				Ok(event) => {
					if event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == name) {
						let _ = wake.send(());
					}
				}
				Err(e) => tracing::warn!("file watch error: {}", e),
			},
			notify::Config::default(),
		)?;
		let dir = match self.path.parent() {
			Some(dir) if !dir.as_os_str().is_empty() => dir,
			_ => Path::new("."),
		};
		watcher.watch(dir, RecursiveMode::NonRecursive)?;
		Ok(watcher)
	}
}

pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
	let content = tokio::fs::read_to_string(path).await.map_err(|source| Error::ConfigRead {
		path: path.to_path_buf(),
		source,
	})?;
	serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
		path: path.to_path_buf(),
		source,
	})
}

/// Follows `source` forever, handing each successfully parsed revision to
/// `apply`. Filesystem events trigger an immediate check; `interval` is the
/// polling fallback for when no watcher can be set up or an event is missed.
/// Read, parse and apply failures are logged and the previous state stays in
/// effect.
pub async fn watch<T, F, Fut>(mut source: FileSource, interval: Duration, mut apply: F)
where
	T: DeserializeOwned,
	F: FnMut(T) -> Fut,
	Fut: Future<Output = Result<()>>,
{
	let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();
	let _watcher = match source.watcher(wake_tx) {
		Ok(watcher) => Some(watcher),
		Err(e) => {
			tracing::warn!(path = %source.path().display(), "file watcher unavailable, polling only: {}", e);
			None
		}
	};

	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = ticker.tick() => {}
			Some(()) = wake_rx.recv() => {
				while wake_rx.try_recv().is_ok() {}
			}
		}
		match source.poll::<T>().await {
			None => {}
			Some(Ok(value)) => {
				if let Err(e) = apply(value).await {
					tracing::error!(path = %source.path().display(), "rejected: {}", e);
				}
			}
			Some(Err(e)) => tracing::error!("{}; keeping previous state", e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	static COUNTER: AtomicUsize = AtomicUsize::new(0);

	fn temp_file(name: &str) -> PathBuf {
		let n = COUNTER.fetch_add(1, Ordering::Relaxed);
		let dir = std::env::temp_dir().join(format!("warden-source-{}-{}", std::process::id(), n));
		std::fs::create_dir_all(&dir).unwrap();
		dir.join(name)
	}

	#[tokio::test]
	async fn reports_changes_once() {
		let path = temp_file("list.json");
		std::fs::write(&path, "[1, 2]").unwrap();
		let mut source = FileSource::new(&path);

		let first: Vec<u32> = source.poll().await.unwrap().unwrap();
		assert_eq!(first, vec![1, 2]);
		assert!(source.poll::<Vec<u32>>().await.is_none());

		std::fs::write(&path, "[1, 2, 3]").unwrap();
		let second: Vec<u32> = source.poll().await.unwrap().unwrap();
		assert_eq!(second, vec![1, 2, 3]);
		assert!(source.poll::<Vec<u32>>().await.is_none());
	}

	#[tokio::test]
	async fn malformed_and_missing_files_are_errors() {
		let path = temp_file("bad.json");
		std::fs::write(&path, "[1,").unwrap();
		let mut source = FileSource::new(&path);
		assert!(matches!(source.poll::<Vec<u32>>().await, Some(Err(Error::ConfigParse { .. }))));

		std::fs::remove_file(&path).unwrap();
		assert!(matches!(source.poll::<Vec<u32>>().await, Some(Err(Error::ConfigRead { .. }))));
		assert!(source.poll::<Vec<u32>>().await.is_none());
	}

	#[tokio::test]
	async fn edits_are_picked_up_without_waiting_for_the_poll() {
		let path = temp_file("watched.json");
		std::fs::write(&path, "[1]").unwrap();

		let (tx, mut rx) = mpsc::unbounded_channel();
		let task = tokio::spawn(watch(FileSource::new(&path), Duration::from_secs(60), move |v: Vec<u32>| {
			let tx = tx.clone();
			async move {
				let _ = tx.send(v);
				Ok(())
			}
		}));

		let initial = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
		assert_eq!(initial, Some(vec![1]));

		tokio::time::sleep(Duration::from_millis(100)).await;
		std::fs::write(&path, "[1, 2, 3, 4]").unwrap();
		let edited = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
		assert_eq!(edited, Some(vec![1, 2, 3, 4]));

		task.abort();
	}
}
