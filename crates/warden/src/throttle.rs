use std::time::Duration;
use tokio::time::Instant;

/// Process-wide restart pacing.
///
/// A single timestamp is shared by every supervised id, so a crash loop in one
/// server also delays restarts of unrelated ones.
#[derive(Debug)]
pub struct RestartThrottle {
	min_interval: Duration,
	last_restart: Option<Instant>,
}

impl RestartThrottle {
	pub fn new(min_interval: Duration) -> Self {
		Self {
			min_interval,
			last_restart: None,
		}
	}

	pub fn min_interval(&self) -> Duration {
		self.min_interval
	}

	/// Stamps a restart happening now. Never moves the stamp backwards, so a
	/// spawn doesn't release a slot already reserved further in the future.
	pub fn record_restart(&mut self) {
		let now = Instant::now();
		self.last_restart = Some(match self.last_restart {
			Some(last) if last > now => last,
			_ => now,
		});
	}

	/// Time left until the next restart is allowed; zero when it already is.
	pub fn next_allowed_delay(&self) -> Duration {
		match self.last_restart {
			Some(last) => (last + self.min_interval).saturating_duration_since(Instant::now()),
			None => Duration::ZERO,
		}
	}

	/// Claims the next free restart slot and returns how long to wait for it.
	pub fn reserve(&mut self) -> Duration {
		let delay = self.next_allowed_delay();
		self.last_restart = Some(Instant::now() + delay);
		delay
	}
}
