//! # warden
//!
//! Desired-state process supervisor.
//!
//! Keeps a list of servers running (or stopped) as declared, restarts them
//! when they exit with a process-wide minimum gap between restarts, and
//! serves the combined status of this host and any child nodes over HTTP
//! and a WebSocket.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use warden::{ServerSpec, Supervisor, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sup = Supervisor::new(SupervisorConfig {
//!     base_dir: "/srv/apps".into(),
//!     ..Default::default()
//! });
//!
//! let mut web = ServerSpec::new("web", "python3");
//! web.args = vec!["-m".into(), "http.server".into()];
//!
//! sup.load_specs(vec![web]).await.unwrap();
//! for entry in sup.snapshot(true).await {
//!     println!("{} {:?}", entry.id, entry.current_state);
//! }
//! # }
//! ```

pub mod types;
pub mod error;
pub mod throttle;
pub mod output;
pub mod supervisor;
pub mod registry;
pub mod protocol;
pub mod peer;
pub mod aggregate;
pub mod router;
pub mod api;
pub mod source;

pub use types::*;
pub use error::{Error, Result};
pub use output::OutputCapture;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use registry::{ChildNodeRegistry, Connector, PeerConnection};
pub use aggregate::Aggregator;
pub use router::CommandRouter;
pub use protocol::{Command, CommandRequest, ServerEvent};
