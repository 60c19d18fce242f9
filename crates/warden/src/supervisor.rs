use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::output::{pipe_lines, OutputCapture, Stream};
use crate::throttle::RestartThrottle;
use crate::types::*;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// Default working directory, and the root that status paths are shown relative to.
	pub base_dir: PathBuf,
	/// Minimum spacing between restarts triggered by process exits, across all ids.
	pub restart_interval: Duration,
	/// How long a fresh process stays `Starting` before it is considered `Running`.
	pub promote_delay: Duration,
	/// Command prefix used to run a server as another user. `{user}` is substituted.
	pub privilege_wrapper: Vec<String>,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
			restart_interval: Duration::from_secs(2),
			promote_delay: Duration::from_secs(3),
			privilege_wrapper: default_privilege_wrapper(),
		}
	}
}

pub fn default_privilege_wrapper() -> Vec<String> {
	["sudo", "-n", "-u", "{user}", "--"].iter().map(|s| s.to_string()).collect()
}

/// The exact program, arguments and directory a spec is launched with.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
	pub program: String,
	pub args: Vec<String>,
	pub cwd: PathBuf,
	pub drops_privileges: bool,
}

impl Invocation {
	pub fn for_spec(spec: &ServerSpec, base_dir: &Path, wrapper: &[String]) -> Self {
		let cwd = spec.working_dir(base_dir);
		let argv = spec.argv();

		if let (Some(user), Some((program, prefix))) = (spec.run_as_user.as_deref(), wrapper.split_first()) {
			if drops_privileges(Some(user)) {
				let mut args: Vec<String> = prefix.iter().map(|p| p.replace("{user}", user)).collect();
				args.push(spec.command.clone());
				args.extend(argv);
				return Self {
					program: program.replace("{user}", user),
					args,
					cwd,
					drops_privileges: true,
				};
			}
		}

		Self {
			program: spec.command.clone(),
			args: argv,
			cwd,
			drops_privileges: false,
		}
	}
}

/// A live OS process spawned for one server id.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
	pub pid: u32,
	/// Distinguishes successive processes of the same id.
	pub instance: u64,
	/// Set once we've signalled it; the process may not have exited yet.
	pub killed: bool,
}

impl ProcessHandle {
	fn signal(&mut self, owner: Option<&str>) -> nix::Result<()> {
		use nix::sys::signal::{kill, killpg, Signal};
		use nix::unistd::Pid;

		self.killed = true;
		let pid = Pid::from_raw(self.pid as i32);
		if drops_privileges(owner) {
			killpg(pid, Signal::SIGTERM)
		} else {
			kill(pid, Signal::SIGHUP)
		}
	}
}

/// Observed state for one desired id.
#[derive(Debug)]
pub struct ProcessRuntime {
	pub process: Option<ProcessHandle>,
	pub goal_state: GoalState,
	pub current_state: CurrentState,
	pub start_time: Option<DateTime<Utc>>,
	pub end_time: Option<DateTime<Utc>>,
	pub owner_user: Option<String>,
	restart_at: Option<Instant>,
	output: OutputCapture,
}

impl ProcessRuntime {
	fn new(id: &str) -> Self {
		Self {
			process: None,
			goal_state: GoalState::Running,
			current_state: CurrentState::Stopped,
			start_time: None,
			end_time: None,
			owner_user: None,
			restart_at: None,
			output: OutputCapture::new(id),
		}
	}

	fn signal(&mut self) -> Option<nix::Result<()>> {
		let owner = self.owner_user.as_deref();
		self.process.as_mut().map(|p| p.signal(owner))
	}

	fn instance(&self) -> Option<u64> {
		self.process.as_ref().map(|p| p.instance)
	}
}

fn needs_spawn(runtime: Option<&ProcessRuntime>, now: Instant) -> bool {
	let Some(runtime) = runtime else {
		return true;
	};
	if runtime.goal_state != GoalState::Running {
		return false;
	}
	if runtime.restart_at.is_some_and(|at| at > now) {
		return false;
	}
	match &runtime.process {
		None => true,
		Some(process) => process.killed || runtime.current_state == CurrentState::Stopped,
	}
}

struct State {
	specs: Vec<ServerSpec>,
	runtimes: HashMap<String, ProcessRuntime>,
	throttle: RestartThrottle,
	shutting_down: bool,
}

/// Keeps the running process set in line with the desired list.
///
/// All state sits behind one mutex that is held for a whole reconciliation
/// pass, so passes never overlap and run in the order they were requested.
/// Exit events and timers are separate tasks that re-enter through the same
/// lock.
pub struct Supervisor {
	state: Mutex<State>,
	config: SupervisorConfig,
	changes: broadcast::Sender<Vec<StatusEntry>>,
	terminated_tx: watch::Sender<bool>,
	started_at: DateTime<Utc>,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Arc<Self> {
		let (changes, _) = broadcast::channel(64);
		let (terminated_tx, _) = watch::channel(false);
		Arc::new(Self {
			state: Mutex::new(State {
				specs: Vec::new(),
				runtimes: HashMap::new(),
				throttle: RestartThrottle::new(config.restart_interval),
				shutting_down: false,
			}),
			config,
			changes,
			terminated_tx,
			started_at: Utc::now(),
		})
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.config
	}

	/// Local status snapshots, one per state change.
	pub fn subscribe(&self) -> broadcast::Receiver<Vec<StatusEntry>> {
		self.changes.subscribe()
	}

	/// Replaces the desired list and reconciles. An invalid list is rejected
	/// and the previous one stays in effect.
	pub async fn load_specs(self: &Arc<Self>, specs: Vec<ServerSpec>) -> Result<()> {
		validate_specs(&specs)?;
		let mut guard = self.state.lock().await;
		tracing::info!(count = specs.len(), "desired list loaded");
		guard.specs = specs;
		self.reconcile_locked(&mut guard);
		Ok(())
	}

	pub async fn specs(&self) -> Vec<ServerSpec> {
		self.state.lock().await.specs.clone()
	}

	/// Runs one reconciliation pass. Returns whether anything was spawned or torn down.
	pub async fn reconcile(self: &Arc<Self>) -> bool {
		let mut guard = self.state.lock().await;
		self.reconcile_locked(&mut guard)
	}

	fn reconcile_locked(self: &Arc<Self>, state: &mut State) -> bool {
		if state.shutting_down {
			return false;
		}

		let now = Instant::now();
		let mut changed = false;

		let ids: Vec<String> = state.specs.iter().map(|s| s.id.clone()).collect();
		for id in &ids {
			if !needs_spawn(state.runtimes.get(id), now) {
				continue;
			}
			changed = true;
			if let Err(e) = self.spawn_locked(state, id) {
				let filename = state
					.specs
					.iter()
					.find(|s| &s.id == id)
					.and_then(|s| s.filename.clone())
					.unwrap_or_default();
				tracing::error!(id = %id, filename = %filename, "{}", e);
			}
		}

		let removed: Vec<String> = state
			.runtimes
			.keys()
			.filter(|id| !ids.contains(*id))
			.cloned()
			.collect();
		for id in removed {
			if let Some(mut runtime) = state.runtimes.remove(&id) {
				if let Some(Err(e)) = runtime.signal() {
					tracing::debug!(id = %id, "teardown signal not delivered: {}", e);
				}
				tracing::info!(id = %id, "removed from desired list");
				changed = true;
			}
		}

		if changed {
			let _ = self.changes.send(self.snapshot_locked(state, true));
		}
		changed
	}

	fn spawn_locked(self: &Arc<Self>, state: &mut State, id: &str) -> Result<()> {
		let Some(spec) = state.specs.iter().find(|s| s.id == id).cloned() else {
			tracing::error!(id, "spawn aborted: server is no longer in the desired list");
			return Err(Error::InvalidId(id.to_string()));
		};

		let invocation = Invocation::for_spec(&spec, &self.config.base_dir, &self.config.privilege_wrapper);
		let runtime = state
			.runtimes
			.entry(id.to_string())
			.or_insert_with(|| ProcessRuntime::new(id));

		let mut cmd = Command::new(&invocation.program);
		cmd.args(&invocation.args)
			.current_dir(&invocation.cwd)
			.envs(&spec.env)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);

		let mut child = match cmd.spawn() {
			Ok(c) => c,
			Err(source) => {
				runtime.process = None;
				runtime.current_state = CurrentState::Stopped;
				runtime.end_time = Some(Utc::now());
				return Err(Error::Spawn {
					id: id.to_string(),
					source,
				});
			}
		};

		let pid = match child_pid(id, &child) {
			Ok(pid) => pid,
			Err(e) => {
				runtime.process = None;
				runtime.current_state = CurrentState::Stopped;
				runtime.end_time = Some(Utc::now());
				return Err(e);
			}
		};
		let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);

		if let Some(priority) = spec.priority {
			apply_priority(id, pid, priority);
		}
		if let Some(stdout) = child.stdout.take() {
			tokio::spawn(pipe_lines(stdout, Stream::Stdout, runtime.output.clone()));
		}
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(pipe_lines(stderr, Stream::Stderr, runtime.output.clone()));
		}

		runtime.process = Some(ProcessHandle {
			pid,
			instance,
			killed: false,
		});
		runtime.goal_state = GoalState::Running;
		runtime.current_state = CurrentState::Starting;
		runtime.start_time = Some(Utc::now());
		runtime.end_time = None;
		runtime.owner_user = spec.run_as_user.clone();
		runtime.restart_at = None;
		state.throttle.record_restart();

		tracing::info!(
			id,
			pid,
			program = %invocation.program,
			privileged = invocation.drops_privileges,
			"spawned"
		);

		let sup = Arc::clone(self);
		let exit_id = id.to_string();
		tokio::spawn(async move {
			let status = child.wait().await;
			sup.handle_exit(&exit_id, instance, status).await;
		});

		let sup = Arc::clone(self);
		let promote_id = id.to_string();
		let delay = self.config.promote_delay;
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			sup.promote(&promote_id, instance).await;
		});

		Ok(())
	}

	async fn handle_exit(self: &Arc<Self>, id: &str, instance: u64, status: std::io::Result<ExitStatus>) {
		let status = match status {
			Ok(s) => s,
			Err(e) => {
				tracing::error!(id, "failed to wait on process: {}", e);
				return;
			}
		};

		let mut guard = self.state.lock().await;
		let state = &mut *guard;
		let Some(runtime) = state.runtimes.get_mut(id) else {
			tracing::debug!(id, %status, "exit of a server no longer supervised");
			return;
		};
		if runtime.instance() != Some(instance) {
			tracing::debug!(id, %status, "exit of a superseded process");
			return;
		}

		tracing::info!(id, %status, "process exited");
		runtime.process = None;
		runtime.current_state = CurrentState::Stopped;
		runtime.end_time = Some(Utc::now());

		// Only an exit that will be followed by a restart claims a throttle
		// slot; a server stopped on purpose stays out of the schedule.
		if runtime.goal_state != GoalState::Running {
			runtime.restart_at = None;
			let _ = self.changes.send(self.snapshot_locked(state, true));
			return;
		}

		let delay = state.throttle.reserve();
		runtime.restart_at = Some(Instant::now() + delay);
		tracing::debug!(id, delay_ms = delay.as_millis() as u64, "restart scheduled");
		let _ = self.changes.send(self.snapshot_locked(state, true));
		drop(guard);

		let sup = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			sup.reconcile().await;
		});
	}

	async fn promote(&self, id: &str, instance: u64) {
		let mut guard = self.state.lock().await;
		let Some(runtime) = guard.runtimes.get_mut(id) else {
			return;
		};
		if runtime.end_time.is_some()
			|| runtime.current_state != CurrentState::Starting
			|| runtime.instance() != Some(instance)
		{
			return;
		}
		runtime.current_state = CurrentState::Running;
		tracing::debug!(id, "running");
		let _ = self.changes.send(self.snapshot_locked(&guard, true));
	}

	/// Restarts `id`, or starts it if it was stopped. `-1` terminates the supervisor.
	pub async fn reboot(self: &Arc<Self>, id: &str) -> Result<()> {
		if id == SELF_ID {
			self.terminate().await;
			return Ok(());
		}

		let mut guard = self.state.lock().await;
		let state = &mut *guard;
		if !state.specs.iter().any(|s| s.id == id) {
			return Err(Error::InvalidId(id.to_string()));
		}

		let runtime = state
			.runtimes
			.entry(id.to_string())
			.or_insert_with(|| ProcessRuntime::new(id));
		if let Some(Err(e)) = runtime.signal() {
			tracing::debug!(id, "signal not delivered: {}", e);
		}
		let needs_pass = runtime.goal_state != GoalState::Running || runtime.process.is_none();
		runtime.goal_state = GoalState::Running;
		runtime.restart_at = None;
		tracing::info!(id, "reboot");

		if needs_pass {
			self.reconcile_locked(state);
		}
		Ok(())
	}

	/// Stops `id` and keeps it stopped. Non-stoppable servers come straight
	/// back. `-1` terminates the supervisor.
	pub async fn kill(self: &Arc<Self>, id: &str) -> Result<()> {
		if id == SELF_ID {
			self.terminate().await;
			return Ok(());
		}

		let mut guard = self.state.lock().await;
		let state = &mut *guard;
		let Some(non_stoppable) = state.specs.iter().find(|s| s.id == id).map(|s| s.non_stoppable) else {
			return Err(Error::InvalidId(id.to_string()));
		};

		let runtime = state
			.runtimes
			.entry(id.to_string())
			.or_insert_with(|| ProcessRuntime::new(id));
		runtime.goal_state = GoalState::Stopped;
		if let Some(Err(e)) = runtime.signal() {
			tracing::debug!(id, "signal not delivered: {}", e);
		}

		if non_stoppable {
			runtime.goal_state = GoalState::Running;
			runtime.restart_at = None;
			tracing::warn!(id, "server is non-stoppable, restarting it instead");
			self.reconcile_locked(state);
		} else {
			tracing::info!(id, "kill");
		}
		Ok(())
	}

	/// Status of the supervisor itself followed by every desired server, in list order.
	pub async fn snapshot(&self, include_self: bool) -> Vec<StatusEntry> {
		let guard = self.state.lock().await;
		self.snapshot_locked(&guard, include_self)
	}

	fn snapshot_locked(&self, state: &State, include_self: bool) -> Vec<StatusEntry> {
		let base = &self.config.base_dir;
		let mut entries = Vec::with_capacity(state.specs.len() + 1);
		if include_self {
			entries.push(self.self_entry());
		}

		for spec in &state.specs {
			let Some(runtime) = state.runtimes.get(&spec.id) else {
				tracing::warn!(id = %spec.id, "desired server has no runtime record");
				continue;
			};
			entries.push(StatusEntry {
				id: spec.id.clone(),
				command: spec.command.clone(),
				filename: spec.filename.as_ref().map(|f| display_path(Path::new(f), base)),
				args: spec.args.clone(),
				working_directory: Some(display_path(&spec.working_dir(base), base)),
				run_as_user: spec.run_as_user.clone(),
				priority: spec.priority,
				non_stoppable: spec.non_stoppable,
				goal_state: runtime.goal_state,
				current_state: runtime.current_state,
				start_time: runtime.start_time,
				end_time: runtime.end_time,
				pid: runtime.process.as_ref().map(|p| p.pid),
				extra: spec.status_extra(),
			});
		}
		entries
	}

	fn self_entry(&self) -> StatusEntry {
		let command = std::env::current_exe()
			.ok()
			.and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
			.unwrap_or_else(|| "warden".to_string());
		StatusEntry {
			id: SELF_ID.to_string(),
			command,
			filename: None,
			args: std::env::args().skip(1).collect(),
			working_directory: Some(".".to_string()),
			run_as_user: None,
			priority: None,
			non_stoppable: true,
			goal_state: GoalState::Running,
			current_state: CurrentState::Running,
			start_time: Some(self.started_at),
			end_time: None,
			pid: Some(std::process::id()),
			extra: Default::default(),
		}
	}

	pub async fn output(&self, id: &str) -> Option<OutputCapture> {
		let guard = self.state.lock().await;
		guard.runtimes.get(id).map(|r| r.output.clone())
	}

	/// Stops every managed process. Signal failures are ignored since the
	/// target has usually exited already. No reconciliation runs afterwards.
	pub async fn shutdown(&self) {
		let mut guard = self.state.lock().await;
		guard.shutting_down = true;
		for (id, runtime) in guard.runtimes.iter_mut() {
			runtime.goal_state = GoalState::Stopped;
			if let Some(Err(e)) = runtime.signal() {
				tracing::debug!(id = %id, "signal not delivered: {}", e);
			}
		}
		tracing::info!("all servers signalled");
	}

	/// Shuts down and asks the hosting process to exit.
	pub async fn terminate(&self) {
		tracing::warn!("supervisor termination requested");
		self.shutdown().await;
		self.terminated_tx.send_replace(true);
	}

	pub fn is_terminated(&self) -> bool {
		*self.terminated_tx.borrow()
	}

	/// Resolves once `terminate` has run.
	pub async fn terminated(&self) {
		let mut rx = self.terminated_tx.subscribe();
		let _ = rx.wait_for(|done| *done).await;
	}
}

/// A child that was already reaped has no pid left to signal or renice.
fn child_pid(id: &str, child: &tokio::process::Child) -> Result<u32> {
	child.id().ok_or_else(|| Error::Spawn {
		id: id.to_string(),
		source: std::io::Error::other("process exited before its pid was read"),
	})
}

fn apply_priority(id: &str, pid: u32, priority: i32) {
	use nix::libc;

	let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, priority) };
	if rc != 0 {
		tracing::warn!(id, pid, priority, "failed to set priority: {}", std::io::Error::last_os_error());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn spec(id: &str) -> ServerSpec {
		let mut spec = ServerSpec::new(id, "node");
		spec.filename = Some("web.js".into());
		spec.args = vec!["--port".into(), "8080".into()];
		spec
	}

	#[test]
	fn direct_invocation_without_user() {
		let inv = Invocation::for_spec(&spec("web"), Path::new("/srv"), &default_privilege_wrapper());
		assert_eq!(inv.program, "node");
		assert_eq!(inv.args, vec!["web.js", "--port", "8080"]);
		assert_eq!(inv.cwd, PathBuf::from("/srv"));
		assert!(!inv.drops_privileges);
	}

	#[test]
	fn root_user_is_spawned_directly() {
		let mut s = spec("web");
		s.run_as_user = Some("root".into());
		let inv = Invocation::for_spec(&s, Path::new("/srv"), &default_privilege_wrapper());
		assert_eq!(inv.program, "node");
		assert!(!inv.drops_privileges);
	}

	#[test]
	fn non_root_user_goes_through_wrapper() {
		let mut s = spec("web");
		s.run_as_user = Some("www-data".into());
		s.working_directory = Some("app".into());
		let inv = Invocation::for_spec(&s, Path::new("/srv"), &default_privilege_wrapper());
		assert_eq!(inv.program, "sudo");
		assert_eq!(
			inv.args,
			vec!["-n", "-u", "www-data", "--", "node", "web.js", "--port", "8080"]
		);
		assert_eq!(inv.cwd, PathBuf::from("/srv/app"));
		assert!(inv.drops_privileges);
	}

	#[test]
	fn empty_wrapper_falls_back_to_direct() {
		let mut s = spec("web");
		s.run_as_user = Some("www-data".into());
		let inv = Invocation::for_spec(&s, Path::new("/srv"), &[]);
		assert_eq!(inv.program, "node");
		assert!(!inv.drops_privileges);
	}

	fn runtime(goal: GoalState, current: CurrentState, process: Option<ProcessHandle>) -> ProcessRuntime {
		let mut rt = ProcessRuntime::new("x");
		rt.goal_state = goal;
		rt.current_state = current;
		rt.process = process;
		rt
	}

	fn live(killed: bool) -> Option<ProcessHandle> {
		Some(ProcessHandle {
			pid: 1,
			instance: 1,
			killed,
		})
	}

	#[tokio::test(start_paused = true)]
	async fn spawn_decision() {
		let now = Instant::now();
		assert!(needs_spawn(None, now));
		assert!(needs_spawn(Some(&runtime(GoalState::Running, CurrentState::Stopped, None)), now));
		assert!(needs_spawn(Some(&runtime(GoalState::Running, CurrentState::Running, live(true))), now));
		assert!(!needs_spawn(Some(&runtime(GoalState::Running, CurrentState::Running, live(false))), now));
		assert!(!needs_spawn(Some(&runtime(GoalState::Running, CurrentState::Starting, live(false))), now));
		assert!(!needs_spawn(Some(&runtime(GoalState::Stopped, CurrentState::Stopped, None)), now));
	}

	#[tokio::test]
	async fn reaped_child_has_no_pid() {
		let mut child = Command::new("true").spawn().unwrap();
		assert!(child_pid("t", &child).is_ok());
		child.wait().await.unwrap();
		assert!(matches!(child_pid("t", &child), Err(Error::Spawn { id, .. }) if id == "t"));
	}

	#[test]
	fn runtime_is_debug_formatted() {
		let mut rt = runtime(GoalState::Running, CurrentState::Running, live(false));
		rt.output = OutputCapture::new("web");
		let text = format!("{:?}", rt);
		assert!(text.contains("ProcessRuntime"));
		assert!(text.contains("\"web\""));
	}

	#[tokio::test(start_paused = true)]
	async fn pending_restart_slot_defers_spawn() {
		let mut rt = runtime(GoalState::Running, CurrentState::Stopped, None);
		rt.restart_at = Some(Instant::now() + Duration::from_secs(1));
		assert!(!needs_spawn(Some(&rt), Instant::now()));

		tokio::time::advance(Duration::from_secs(1)).await;
		assert!(needs_spawn(Some(&rt), Instant::now()));
	}
}
