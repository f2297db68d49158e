use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Result, SupervisorError};
use crate::logs::{self, LogSink, Tag};
use crate::registry::{ManagedEntity, Registry};
use crate::sanitize::sanitize;
use crate::types::*;

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(1500);
pub const DEFAULT_SCRIPT_LAUNCHER: &str = "node";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// Pause between an unsuccessful exit and the automatic restart.
	pub restart_delay: Duration,
	/// Program that runs script files (`<launcher> <script> [args..]`).
	pub script_launcher: String,
	/// How long the exit watcher waits for stdout/stderr to drain once the
	/// child is gone. Grandchildren holding the pipes open are cut off here.
	pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			restart_delay: DEFAULT_RESTART_DELAY,
			script_launcher: DEFAULT_SCRIPT_LAUNCHER.to_string(),
			drain_timeout: Duration::from_secs(2),
		}
	}
}

pub struct Supervisor {
	registry: Arc<Registry>,
	config: SupervisorConfig,
	next_id: AtomicU64,
}

/// Everything the exit watcher owns for one run.
struct Run {
	key: String,
	run_id: u64,
	spec: LaunchSpec,
	child: Child,
	sink: LogSink,
	pumps: Vec<JoinHandle<()>>,
	stop_flag: Arc<AtomicBool>,
	/// Previous run for the key, if it was still writing when this one began.
	log_gate: Option<watch::Receiver<bool>>,
	drained: watch::Sender<bool>,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Arc<Self> {
		Self::with_registry(config, Registry::new())
	}

	pub fn with_registry(config: SupervisorConfig, registry: Arc<Registry>) -> Arc<Self> {
		Arc::new(Self {
			registry,
			config,
			next_id: AtomicU64::new(1),
		})
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.config
	}

	fn next_id(&self) -> u64 {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Launch `spec` unless its key is already live.
	///
	/// Returns as soon as the child is spawned and registered; exit handling
	/// and restarts happen on background tasks. Must be called from within a
	/// Tokio runtime.
	pub fn start(self: &Arc<Self>, spec: LaunchSpec) -> Result<StartOutcome> {
		let sanitized = spec.sanitized_name();
		if sanitized.is_empty() {
			return Err(SupervisorError::InvalidName { name: spec.name });
		}
		let key = spec.key();

		if let Some(existing) = self.registry.get(&key) {
			return Ok(StartOutcome::AlreadyRunning(existing));
		}

		let mut cmd = build_command(&spec, &self.config, &key)?;
		let sink = LogSink::open(&spec.log_dir, &sanitized)?;
		let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
			key: key.clone(),
			source,
		})?;

		let pid = child.id().unwrap_or_default();
		let run_id = self.next_id();
		let (drained, drain_gate) = watch::channel(false);
		let entity = ManagedEntity::new(key.clone(), spec.clone(), run_id, pid, sink.path().to_path_buf())
			.with_drain_gate(drain_gate);
		let stop_flag = entity.stop_flag();
		let summary = entity.summary();

		if let Err(existing) = self.registry.try_insert(entity) {
			tracing::debug!("{}: lost start race, discarding pid {}", key, pid);
			discard_child(child);
			return Ok(StartOutcome::AlreadyRunning(existing));
		}

		tracing::info!("{}: started (pid {})", key, pid);

		let log_gate = self.registry.log_gate(&key);
		let mut pumps = Vec::with_capacity(2);
		if let Some(stdout) = child.stdout.take() {
			pumps.push(tokio::spawn(pipe_output(stdout, sink.clone(), Tag::Out, log_gate.clone())));
		}
		if let Some(stderr) = child.stderr.take() {
			pumps.push(tokio::spawn(pipe_output(stderr, sink.clone(), Tag::Err, log_gate.clone())));
		}

		let run = Run {
			key,
			run_id,
			spec,
			child,
			sink,
			pumps,
			stop_flag,
			log_gate,
			drained,
		};
		tokio::spawn(watch_exit(Arc::clone(self), run));

		Ok(StartOutcome::Started(summary))
	}

	/// Ask a live entity to terminate, or call off its scheduled restart.
	///
	/// Does not wait for the child to exit.
	pub fn stop(&self, kind: EntityKind, name: &str) -> Result<StopOutcome> {
		let key = entity_key(kind, name);

		if let Some(pid) = self.registry.mark_stopped(&key, terminate) {
			tracing::info!("{}: stop requested (pid {})", key, pid);
			return Ok(StopOutcome::Signalled { pid });
		}
		if self.registry.cancel_restart(&key) {
			tracing::info!("{}: pending restart cancelled", key);
			return Ok(StopOutcome::RestartCancelled);
		}
		Err(SupervisorError::NotRunning { key })
	}

	pub fn is_running(&self, kind: EntityKind, name: &str) -> bool {
		self.registry.contains(&entity_key(kind, name))
	}

	pub fn get(&self, kind: EntityKind, name: &str) -> Option<EntitySummary> {
		self.registry.get(&entity_key(kind, name))
	}

	pub fn list_running(&self) -> Vec<EntitySummary> {
		self.registry.list_all()
	}

	pub async fn tail_log(
		&self,
		kind: EntityKind,
		name: &str,
		log_dir: &Path,
		max_chars: usize,
	) -> Result<LogTail> {
		let sanitized = sanitize(name);
		if sanitized.is_empty() {
			return Err(SupervisorError::InvalidName { name: name.to_string() });
		}
		let logs = logs::tail(log_dir, &sanitized, max_chars).await?;
		Ok(LogTail {
			logs,
			running: self.is_running(kind, name),
		})
	}

	/// Stop everything and drop all scheduled restarts.
	pub fn shutdown(&self) {
		let pids = self.registry.stop_all();
		if !pids.is_empty() {
			tracing::info!("stopping {} running entities", pids.len());
		}
		for pid in pids {
			terminate(pid);
		}
	}

	/// Wait until every child has exited and every log is closed, or until
	/// `timeout` passes. Returns whether the supervisor went idle.
	pub async fn wait_idle(&self, timeout: Duration) -> bool {
		let deadline = tokio::time::Instant::now() + timeout;
		while !self.registry.is_idle() {
			if tokio::time::Instant::now() >= deadline {
				return false;
			}
			tokio::time::sleep(Duration::from_millis(25)).await;
		}
		true
	}
}

fn build_command(spec: &LaunchSpec, config: &SupervisorConfig, key: &str) -> Result<Command> {
	if !spec.working_dir.is_dir() {
		return Err(SupervisorError::NotFound {
			key: key.to_string(),
			path: spec.working_dir.clone(),
		});
	}

	let mut cmd = match spec.kind {
		EntityKind::Script => {
			let script = resolve_script(spec, key)?;
			let mut cmd = Command::new(&config.script_launcher);
			cmd.arg(script).args(&spec.args);
			cmd
		}
		EntityKind::Project => {
			let mut cmd = Command::new("sh");
			cmd.args(["-c", &spec.command]);
			cmd
		}
	};

	cmd.current_dir(&spec.working_dir)
		.envs(&spec.env)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.process_group(0);
	Ok(cmd)
}

fn resolve_script(spec: &LaunchSpec, key: &str) -> Result<PathBuf> {
	let path = Path::new(&spec.command);
	if !path.is_file() {
		return Err(SupervisorError::NotFound {
			key: key.to_string(),
			path: path.to_path_buf(),
		});
	}
	Ok(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()))
}

async fn pipe_output<R: tokio::io::AsyncRead + Unpin>(
	mut reader: R,
	sink: LogSink,
	tag: Tag,
	log_gate: Option<watch::Receiver<bool>>,
) {
	wait_for_gate(log_gate).await;
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => sink.write_bytes(tag, &buf[..n]).await,
			Err(e) => {
				tracing::debug!("{} pipe closed: {}", tag, e);
				break;
			}
		}
	}
}

async fn wait_for_gate(gate: Option<watch::Receiver<bool>>) {
	if let Some(mut gate) = gate {
		// a dropped sender means the previous run is gone as well
		let _ = gate.wait_for(|drained| *drained).await;
	}
}

async fn watch_exit(supervisor: Arc<Supervisor>, mut run: Run) {
	let status = run.child.wait().await;

	let stopped = run.stop_flag.load(Ordering::SeqCst);
	let restart = match &status {
		Ok(status) => should_restart(&run.spec, stopped, status),
		Err(_) => false,
	};
	let restart_id = restart.then(|| supervisor.next_id());
	let cancel = supervisor.registry.retire(&run.key, run.run_id, restart_id);

	if let (Some(id), Some(cancel)) = (restart_id, cancel) {
		tracing::info!(
			"{}: restarting in {}ms",
			run.key,
			supervisor.config.restart_delay.as_millis()
		);
		tokio::spawn(restart_after_backoff(
			Arc::clone(&supervisor),
			run.key.clone(),
			id,
			run.spec.clone(),
			cancel,
		));
	}

	wait_for_gate(run.log_gate.take()).await;
	drain_pumps(std::mem::take(&mut run.pumps), supervisor.config.drain_timeout).await;

	match &status {
		Ok(status) => {
			run.sink.write(Tag::Exit, &logs::exit_summary(status)).await;
			tracing::info!("{}: exited ({})", run.key, status);
		}
		Err(e) => {
			run.sink
				.write(Tag::Exit, &format!("code=null signal=null error={}", e))
				.await;
			tracing::warn!("{}: failed to wait for child: {}", run.key, e);
		}
	}

	run.sink.close().await;
	let _ = run.drained.send(true);
	supervisor.registry.finish_drain(&run.key, run.run_id);
}

/// Restart on an unsuccessful exit (non-zero code or killed by a signal)
/// when auto-restart is on and nobody asked the run to stop.
pub fn should_restart(spec: &LaunchSpec, stopped_manually: bool, status: &ExitStatus) -> bool {
	spec.auto_restart && !stopped_manually && !status.success()
}

async fn drain_pumps(pumps: Vec<JoinHandle<()>>, timeout: Duration) {
	let deadline = tokio::time::Instant::now() + timeout;
	for pump in pumps {
		let abort = pump.abort_handle();
		if tokio::time::timeout_at(deadline, pump).await.is_err() {
			tracing::debug!("output still open after exit, detaching");
			abort.abort();
		}
	}
}

async fn restart_after_backoff(
	supervisor: Arc<Supervisor>,
	key: String,
	id: u64,
	spec: LaunchSpec,
	mut cancel: watch::Receiver<bool>,
) {
	tokio::select! {
		_ = tokio::time::sleep(supervisor.config.restart_delay) => {}
		_ = cancel.changed() => {
			tracing::debug!("{}: restart cancelled during backoff", key);
			return;
		}
	}

	if !supervisor.registry.take_restart(&key, id) {
		return;
	}

	match supervisor.start(spec.clone()) {
		Ok(StartOutcome::Started(summary)) => {
			tracing::info!("{}: restarted (pid {})", key, summary.pid);
		}
		Ok(StartOutcome::AlreadyRunning(summary)) => {
			tracing::debug!("{}: already running again (pid {})", key, summary.pid);
		}
		Err(e) => {
			tracing::warn!("{}: restart failed: {}", key, e);
			wait_for_gate(supervisor.registry.log_gate(&key)).await;
			record_restart_error(&spec, &e).await;
		}
	}
}

async fn record_restart_error(spec: &LaunchSpec, error: &SupervisorError) {
	match LogSink::open(&spec.log_dir, &spec.sanitized_name()) {
		Ok(sink) => {
			sink.write(Tag::RestartError, &error.to_string()).await;
			sink.close().await;
		}
		Err(e) => tracing::warn!("{}: cannot record restart error: {}", spec.key(), e),
	}
}

/// Kill a child that must not be tracked, and reap it in the background.
fn discard_child(mut child: Child) {
	if let Some(pid) = child.id() {
		kill_group(pid);
	}
	let _ = child.start_kill();
	tokio::spawn(async move {
		let _ = child.wait().await;
	});
}

/// SIGTERM the child's process group, falling back to SIGKILL if the
/// platform refuses.
pub fn terminate(pid: u32) {
	use nix::errno::Errno;
	use nix::sys::signal::{killpg, Signal};
	use nix::unistd::Pid;
	match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
		Ok(()) => {}
		Err(Errno::ESRCH) => tracing::debug!("process group {} already gone", pid),
		Err(e) => {
			tracing::warn!("SIGTERM to process group {} rejected ({}), killing", pid, e);
			kill_group(pid);
		}
	}
}

/// SIGKILL the process group led by `pid`. Returns whether a signal was
/// delivered.
fn kill_group(pid: u32) -> bool {
	use nix::sys::signal::{kill, killpg, Signal};
	use nix::unistd::Pid;
	let target = Pid::from_raw(pid as i32);
	match killpg(target, Signal::SIGKILL) {
		Ok(()) => true,
		Err(e) if !pid_fallback_allowed(e) => false,
		Err(e) => {
			tracing::debug!("killpg {} failed ({}), killing pid", pid, e);
			match kill(target, Signal::SIGKILL) {
				Ok(()) => true,
				Err(e) => {
					tracing::warn!("failed to kill pid {}: {}", pid, e);
					false
				}
			}
		}
	}
}

/// ESRCH means the whole group has been reaped and the pid may already
/// belong to an unrelated process.
fn pid_fallback_allowed(err: nix::errno::Errno) -> bool {
	err != nix::errno::Errno::ESRCH
}
