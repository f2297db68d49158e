use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::types::{EntitySummary, LaunchSpec};

/// Live record for one run of an entity.
pub struct ManagedEntity {
	pub key: String,
	pub spec: LaunchSpec,
	pub run_id: u64,
	pub pid: u32,
	pub started_at: DateTime<Utc>,
	pub log_path: PathBuf,
	stopped_manually: Arc<AtomicBool>,
	drained: Option<watch::Receiver<bool>>,
}

impl ManagedEntity {
	pub fn new(key: String, spec: LaunchSpec, run_id: u64, pid: u32, log_path: PathBuf) -> Self {
		Self {
			key,
			spec,
			run_id,
			pid,
			started_at: Utc::now(),
			log_path,
			stopped_manually: Arc::new(AtomicBool::new(false)),
			drained: None,
		}
	}

	/// Attach the receiver that flips to `true` once this run has written its
	/// last log frame. It outlives the record in the registry so the next run
	/// for the key can hold its output back until then.
	pub fn with_drain_gate(mut self, drained: watch::Receiver<bool>) -> Self {
		self.drained = Some(drained);
		self
	}

	/// Flag shared with the run's exit watcher.
	pub fn stop_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.stopped_manually)
	}

	pub fn stopped_manually(&self) -> bool {
		self.stopped_manually.load(Ordering::SeqCst)
	}

	pub fn summary(&self) -> EntitySummary {
		EntitySummary {
			key: self.key.clone(),
			kind: self.spec.kind,
			name: self.spec.name.clone(),
			pid: self.pid,
			started_at: self.started_at,
			command: self.spec.command.clone(),
			log_path: self.log_path.clone(),
			auto_restart: self.spec.auto_restart,
		}
	}
}

struct PendingRestart {
	id: u64,
	cancel: watch::Sender<bool>,
}

impl PendingRestart {
	fn cancel(self) {
		let _ = self.cancel.send(true);
	}
}

#[derive(Default)]
struct Slots {
	running: HashMap<String, ManagedEntity>,
	pending: HashMap<String, PendingRestart>,
	/// Runs that have left `running` but may still be writing their log.
	draining: HashMap<String, (u64, watch::Receiver<bool>)>,
}

/// Key-addressed store of live entities and scheduled restarts.
///
/// Every method takes the one lock for its whole duration, so check-and-set
/// sequences such as [`Registry::try_insert`] are atomic.
#[derive(Default)]
pub struct Registry {
	slots: Mutex<Slots>,
}

impl Registry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn slots(&self) -> MutexGuard<'_, Slots> {
		self.slots.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Insert unless the key is taken, in which case the current holder is
	/// returned. A successful insert also calls off any restart still
	/// scheduled for the key.
	pub fn try_insert(&self, entity: ManagedEntity) -> Result<(), EntitySummary> {
		let mut slots = self.slots();
		if let Some(existing) = slots.running.get(&entity.key) {
			return Err(existing.summary());
		}
		if let Some(pending) = slots.pending.remove(&entity.key) {
			pending.cancel();
		}
		slots.running.insert(entity.key.clone(), entity);
		Ok(())
	}

	/// Remove the record for `key` if it still belongs to `run_id`.
	pub fn remove(&self, key: &str, run_id: u64) -> Option<ManagedEntity> {
		let mut slots = self.slots();
		Self::remove_run(&mut slots, key, run_id)
	}

	fn remove_run(slots: &mut Slots, key: &str, run_id: u64) -> Option<ManagedEntity> {
		match slots.running.get(key) {
			Some(entity) if entity.run_id == run_id => slots.running.remove(key),
			_ => None,
		}
	}

	/// Remove a finished run and, in the same step, arm its restart.
	///
	/// Returns the cancel receiver for the armed restart, or `None` when no
	/// restart was requested, the record already belongs to another run, or
	/// the run was flagged as manually stopped by the time the lock was taken.
	pub fn retire(
		&self,
		key: &str,
		run_id: u64,
		restart_id: Option<u64>,
	) -> Option<watch::Receiver<bool>> {
		let mut slots = self.slots();
		let removed = Self::remove_run(&mut slots, key, run_id)?;
		if let Some(drained) = removed.drained.clone() {
			slots.draining.insert(key.to_string(), (run_id, drained));
		}

		let id = restart_id?;
		if removed.stopped_manually() {
			return None;
		}
		let (tx, rx) = watch::channel(false);
		if let Some(previous) = slots.pending.insert(key.to_string(), PendingRestart { id, cancel: tx }) {
			previous.cancel();
		}
		Some(rx)
	}

	/// Claim a scheduled restart. Fails if it was cancelled or superseded.
	pub fn take_restart(&self, key: &str, id: u64) -> bool {
		let mut slots = self.slots();
		match slots.pending.get(key) {
			Some(p) if p.id == id => {
				slots.pending.remove(key);
				true
			}
			_ => false,
		}
	}

	pub fn cancel_restart(&self, key: &str) -> bool {
		match self.slots().pending.remove(key) {
			Some(pending) => {
				pending.cancel();
				true
			}
			None => false,
		}
	}

	/// Drain gate of a retired run for `key` that is still writing its log.
	pub fn log_gate(&self, key: &str) -> Option<watch::Receiver<bool>> {
		let slots = self.slots();
		let (_, drained) = slots.draining.get(key)?;
		if *drained.borrow() {
			return None;
		}
		Some(drained.clone())
	}

	/// Forget the drain gate of `run_id` once its log is closed.
	pub fn finish_drain(&self, key: &str, run_id: u64) {
		let mut slots = self.slots();
		if matches!(slots.draining.get(key), Some((id, _)) if *id == run_id) {
			slots.draining.remove(key);
		}
	}

	/// True when nothing is running and no retired run is still writing.
	pub fn is_idle(&self) -> bool {
		let slots = self.slots();
		slots.running.is_empty() && slots.draining.is_empty()
	}

	pub fn has_pending_restart(&self, key: &str) -> bool {
		self.slots().pending.contains_key(key)
	}

	/// Flag the live run for `key` as manually stopped and hand `signal`
	/// its pid while the record is still held. The flag is written before
	/// `signal` runs.
	pub fn mark_stopped<F>(&self, key: &str, signal: F) -> Option<u32>
	where
		F: FnOnce(u32),
	{
		let slots = self.slots();
		let entity = slots.running.get(key)?;
		entity.stopped_manually.store(true, Ordering::SeqCst);
		signal(entity.pid);
		Some(entity.pid)
	}

	/// Flag every live run as stopped and cancel every scheduled restart.
	/// Returns the pids that should be signalled.
	pub fn stop_all(&self) -> Vec<u32> {
		let mut slots = self.slots();
		for (_, pending) in slots.pending.drain() {
			pending.cancel();
		}
		slots
			.running
			.values()
			.map(|e| {
				e.stopped_manually.store(true, Ordering::SeqCst);
				e.pid
			})
			.collect()
	}

	pub fn get(&self, key: &str) -> Option<EntitySummary> {
		self.slots().running.get(key).map(|e| e.summary())
	}

	pub fn contains(&self, key: &str) -> bool {
		self.slots().running.contains_key(key)
	}

	/// Copy of every live record, ordered by key.
	pub fn list_all(&self) -> Vec<EntitySummary> {
		let slots = self.slots();
		let mut all: Vec<EntitySummary> = slots.running.values().map(|e| e.summary()).collect();
		drop(slots);
		all.sort_by(|a, b| a.key.cmp(&b.key));
		all
	}

	pub fn len(&self) -> usize {
		self.slots().running.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
