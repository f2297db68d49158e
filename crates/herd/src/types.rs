use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::sanitize::sanitize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
	/// A single file run through the configured launcher.
	Script,
	/// A shell command run inside a project directory.
	Project,
}

impl EntityKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			EntityKind::Script => "script",
			EntityKind::Project => "project",
		}
	}
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Registry key for a run slot: `<kind>:<sanitized name>`.
pub fn entity_key(kind: EntityKind, name: &str) -> String {
	format!("{}:{}", kind, sanitize(name))
}

/// Everything a caller hands over to launch an entity.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
	pub kind: EntityKind,
	pub name: String,
	/// Script path for [`EntityKind::Script`], shell command line for
	/// [`EntityKind::Project`].
	pub command: String,
	/// Extra arguments passed to the script after its path.
	pub args: Vec<String>,
	pub working_dir: PathBuf,
	pub log_dir: PathBuf,
	pub env: HashMap<String, String>,
	pub auto_restart: bool,
}

impl LaunchSpec {
	pub fn script(name: impl Into<String>, path: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
		let path: PathBuf = path.into();
		let working_dir = path
			.parent()
			.filter(|p| !p.as_os_str().is_empty())
			.map(|p| p.to_path_buf())
			.unwrap_or_else(|| PathBuf::from("."));
		Self {
			kind: EntityKind::Script,
			name: name.into(),
			command: path.to_string_lossy().to_string(),
			args: Vec::new(),
			working_dir,
			log_dir: log_dir.into(),
			env: HashMap::new(),
			auto_restart: false,
		}
	}

	pub fn project(
		name: impl Into<String>,
		command: impl Into<String>,
		working_dir: impl Into<PathBuf>,
		log_dir: impl Into<PathBuf>,
	) -> Self {
		Self {
			kind: EntityKind::Project,
			name: name.into(),
			command: command.into(),
			args: Vec::new(),
			working_dir: working_dir.into(),
			log_dir: log_dir.into(),
			env: HashMap::new(),
			auto_restart: false,
		}
	}

	pub fn auto_restart(mut self, enabled: bool) -> Self {
		self.auto_restart = enabled;
		self
	}

	pub fn env(mut self, env: HashMap<String, String>) -> Self {
		self.env = env;
		self
	}

	pub fn key(&self) -> String {
		entity_key(self.kind, &self.name)
	}

	pub fn sanitized_name(&self) -> String {
		sanitize(&self.name)
	}
}

/// Point-in-time copy of a registry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
	pub key: String,
	pub kind: EntityKind,
	pub name: String,
	pub pid: u32,
	pub started_at: DateTime<Utc>,
	pub command: String,
	pub log_path: PathBuf,
	pub auto_restart: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
	Started(EntitySummary),
	/// The key already had a live child; nothing new was spawned.
	AlreadyRunning(EntitySummary),
}

impl StartOutcome {
	pub fn summary(&self) -> &EntitySummary {
		match self {
			StartOutcome::Started(s) | StartOutcome::AlreadyRunning(s) => s,
		}
	}

	pub fn is_fresh(&self) -> bool {
		matches!(self, StartOutcome::Started(_))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
	/// Termination was requested from a live child.
	Signalled { pid: u32 },
	/// Nothing was running, but a scheduled restart was called off.
	RestartCancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogTail {
	pub logs: String,
	pub running: bool,
}
