use herd::SupervisorConfig;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_NAME: &str = "runner";

// ── config.toml ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub storage: StorageConfig,
	#[serde(default)]
	pub supervisor: RunnerSupervisorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default = "default_api_key")]
	pub api_key: String,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self { host: default_host(), port: default_port(), api_key: default_api_key() }
	}
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 3000 }
fn default_api_key() -> String { "supersecret123".into() }

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
	#[serde(default = "default_scripts_dir")]
	pub scripts_dir: PathBuf,
	#[serde(default = "default_projects_dir")]
	pub projects_dir: PathBuf,
	#[serde(default = "default_uploads_dir")]
	pub uploads_dir: PathBuf,
	#[serde(default = "default_log_dir")]
	pub log_dir: PathBuf,
	/// Upper bound for an uploaded script, in bytes.
	#[serde(default = "default_max_file_size")]
	pub max_file_size: usize,
	/// Upper bound for an uploaded project archive, in bytes.
	#[serde(default = "default_max_archive_size")]
	pub max_archive_size: usize,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			scripts_dir: default_scripts_dir(),
			projects_dir: default_projects_dir(),
			uploads_dir: default_uploads_dir(),
			log_dir: default_log_dir(),
			max_file_size: default_max_file_size(),
			max_archive_size: default_max_archive_size(),
		}
	}
}

fn default_scripts_dir() -> PathBuf { "scripts".into() }
fn default_projects_dir() -> PathBuf { "projects".into() }
fn default_uploads_dir() -> PathBuf { "uploads".into() }
fn default_log_dir() -> PathBuf { "logs".into() }
fn default_max_file_size() -> usize { 2_000_000 }
fn default_max_archive_size() -> usize { 200 * 1024 * 1024 }

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSupervisorConfig {
	#[serde(default = "default_restart_delay_ms")]
	pub restart_delay_ms: u64,
	#[serde(default = "default_script_launcher")]
	pub script_launcher: String,
}

impl Default for RunnerSupervisorConfig {
	fn default() -> Self {
		Self {
			restart_delay_ms: default_restart_delay_ms(),
			script_launcher: default_script_launcher(),
		}
	}
}

fn default_restart_delay_ms() -> u64 { 1500 }
fn default_script_launcher() -> String { "node".into() }

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {}: {source}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse {}: {source}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
	#[error("invalid value for {var}: {value:?}")]
	Env { var: &'static str, value: String },
}

impl Config {
	pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
		toml::from_str(content).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Load from `path`, or from the default location when it exists, then
	/// apply environment overrides.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match path {
			Some(p) => Self::read(p)?,
			None => match default_config_path() {
				Some(default) if default.exists() => Self::read(&default)?,
				_ => Config::default(),
			},
		};
		config.apply_env(|var| std::env::var(var).ok())?;
		Ok(config)
	}

	fn read(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml(&content, path)
	}

	/// Environment overrides, as set by panel deployments.
	pub fn apply_env<F>(&mut self, get: F) -> Result<(), ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(v) = get("PORT") {
			self.server.port = parse_env("PORT", v)?;
		}
		if let Some(v) = get("API_KEY") {
			self.server.api_key = v;
		}
		if let Some(v) = get("UPLOAD_DIR") {
			self.storage.scripts_dir = v.into();
		}
		if let Some(v) = get("PROJECTS_DIR") {
			self.storage.projects_dir = v.into();
		}
		if let Some(v) = get("LOG_DIR") {
			self.storage.log_dir = v.into();
		}
		if let Some(v) = get("MAX_FILE_SIZE") {
			self.storage.max_file_size = parse_env("MAX_FILE_SIZE", v)?;
		}
		if let Some(v) = get("RESTART_DELAY_MS") {
			self.supervisor.restart_delay_ms = parse_env("RESTART_DELAY_MS", v)?;
		}
		if let Some(v) = get("SCRIPT_LAUNCHER") {
			self.supervisor.script_launcher = v;
		}
		Ok(())
	}

	pub fn supervisor_config(&self) -> SupervisorConfig {
		SupervisorConfig {
			restart_delay: Duration::from_millis(self.supervisor.restart_delay_ms),
			script_launcher: self.supervisor.script_launcher.clone(),
			..SupervisorConfig::default()
		}
	}

	pub fn script_log_dir(&self) -> PathBuf {
		self.storage.log_dir.join("scripts")
	}

	pub fn project_log_dir(&self) -> PathBuf {
		self.storage.log_dir.join("projects")
	}

	/// Create every directory the server writes into.
	pub fn ensure_dirs(&self) -> std::io::Result<()> {
		for dir in [
			&self.storage.scripts_dir,
			&self.storage.projects_dir,
			&self.storage.uploads_dir,
			&self.storage.log_dir,
		] {
			std::fs::create_dir_all(dir)?;
		}
		Ok(())
	}
}

/// `$XDG_CONFIG_HOME/runner/config.toml`, else `~/.config/runner/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
	config_path_from(std::env::var_os("XDG_CONFIG_HOME"), std::env::var_os("HOME"))
}

fn config_path_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
	let base = match xdg_config_home.filter(|v| !v.is_empty()) {
		Some(xdg) => PathBuf::from(xdg),
		None => PathBuf::from(home.filter(|v| !v.is_empty())?).join(".config"),
	};
	Some(base.join(APP_NAME).join("config.toml"))
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
	value.trim().parse().map_err(|_| ConfigError::Env { var, value })
}
