use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
	/// Name is empty once sanitized.
	#[error("invalid name: {name:?}")]
	InvalidName { name: String },

	/// Script file or working directory is missing.
	#[error("{key}: not found: {}", path.display())]
	NotFound { key: String, path: PathBuf },

	#[error("{key}: not running")]
	NotRunning { key: String },

	#[error("{key}: spawn failed: {source}")]
	Spawn {
		key: String,
		#[source]
		source: std::io::Error,
	},

	#[error("log io error in {context}: {source}")]
	Log {
		context: String,
		#[source]
		source: std::io::Error,
	},
}

impl SupervisorError {
	pub fn log(context: impl Into<String>, source: std::io::Error) -> Self {
		Self::Log {
			context: context.into(),
			source,
		}
	}
}
