//! Append-only per-entity log files.
//!
//! Every chunk a child writes is stored as one frame:
//!
//! ```text
//! [OUT 2026-02-14T09:47:01.123Z] listening on :3000
//! [EXIT 2026-02-14T09:47:09.877Z] code=null signal=SIGTERM
//! ```

use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
	Out,
	Err,
	Exit,
	RestartError,
}

impl Tag {
	pub fn as_str(&self) -> &'static str {
		match self {
			Tag::Out => "OUT",
			Tag::Err => "ERR",
			Tag::Exit => "EXIT",
			Tag::RestartError => "RESTART-ERROR",
		}
	}
}

impl fmt::Display for Tag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

pub fn log_path(log_dir: &Path, sanitized_name: &str) -> PathBuf {
	log_dir.join(format!("{}.log", sanitized_name))
}

/// Render one frame. A trailing newline is added unless the payload has one.
pub fn frame(tag: Tag, payload: &str) -> String {
	let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
	let mut line = format!("[{} {}] {}", tag, now, payload);
	if !line.ends_with('\n') {
		line.push('\n');
	}
	line
}

/// `code=<n|null> signal=<NAME|null>`
pub fn exit_summary(status: &ExitStatus) -> String {
	let code = status
		.code()
		.map(|c| c.to_string())
		.unwrap_or_else(|| "null".to_string());
	let signal = exit_signal_name(status).unwrap_or_else(|| "null".to_string());
	format!("code={} signal={}", code, signal)
}

#[cfg(unix)]
fn exit_signal_name(status: &ExitStatus) -> Option<String> {
	use std::os::unix::process::ExitStatusExt;
	let raw = status.signal()?;
	Some(match nix::sys::signal::Signal::try_from(raw) {
		Ok(sig) => sig.as_str().to_string(),
		Err(_) => format!("SIG{}", raw),
	})
}

#[cfg(not(unix))]
fn exit_signal_name(_status: &ExitStatus) -> Option<String> {
	None
}

/// Write handle for one entity's log, shared by the output pumps and the
/// exit watcher of a single run.
#[derive(Clone)]
pub struct LogSink {
	writer: Arc<Mutex<LogWriter>>,
	path: PathBuf,
}

struct LogWriter {
	file: Option<File>,
}

impl LogSink {
	pub fn open(log_dir: &Path, sanitized_name: &str) -> Result<Self> {
		fs::create_dir_all(log_dir)
			.map_err(|e| SupervisorError::log(format!("create {}", log_dir.display()), e))?;

		let path = log_path(log_dir, sanitized_name);
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.map_err(|e| SupervisorError::log(format!("open {}", path.display()), e))?;

		Ok(Self {
			writer: Arc::new(Mutex::new(LogWriter { file: Some(file) })),
			path,
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub async fn write(&self, tag: Tag, payload: &str) {
		let line = frame(tag, payload);
		let mut writer = self.writer.lock().await;
		writer.write(&self.path, line.as_bytes());
	}

	pub async fn write_bytes(&self, tag: Tag, data: &[u8]) {
		self.write(tag, &String::from_utf8_lossy(data)).await;
	}

	/// Flush and drop the file handle. Later writes are discarded.
	pub async fn close(&self) {
		let mut writer = self.writer.lock().await;
		if let Some(mut file) = writer.file.take() {
			if let Err(e) = file.flush() {
				tracing::warn!("failed to flush {}: {}", self.path.display(), e);
			}
		}
	}

	pub async fn is_closed(&self) -> bool {
		self.writer.lock().await.file.is_none()
	}
}

impl LogWriter {
	fn write(&mut self, path: &Path, data: &[u8]) {
		match self.file {
			Some(ref mut file) => {
				if let Err(e) = file.write_all(data) {
					tracing::warn!("failed to append to {}: {}", path.display(), e);
				}
			}
			None => tracing::debug!("dropping write to closed log {}", path.display()),
		}
	}
}

/// Trailing `max_chars` characters of a log, or `""` if it was never created.
pub async fn tail(log_dir: &Path, sanitized_name: &str, max_chars: usize) -> Result<String> {
	let path = log_path(log_dir, sanitized_name);
	let data = match tokio::fs::read(&path).await {
		Ok(d) => d,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
		Err(e) => return Err(SupervisorError::log(format!("read {}", path.display()), e)),
	};
	let text = String::from_utf8_lossy(&data);
	Ok(last_chars(&text, max_chars).to_string())
}

fn last_chars(text: &str, n: usize) -> &str {
	if n == 0 {
		return "";
	}
	match text.char_indices().rev().nth(n - 1) {
		Some((idx, _)) => &text[idx..],
		None => text,
	}
}
