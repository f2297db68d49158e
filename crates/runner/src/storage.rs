//! Script files and project directories on disk.

use axum::body::Bytes;
use herd::sanitize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{AppError, AppResult};

pub const SCRIPT_EXTENSION: &str = ".js";

/// Sanitized file or directory name that stays inside its parent.
pub fn safe_name(raw: &str) -> AppResult<String> {
	let name = sanitize(raw.trim());
	match name.as_str() {
		"" => Err(AppError::BadRequest("name required".into())),
		"." | ".." => Err(AppError::BadRequest(format!("invalid name: {:?}", raw))),
		_ => Ok(name),
	}
}

/// Names of uploaded scripts, sorted.
pub async fn list_scripts(scripts_dir: &Path) -> AppResult<Vec<String>> {
	let mut names = list_entries(scripts_dir, false).await?;
	names.retain(|n| n.ends_with(SCRIPT_EXTENSION));
	Ok(names)
}

/// Names of extracted projects, sorted.
pub async fn list_projects(projects_dir: &Path) -> AppResult<Vec<String>> {
	list_entries(projects_dir, true).await
}

async fn list_entries(dir: &Path, dirs: bool) -> AppResult<Vec<String>> {
	let mut entries = match tokio::fs::read_dir(dir).await {
		Ok(e) => e,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(AppError::internal(e)),
	};
	let mut names = Vec::new();
	while let Some(entry) = entries.next_entry().await.map_err(AppError::internal)? {
		let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
		if is_dir == dirs {
			names.push(entry.file_name().to_string_lossy().to_string());
		}
	}
	names.sort();
	Ok(names)
}

/// Write `data` to `dest` through a temp file in the same directory, so the
/// old contents stay in place until the new ones are complete.
pub async fn write_atomic(dest: PathBuf, data: Bytes) -> AppResult<()> {
	tokio::task::spawn_blocking(move || -> std::io::Result<()> {
		let dir = dest.parent().unwrap_or_else(|| Path::new("."));
		std::fs::create_dir_all(dir)?;
		let mut tmp = NamedTempFile::new_in(dir)?;
		tmp.write_all(&data)?;
		tmp.persist(&dest).map_err(|e| e.error)?;
		Ok(())
	})
	.await
	.map_err(AppError::internal)?
	.map_err(AppError::internal)
}

/// Park an uploaded archive under `uploads_dir`. The file is removed when the
/// returned handle is dropped.
pub async fn stage_upload(uploads_dir: PathBuf, data: Bytes) -> AppResult<NamedTempFile> {
	tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
		std::fs::create_dir_all(&uploads_dir)?;
		let mut tmp = tempfile::Builder::new().suffix(".part").tempfile_in(&uploads_dir)?;
		tmp.write_all(&data)?;
		tmp.flush()?;
		Ok(tmp)
	})
	.await
	.map_err(AppError::internal)?
	.map_err(AppError::internal)
}
