use std::fs::{self, File};
use std::io;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("invalid archive: {0}")]
	Zip(#[from] zip::result::ZipError),
}

/// Unpack a zip archive into `dest`. Entries whose paths would land outside
/// `dest` are skipped. Returns the number of files written.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<usize, ExtractError> {
	fs::create_dir_all(dest)?;
	let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
	let mut written = 0;

	for i in 0..zip.len() {
		let mut entry = zip.by_index(i)?;
		let Some(rel) = entry.enclosed_name() else {
			tracing::warn!("skipping unsafe archive entry {:?}", entry.name());
			continue;
		};
		let out = dest.join(rel);

		if entry.is_dir() {
			fs::create_dir_all(&out)?;
			continue;
		}
		if let Some(parent) = out.parent() {
			fs::create_dir_all(parent)?;
		}
		let mut file = File::create(&out)?;
		io::copy(&mut entry, &mut file)?;
		written += 1;

		#[cfg(unix)]
		if let Some(mode) = entry.unix_mode() {
			use std::os::unix::fs::PermissionsExt;
			fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o777))?;
		}
	}

	Ok(written)
}
