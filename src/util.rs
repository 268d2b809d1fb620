//! Path normalization and small shared helpers
//!
//! The canonical relative form produced by `relative_from_full` is the
//! single key space shared by the state tracker, the exclusion matcher and
//! the wire protocol, so both sides agree on identity regardless of local
//! OS path conventions.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SyncError;

/// Convert an absolute path into its canonical root-relative key.
///
/// Strips the root prefix, converts `\` to `/`, collapses doubled
/// separators and drops one leading `.` segment and the leading `/`.
pub fn relative_from_full(full: &Path, prefix: &Path) -> String {
	let full = full.to_string_lossy().replace('\\', "/");
	let prefix = prefix.to_string_lossy().replace('\\', "/");

	let rel = full.strip_prefix(prefix.as_str()).unwrap_or(&full);
	let rel = rel.replace("//", "/");
	let rel = rel.strip_prefix('.').unwrap_or(&rel);
	rel.strip_prefix('/').unwrap_or(rel).to_string()
}

/// Round a timestamp to whole seconds, half up.
///
/// The archive transport truncates mtimes to seconds on the remote side as
/// well, so every stored or compared mtime goes through this.
pub fn round_mtime(time: SystemTime) -> i64 {
	match time.duration_since(UNIX_EPOCH) {
		Ok(duration) => {
			let secs = duration.as_secs() as i64;
			if duration.subsec_nanos() >= 500_000_000 {
				secs + 1
			} else {
				secs
			}
		}
		Err(_) => 0,
	}
}

/// Rounded mtime of a metadata record, or 0 if the platform has none
pub fn mtime_from_metadata(metadata: &std::fs::Metadata) -> i64 {
	metadata.modified().map(round_mtime).unwrap_or(0)
}

/// Strip path traversals out of a wire-supplied relative name.
///
/// Resolves `.` and `..` segments against an imaginary root so a malicious
/// archive entry can never escape the base directory.
pub fn clean(name: &str) -> String {
	let mut stack: Vec<&str> = Vec::new();

	for segment in name.split('/') {
		match segment {
			"" | "." => {}
			".." => {
				stack.pop();
			}
			other => stack.push(other),
		}
	}

	stack.join("/")
}

/// Check if a path exists and is a directory
pub fn dir_exists(path: &Path) -> Result<bool, SyncError> {
	match std::fs::metadata(path) {
		Ok(meta) => Ok(meta.is_dir()),
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
		Err(err) => Err(SyncError::filesystem(path.to_string_lossy(), err)),
	}
}

/// Copy a reader to a writer in bounded chunks until end-of-stream.
///
/// End-of-stream is not an error.
pub async fn pipe_stream<R, W>(writer: &mut W, reader: &mut R) -> Result<(), SyncError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = [0u8; 1024];

	loop {
		let n = reader.read(&mut buf).await.map_err(|e| SyncError::transport("pipe read", e))?;
		if n == 0 {
			return Ok(());
		}
		writer.write_all(&buf[..n]).await.map_err(|e| SyncError::transport("pipe write", e))?;
	}
}


// vim: ts=4
