//! Purpose-built tar framing for the exec channel
//!
//! Archives are built in memory and sent length-prefixed, so the receiving
//! side never has to guess where a binary payload ends inside the shared
//! byte stream. This is not a general archive layer; it exists for this
//! one channel.

use std::fs::File;
use std::path::Path;

use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

use crate::error::SyncError;
use crate::exclusion::ExcludeMatcher;
use crate::types::FileInformation;
use crate::util::{clean, mtime_from_metadata};

/// Build a tar payload for a batch of entries.
///
/// A directory descriptor recurses into its subtree (an empty name means
/// the whole watch root), honoring the exclusion matcher at every level.
/// Per-entry I/O failures are logged and the entry skipped; siblings
/// continue. Returns the payload plus the descriptors actually written,
/// with mtimes rounded the way the transport truncates them.
pub fn create_archive(
	watch_path: &Path,
	exclude: &ExcludeMatcher,
	entries: &[FileInformation],
) -> Result<(Vec<u8>, Vec<FileInformation>), SyncError> {
	let mut builder = Builder::new(Vec::new());
	let mut written = Vec::new();

	for entry in entries {
		append_recursive(&mut builder, watch_path, &entry.name, exclude, &mut written);
	}

	let data = builder
		.into_inner()
		.map_err(|e| SyncError::Transport { message: format!("finish archive: {}", e) })?;

	Ok((data, written))
}

fn append_recursive(
	builder: &mut Builder<Vec<u8>>,
	base: &Path,
	relative: &str,
	exclude: &ExcludeMatcher,
	written: &mut Vec<FileInformation>,
) {
	let absolute = if relative.is_empty() { base.to_path_buf() } else { base.join(relative) };

	let metadata = match std::fs::metadata(&absolute) {
		Ok(metadata) => metadata,
		Err(err) => {
			debug!("[Upstream] Skip {}: {}", relative, err);
			return;
		}
	};

	if !relative.is_empty() && exclude.matches(relative, metadata.is_dir()) {
		return;
	}

	if metadata.is_dir() {
		if !relative.is_empty() {
			let mut header = Header::new_gnu();
			header.set_entry_type(EntryType::Directory);
			header.set_mode(0o755);
			header.set_size(0);
			header.set_mtime(mtime_from_metadata(&metadata) as u64);
			let archive_path = format!("{}/", relative);
			if let Err(err) = builder.append_data(&mut header, &archive_path, std::io::empty()) {
				debug!("[Upstream] Skip directory {}: {}", relative, err);
				return;
			}
			written.push(FileInformation::directory(relative));
		}

		let children = match std::fs::read_dir(&absolute) {
			Ok(children) => children,
			Err(err) => {
				debug!("[Upstream] Skip children of {}: {}", relative, err);
				return;
			}
		};

		for child in children {
			let child = match child {
				Ok(child) => child,
				Err(err) => {
					debug!("[Upstream] Skip unreadable entry under {}: {}", relative, err);
					continue;
				}
			};
			let name = child.file_name().to_string_lossy().into_owned();
			let child_rel =
				if relative.is_empty() { name } else { format!("{}/{}", relative, name) };
			append_recursive(builder, base, &child_rel, exclude, written);
		}
	} else if metadata.is_file() {
		let mtime = mtime_from_metadata(&metadata);

		let file = match File::open(&absolute) {
			Ok(file) => file,
			Err(err) => {
				debug!("[Upstream] Skip file {}: {}", relative, err);
				return;
			}
		};

		let mut header = Header::new_gnu();
		header.set_entry_type(EntryType::Regular);
		header.set_mode(0o644);
		header.set_size(metadata.len());
		header.set_mtime(mtime as u64);
		if let Err(err) = builder.append_data(&mut header, relative, file) {
			debug!("[Upstream] Skip file {}: {}", relative, err);
			return;
		}

		written.push(FileInformation::file(relative, metadata.len(), mtime));
	}
	// Symlinks and special files are not mirrored
}

/// Unpack a tar payload onto the base directory.
///
/// Every wire-supplied path is traversal-cleaned before touching disk, and
/// directory creation is idempotent. Per-entry failures are logged and the
/// entry skipped; only a corrupt archive stream is an error. Returns the
/// descriptors actually applied.
pub fn extract_archive(base: &Path, data: &[u8]) -> Result<Vec<FileInformation>, SyncError> {
	let mut archive = Archive::new(data);
	let mut applied = Vec::new();

	let entries = archive
		.entries()
		.map_err(|e| SyncError::Protocol { message: format!("read archive: {}", e) })?;

	for entry in entries {
		let mut entry = entry
			.map_err(|e| SyncError::Protocol { message: format!("read archive entry: {}", e) })?;

		let raw = entry.path_bytes();
		let name = clean(&String::from_utf8_lossy(&raw).replace('\\', "/"));
		if name.is_empty() {
			continue;
		}
		let target = base.join(&name);

		match entry.header().entry_type() {
			EntryType::Directory => {
				if let Err(err) = std::fs::create_dir_all(&target) {
					debug!("[Downstream] Skip directory {}: {}", name, err);
					continue;
				}
				applied.push(FileInformation::directory(name));
			}
			EntryType::Regular => {
				if let Some(parent) = target.parent() {
					if let Err(err) = std::fs::create_dir_all(parent) {
						debug!("[Downstream] Skip file {}: {}", name, err);
						continue;
					}
				}

				let size = entry.header().size().unwrap_or(0);
				let mtime = entry.header().mtime().unwrap_or(0) as i64;

				if let Err(err) = entry.unpack(&target) {
					debug!("[Downstream] Skip file {}: {}", name, err);
					continue;
				}

				applied.push(FileInformation::file(name, size, mtime));
			}
			_ => {}
		}
	}

	Ok(applied)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::TempDir;

	fn write_file(dir: &Path, name: &str, content: &[u8]) {
		let path = dir.join(name);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).unwrap();
		}
		let mut file = File::create(path).unwrap();
		file.write_all(content).unwrap();
	}

	#[test]
	fn test_root_entry_archives_whole_tree() {
		let src = TempDir::new().unwrap();
		write_file(src.path(), "a.txt", b"0123456789");
		write_file(src.path(), "b/c.txt", b"nested");

		let root = FileInformation::directory("");
		let (data, written) =
			create_archive(src.path(), &ExcludeMatcher::empty(), &[root]).unwrap();

		let names: Vec<&str> = written.iter().map(|w| w.name.as_str()).collect();
		assert!(names.contains(&"a.txt"));
		assert!(names.contains(&"b"));
		assert!(names.contains(&"b/c.txt"));

		let a = written.iter().find(|w| w.name == "a.txt").unwrap();
		assert!(!a.is_directory);
		assert_eq!(a.size, 10);

		let b = written.iter().find(|w| w.name == "b").unwrap();
		assert!(b.is_directory);

		let dst = TempDir::new().unwrap();
		let applied = extract_archive(dst.path(), &data).unwrap();
		assert_eq!(applied.len(), written.len());
		assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"0123456789");
		assert_eq!(std::fs::read(dst.path().join("b/c.txt")).unwrap(), b"nested");
	}

	#[test]
	fn test_excluded_paths_stay_out_of_archive() {
		let src = TempDir::new().unwrap();
		write_file(src.path(), "keep.txt", b"keep");
		write_file(src.path(), "skip.log", b"skip");
		write_file(src.path(), "node_modules/dep.js", b"dep");

		let owned: Vec<String> =
			["*.log", "/node_modules"].iter().map(|p| p.to_string()).collect();
		let exclude = ExcludeMatcher::compile(&owned).unwrap();

		let root = FileInformation::directory("");
		let (_, written) = create_archive(src.path(), &exclude, &[root]).unwrap();

		let names: Vec<&str> = written.iter().map(|w| w.name.as_str()).collect();
		assert_eq!(names, vec!["keep.txt"]);
	}

	#[test]
	fn test_missing_entry_is_skipped_not_fatal() {
		let src = TempDir::new().unwrap();
		write_file(src.path(), "real.txt", b"real");

		let entries =
			[FileInformation::file("ghost.txt", 0, 0), FileInformation::file("real.txt", 4, 0)];
		let (_, written) =
			create_archive(src.path(), &ExcludeMatcher::empty(), &entries).unwrap();

		assert_eq!(written.len(), 1);
		assert_eq!(written[0].name, "real.txt");
	}

	#[test]
	fn test_extract_blocks_path_traversal() {
		let src = TempDir::new().unwrap();
		write_file(src.path(), "inner.txt", b"data");
		let entry = FileInformation::file("inner.txt", 4, 0);
		let (data, _) = create_archive(src.path(), &ExcludeMatcher::empty(), &[entry]).unwrap();

		// Build an archive whose entry path tries to escape the base. The
		// tar builder refuses `..` in set_path, so write the raw name field.
		let mut builder = Builder::new(Vec::new());
		let mut header = Header::new_gnu();
		{
			let gnu = header.as_gnu_mut().unwrap();
			let name = b"up/../../escape.txt";
			gnu.name[..name.len()].copy_from_slice(name);
		}
		header.set_entry_type(EntryType::Regular);
		header.set_mode(0o644);
		header.set_size(4);
		header.set_mtime(0);
		header.set_cksum();
		builder.append(&header, &b"evil"[..]).unwrap();
		let evil = builder.into_inner().unwrap();

		let dst = TempDir::new().unwrap();
		let sub = dst.path().join("sub");
		std::fs::create_dir_all(&sub).unwrap();
		extract_archive(&sub, &data).unwrap();
		extract_archive(&sub, &evil).unwrap();

		assert!(sub.join("inner.txt").exists());
		// The traversal-cleaned name lands inside the base instead
		assert!(sub.join("escape.txt").exists());
		assert!(!dst.path().join("escape.txt").exists());
	}
}

// vim: ts=4
