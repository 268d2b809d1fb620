//! Guarded recursive deletion for the downstream pipeline
//!
//! A path is deleted from disk only if it is present in both the tracked
//! file map and the current batch's removal set, and only if the object on
//! disk still matches what was tracked. Anything the engine never saw, or
//! anything modified since it was last reconciled, is skipped and logged.
//!
//! Runs while the downstream pipeline holds the session lock for the
//! current batch.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::state::FileMap;
use crate::types::FileInformation;
use crate::util::{mtime_from_metadata, relative_from_full};

/// Recursively delete a tracked directory subtree under double-confirmation.
///
/// Children are processed first; each qualifying child is removed, then the
/// now-possibly-empty directory itself. A directory left non-empty because
/// some child was skipped is not an error. Failing to read a directory's
/// children aborts that subtree only; siblings continue.
pub fn delete_safe_recursive(
	base: &Path,
	relative: &str,
	file_map: &mut FileMap,
	remove_files: &FileMap,
) {
	let absolute = base.join(relative);
	let relative = relative_from_full(&absolute, base);

	// We don't delete the directory or its contents if we haven't tracked it
	if !file_map.contains_key(&relative) || !remove_files.contains_key(&relative) {
		debug!("[Downstream] Skip delete directory {}", relative);
		return;
	}

	let children = match fs::read_dir(&absolute) {
		Ok(children) => children,
		Err(err) => {
			debug!("[Downstream] Skip delete directory {}: {}", relative, err);
			return;
		}
	};

	for child in children.flatten() {
		let name = child.file_name().to_string_lossy().into_owned();
		let child_rel =
			if relative.is_empty() { name } else { format!("{}/{}", relative, name) };
		let child_abs = base.join(&child_rel);

		let confirmed = match file_map.get(&child_rel) {
			Some(tracked) if remove_files.contains_key(&child_rel) => {
				should_remove_local(&child_abs, tracked)
			}
			_ => false,
		};

		if !confirmed {
			debug!("[Downstream] Skip delete {}", child_rel);
			continue;
		}

		let is_dir = child.file_type().map(|t| t.is_dir()).unwrap_or(false);
		if is_dir {
			delete_safe_recursive(base, &child_rel, file_map, remove_files);
		} else {
			match fs::remove_file(&child_abs) {
				Ok(()) => {
					debug!("[Downstream] Removed {}", child_rel);
					file_map.remove(&child_rel);
				}
				Err(err) => {
					debug!("[Downstream] Skip file delete {}: {}", child_rel, err);
				}
			}
		}
	}

	// This will not remove the directory if something in it was skipped
	match fs::remove_dir(&absolute) {
		Ok(()) => {
			debug!("[Downstream] Removed directory {}", relative);
			file_map.remove(&relative);
		}
		Err(err) => {
			debug!("[Downstream] Skip delete directory {}, because {}", relative, err);
		}
	}
}

/// Confirm the on-disk object still matches its tracked metadata.
///
/// A file modified past its tracked state must not be deleted by a stale
/// removal notice. An object already absent is trivially removable.
pub(crate) fn should_remove_local(absolute: &Path, tracked: &FileInformation) -> bool {
	if tracked.is_directory {
		return true;
	}

	match fs::metadata(absolute) {
		Ok(metadata) => {
			metadata.len() == tracked.size && mtime_from_metadata(&metadata) <= tracked.mtime
		}
		Err(_) => true,
	}
}


// vim: ts=4
