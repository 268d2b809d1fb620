//! Shared synchronization state
//!
//! The file map is the engine's belief about what has already been
//! reconciled: a key's presence means that path is synchronized, and it is
//! removed only after the corresponding object is confirmed gone. Together
//! with the per-batch pending-removal map it forms the double-confirmation
//! guard consulted before any destructive local operation.
//!
//! All access goes through the single session lock. Pipelines hold it for
//! one batch at a time; nothing else may hold it across blocking I/O.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::types::FileInformation;

/// Mapping from canonical relative path to last-known metadata
pub type FileMap = BTreeMap<String, FileInformation>;

/// Session-wide mutable state, guarded by one lock
#[derive(Debug)]
pub struct SyncState {
	pub file_map: FileMap,

	/// Suppress non-essential logging (used by one-shot initial copies)
	pub silent: bool,
}

/// Handle shared between both pipelines and the session orchestrator
pub type SharedState = Arc<Mutex<SyncState>>;

impl SyncState {
	pub fn new(silent: bool) -> SharedState {
		Arc::new(Mutex::new(SyncState { file_map: FileMap::new(), silent }))
	}

	/// Record an entry as synchronized, returning the previous belief
	pub fn track(&mut self, info: FileInformation) -> Option<FileInformation> {
		self.file_map.insert(info.name.clone(), info)
	}

	/// Forget an entry after its filesystem object is confirmed gone
	pub fn untrack(&mut self, name: &str) -> Option<FileInformation> {
		self.file_map.remove(name)
	}

	pub fn get(&self, name: &str) -> Option<&FileInformation> {
		self.file_map.get(name)
	}

	pub fn is_tracked(&self, name: &str) -> bool {
		self.file_map.contains_key(name)
	}

	/// Whether a path or any of its ancestor directories is tracked.
	///
	/// Deletion notices are honored only under this condition; anything
	/// else was never seen by the engine and must not be touched.
	pub fn is_tracked_or_ancestor(&self, name: &str) -> bool {
		if self.is_tracked(name) {
			return true;
		}

		let mut current = name;
		while let Some(pos) = current.rfind('/') {
			current = &current[..pos];
			if self.is_tracked(current) {
				return true;
			}
		}

		false
	}

	/// Entry is unchanged relative to a fresh observation
	pub fn is_unchanged(&self, observed: &FileInformation) -> bool {
		match self.file_map.get(&observed.name) {
			Some(tracked) => tracked.is_same_as(observed),
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_track_and_untrack() {
		let mut state = SyncState { file_map: FileMap::new(), silent: false };
		assert!(state.track(FileInformation::file("a.txt", 10, 100)).is_none());
		assert!(state.is_tracked("a.txt"));

		let prev = state.track(FileInformation::file("a.txt", 12, 200)).unwrap();
		assert_eq!(prev.size, 10);

		state.untrack("a.txt");
		assert!(!state.is_tracked("a.txt"));
	}

	#[test]
	fn test_ancestor_tracking() {
		let mut state = SyncState { file_map: FileMap::new(), silent: false };
		state.track(FileInformation::directory("b"));

		assert!(state.is_tracked_or_ancestor("b"));
		assert!(state.is_tracked_or_ancestor("b/c.txt"));
		assert!(state.is_tracked_or_ancestor("b/deep/nested.txt"));
		assert!(!state.is_tracked_or_ancestor("other/c.txt"));
		assert!(!state.is_tracked_or_ancestor("bc.txt"));
	}

	#[test]
	fn test_is_unchanged_uses_rounded_metadata() {
		let mut state = SyncState { file_map: FileMap::new(), silent: false };
		state.track(FileInformation::file("a.txt", 10, 1000));

		assert!(state.is_unchanged(&FileInformation::file("a.txt", 10, 1000)));
		assert!(!state.is_unchanged(&FileInformation::file("a.txt", 10, 1001)));
		assert!(!state.is_unchanged(&FileInformation::file("missing.txt", 10, 1000)));
	}
}

// vim: ts=4
