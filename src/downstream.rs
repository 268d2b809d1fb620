//! Downstream pipeline: remote-side changes applied to the local tree

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::archive::extract_archive;
use crate::delete::delete_safe_recursive;
use crate::error::SyncError;
use crate::exec::ExecStream;
use crate::protocol::{parse_archive_header, parse_list_line, CMD_GET, CMD_LIST, DONE, END, ERROR_PREFIX, READY};
use crate::scan::{read_header_line, read_till, wait_till};
use crate::session::SessionConfig;
use crate::state::{FileMap, SharedState};
use crate::types::FileInformation;

/// How often the remote side is polled for a fresh listing
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Applies remote changes locally over its own long-lived exec stream
pub struct Downstream {
	stream: ExecStream,
	config: Arc<SessionConfig>,
	state: SharedState,
}

impl Downstream {
	pub fn new(stream: ExecStream, config: Arc<SessionConfig>, state: SharedState) -> Self {
		Downstream { stream, config, state }
	}

	/// Block until the remote agent signals readiness
	pub async fn start(&mut self) -> Result<(), SyncError> {
		wait_till(READY, &mut self.stream.stdout).await
	}

	/// Poll loop. Shutdown cancels an in-flight poll mid-read; the scanner
	/// treats the closed channel the same as end-of-stream.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
		let mut ticker = tokio::time::interval(POLL_INTERVAL);

		loop {
			tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				_ = ticker.tick() => {}
			}

			tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				result = self.poll_once() => {
					if let Err(err) = result {
						if err.is_fatal() {
							return Err(err);
						}
						// Transient local failure; the next poll retries
						warn!("[Downstream] Poll failed: {}", err);
					}
				}
			}
		}
	}

	/// One full listing round-trip plus application of the differences
	pub async fn poll_once(&mut self) -> Result<(), SyncError> {
		let remote = self.collect_changes().await?;
		self.apply_changes(remote).await
	}

	/// Request a destination-root listing from the remote agent
	async fn collect_changes(&mut self) -> Result<Vec<FileInformation>, SyncError> {
		self.stream
			.stdin
			.write_all(format!("{}\n", CMD_LIST).as_bytes())
			.await
			.map_err(|e| SyncError::transport("write list command", e))?;
		self.stream
			.stdin
			.flush()
			.await
			.map_err(|e| SyncError::transport("flush list command", e))?;

		let listing = read_till(DONE, &mut self.stream.stdout).await?;

		let mut entries = Vec::new();
		for line in listing.lines() {
			if line.is_empty() {
				continue;
			}
			if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
				return Err(SyncError::Protocol {
					message: format!("remote listing failed: {}", message.trim()),
				});
			}
			match parse_list_line(line) {
				Ok(info) => entries.push(info),
				// One garbled line must not poison the whole snapshot
				Err(err) => warn!("[Downstream] {}", err),
			}
		}

		Ok(entries)
	}

	/// Diff a remote snapshot against the tracker and apply the result.
	///
	/// Removals go first so a replaced path is not deleted right after
	/// being rewritten.
	pub async fn apply_changes(&mut self, remote: Vec<FileInformation>) -> Result<(), SyncError> {
		let (creates, removes) = self.diff(&remote).await;

		if !removes.is_empty() {
			self.apply_removes(&removes).await;
		}
		if !creates.is_empty() {
			self.apply_creates(&creates).await?;
		}

		Ok(())
	}

	async fn diff(
		&self,
		remote: &[FileInformation],
	) -> (Vec<FileInformation>, Vec<FileInformation>) {
		let state = self.state.lock().await;
		let mut seen: BTreeSet<&str> = BTreeSet::new();
		let mut creates = Vec::new();

		for info in remote {
			if self.config.exclude.matches(&info.name, info.is_directory) {
				continue;
			}
			seen.insert(info.name.as_str());
			if !state.is_unchanged(info) {
				creates.push(info.clone());
			}
		}

		let removes: Vec<FileInformation> = state
			.file_map
			.values()
			.filter(|tracked| !seen.contains(tracked.name.as_str()))
			.cloned()
			.collect();

		(creates, removes)
	}

	/// Fetch an archive of the given paths and unpack it onto the watch root
	pub async fn apply_creates(&mut self, creates: &[FileInformation]) -> Result<(), SyncError> {
		self.stream
			.stdin
			.write_all(format!("{}\n", CMD_GET).as_bytes())
			.await
			.map_err(|e| SyncError::transport("write get command", e))?;
		for info in creates {
			self.stream
				.stdin
				.write_all(format!("{}\n", info.name).as_bytes())
				.await
				.map_err(|e| SyncError::transport("write get path", e))?;
		}
		self.stream
			.stdin
			.write_all(format!("{}\n", END).as_bytes())
			.await
			.map_err(|e| SyncError::transport("write get terminator", e))?;
		self.stream
			.stdin
			.flush()
			.await
			.map_err(|e| SyncError::transport("flush get command", e))?;

		// Skip blank status lines; the first real line is the archive header
		let header = loop {
			let line = read_header_line(&mut self.stream.stdout).await?;
			if line.trim().is_empty() {
				continue;
			}
			if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
				return Err(SyncError::Protocol {
					message: format!("remote archive failed: {}", message.trim()),
				});
			}
			break line;
		};
		let len = parse_archive_header(&header)?;

		let mut data = vec![0u8; len];
		self.stream
			.stdout
			.read_exact(&mut data)
			.await
			.map_err(|e| SyncError::transport("read archive payload", e))?;
		wait_till(DONE, &mut self.stream.stdout).await?;

		let mut state = self.state.lock().await;
		let applied = extract_archive(&self.config.watch_path, &data)?;
		let count = applied.len();
		for info in applied {
			state.track(info);
		}
		debug!("[Downstream] Applied {} entries", count);

		Ok(())
	}

	/// Honor deletion notices under the double-confirmation guard.
	///
	/// A notice for a path the tracker has never seen (and has no tracked
	/// ancestor for) is logged and skipped, never applied. The session lock
	/// is held for the duration of the batch.
	pub async fn apply_removes(&mut self, removes: &[FileInformation]) {
		let mut state = self.state.lock().await;

		let mut remove_files = FileMap::new();
		for info in removes {
			if state.is_tracked_or_ancestor(&info.name) {
				remove_files.insert(info.name.clone(), info.clone());
			} else {
				debug!("[Downstream] Skip delete {}: not tracked", info.name);
			}
		}

		let file_map = &mut state.file_map;
		for (name, info) in &remove_files {
			if info.is_directory {
				delete_safe_recursive(&self.config.watch_path, name, file_map, &remove_files);
				continue;
			}

			let Some(tracked) = file_map.get(name) else {
				debug!("[Downstream] Skip delete {}", name);
				continue;
			};

			let absolute = self.config.watch_path.join(name);
			if !crate::delete::should_remove_local(&absolute, tracked) {
				debug!("[Downstream] Skip delete {}: modified locally", name);
				continue;
			}
			match std::fs::remove_file(&absolute) {
				Ok(()) => {
					debug!("[Downstream] Removed {}", name);
					file_map.remove(name);
				}
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
					file_map.remove(name);
				}
				Err(err) => {
					debug!("[Downstream] Skip file delete {}: {}", name, err);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::exclusion::ExcludeMatcher;
	use crate::exec::PodHandle;
	use crate::state::SyncState;
	use std::io::Write;
	use tempfile::TempDir;

	fn test_setup(tmp: &TempDir) -> (Arc<SessionConfig>, SharedState) {
		let config = Arc::new(SessionConfig {
			watch_path: tmp.path().to_path_buf(),
			dest_path: "/app".to_string(),
			pod: PodHandle::new("default", "pod", "main"),
			exclude: ExcludeMatcher::empty(),
			testing: true,
		});
		(config, SyncState::new(true))
	}

	fn test_downstream(config: Arc<SessionConfig>, state: SharedState) -> Downstream {
		let (_, rx) = tokio::io::duplex(64);
		let (tx, _) = tokio::io::duplex(64);
		let stream = ExecStream::new(Box::new(tx), Box::new(rx));
		Downstream::new(stream, config, state)
	}

	fn write_file(dir: &std::path::Path, name: &str, content: &[u8]) {
		let path = dir.join(name);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).unwrap();
		}
		let mut file = std::fs::File::create(path).unwrap();
		file.write_all(content).unwrap();
	}

	#[tokio::test]
	async fn test_untracked_deletion_notice_is_skipped() {
		let tmp = TempDir::new().unwrap();
		write_file(tmp.path(), "b/c.txt", b"out of band");

		let (config, state) = test_setup(&tmp);
		let mut downstream = test_downstream(config, state.clone());

		// Remote signals deletion of a path the tracker has never seen
		let notice = FileInformation::file("b/c.txt", 11, 0);
		downstream.apply_removes(&[notice]).await;

		assert!(tmp.path().join("b/c.txt").exists());
		assert!(state.lock().await.file_map.is_empty());
	}

	#[tokio::test]
	async fn test_tracked_deletion_notice_is_applied() {
		let tmp = TempDir::new().unwrap();
		write_file(tmp.path(), "a.txt", b"tracked");

		let (config, state) = test_setup(&tmp);
		let metadata = std::fs::metadata(tmp.path().join("a.txt")).unwrap();
		let info = FileInformation::file(
			"a.txt",
			metadata.len(),
			crate::util::mtime_from_metadata(&metadata),
		);
		state.lock().await.track(info.clone());

		let mut downstream = test_downstream(config, state.clone());
		downstream.apply_removes(&[info]).await;

		assert!(!tmp.path().join("a.txt").exists());
		assert!(!state.lock().await.is_tracked("a.txt"));
	}

	#[tokio::test]
	async fn test_diff_splits_creates_and_removes() {
		let tmp = TempDir::new().unwrap();
		let (config, state) = test_setup(&tmp);

		{
			let mut locked = state.lock().await;
			locked.track(FileInformation::file("same.txt", 5, 100));
			locked.track(FileInformation::file("gone.txt", 5, 100));
		}

		let downstream = test_downstream(config, state);
		let remote = vec![
			FileInformation::file("same.txt", 5, 100),
			FileInformation::file("new.txt", 7, 200),
			FileInformation::file("changed.txt", 9, 300),
		];
		{
			let mut locked = downstream.state.lock().await;
			locked.track(FileInformation::file("changed.txt", 9, 250));
		}

		let (creates, removes) = downstream.diff(&remote).await;

		let create_names: Vec<&str> = creates.iter().map(|c| c.name.as_str()).collect();
		assert_eq!(create_names, vec!["new.txt", "changed.txt"]);
		let remove_names: Vec<&str> = removes.iter().map(|r| r.name.as_str()).collect();
		assert_eq!(remove_names, vec!["gone.txt"]);
	}
}

// vim: ts=4
