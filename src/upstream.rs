//! Upstream pipeline: local filesystem changes out to the remote side

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::archive::create_archive;
use crate::error::SyncError;
use crate::exec::ExecStream;
use crate::protocol::{archive_header, CMD_REMOVE, DONE, END, ERROR_PREFIX, READY};
use crate::scan::{read_till, wait_till};
use crate::session::SessionConfig;
use crate::state::SharedState;
use crate::types::FileInformation;
use crate::util::{mtime_from_metadata, relative_from_full};

/// How long a batch keeps collecting events after the first one
const BATCH_QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Pushes local changes to the remote agent over one long-lived exec stream
pub struct Upstream {
	stream: ExecStream,
	config: Arc<SessionConfig>,
	state: SharedState,
}

impl Upstream {
	pub fn new(stream: ExecStream, config: Arc<SessionConfig>, state: SharedState) -> Self {
		Upstream { stream, config, state }
	}

	/// Block until the remote agent signals readiness
	pub async fn start(&mut self) -> Result<(), SyncError> {
		wait_till(READY, &mut self.stream.stdout).await
	}

	/// One batch covering the entire watch root.
	///
	/// A single directory descriptor with an empty name expands to the
	/// whole tree; directory creation is idempotent on both ends, so an
	/// already-populated destination is safe.
	pub async fn initial_sync(&mut self) -> Result<(), SyncError> {
		if !self.state.lock().await.silent {
			info!("[Upstream] Initial sync of {}", self.config.watch_path.display());
		}
		self.apply_creates(&[FileInformation::directory("")]).await
	}

	/// Stream a batch of creates/updates to the remote side as one archive.
	///
	/// Each transmitted path is recorded in the tracker once the payload is
	/// flushed; the call then blocks until the remote acknowledgment. There
	/// is no rollback: entries recorded before a failure stay recorded.
	pub async fn apply_creates(&mut self, entries: &[FileInformation]) -> Result<(), SyncError> {
		if entries.is_empty() {
			return Ok(());
		}

		let (data, written) =
			create_archive(&self.config.watch_path, &self.config.exclude, entries)?;

		self.stream
			.stdin
			.write_all(archive_header(data.len()).as_bytes())
			.await
			.map_err(|e| SyncError::transport("write archive header", e))?;
		self.stream
			.stdin
			.write_all(&data)
			.await
			.map_err(|e| SyncError::transport("write archive payload", e))?;
		self.stream
			.stdin
			.flush()
			.await
			.map_err(|e| SyncError::transport("flush archive payload", e))?;

		{
			let mut state = self.state.lock().await;
			for info in &written {
				state.track(info.clone());
			}
		}

		let output = read_till(DONE, &mut self.stream.stdout).await?;
		for line in output.lines() {
			if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
				return Err(SyncError::Protocol {
					message: format!("remote failed to apply batch: {}", message.trim()),
				});
			}
		}

		debug!("[Upstream] Applied {} entries", written.len());
		Ok(())
	}

	/// Ask the remote side to remove a batch of paths, then untrack them
	pub async fn apply_removes(&mut self, entries: &[FileInformation]) -> Result<(), SyncError> {
		if entries.is_empty() {
			return Ok(());
		}

		for entry in entries {
			let line = format!("{}:{}\n", CMD_REMOVE, entry.name);
			self.stream
				.stdin
				.write_all(line.as_bytes())
				.await
				.map_err(|e| SyncError::transport("write remove command", e))?;
		}
		self.stream
			.stdin
			.write_all(format!("{}\n", END).as_bytes())
			.await
			.map_err(|e| SyncError::transport("write remove terminator", e))?;
		self.stream
			.stdin
			.flush()
			.await
			.map_err(|e| SyncError::transport("flush remove batch", e))?;

		let output = read_till(DONE, &mut self.stream.stdout).await?;
		for line in output.lines() {
			if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
				return Err(SyncError::Protocol {
					message: format!("remote failed to remove batch: {}", message.trim()),
				});
			}
		}

		let mut state = self.state.lock().await;
		for entry in entries {
			state.untrack(&entry.name);
			if entry.is_directory {
				let prefix = format!("{}/", entry.name);
				state.file_map.retain(|name, _| !name.starts_with(&prefix));
			}
			debug!("[Upstream] Removed {}", entry.name);
		}

		Ok(())
	}

	/// Debounced batching loop over watcher events.
	///
	/// Batches are applied in the order they were generated. Transport and
	/// protocol failures abort the pipeline and surface to the session;
	/// shutdown cancels an in-flight batch mid-read, which the scanner
	/// treats the same as end-of-stream.
	pub async fn run(
		mut self,
		mut events: mpsc::UnboundedReceiver<PathBuf>,
		mut shutdown: watch::Receiver<bool>,
	) -> Result<(), SyncError> {
		loop {
			let first = tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				event = events.recv() => match event {
					Some(path) => path,
					None => return Ok(()),
				},
			};

			let mut touched = vec![first];
			while let Ok(Some(path)) =
				tokio::time::timeout(BATCH_QUIET_PERIOD, events.recv()).await
			{
				touched.push(path);
			}

			tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				result = self.process_batch(touched) => result?,
			}
		}
	}

	async fn process_batch(&mut self, touched: Vec<PathBuf>) -> Result<(), SyncError> {
		let (creates, removes) = self.collect_changes(touched).await;
		self.apply_creates(&creates).await?;
		self.apply_removes(&removes).await
	}

	/// Stat every touched path and diff it against the tracker
	async fn collect_changes(
		&self,
		touched: Vec<PathBuf>,
	) -> (Vec<FileInformation>, Vec<FileInformation>) {
		let mut creates = Vec::new();
		let mut removes = Vec::new();
		let mut seen = BTreeSet::new();

		let state = self.state.lock().await;
		for path in touched {
			let relative = relative_from_full(&path, &self.config.watch_path);
			if relative.is_empty() || !seen.insert(relative.clone()) {
				continue;
			}

			match std::fs::metadata(&path) {
				Ok(metadata) => {
					if self.config.exclude.matches(&relative, metadata.is_dir()) {
						continue;
					}
					let observed = if metadata.is_dir() {
						FileInformation::directory(relative)
					} else {
						FileInformation::file(
							relative,
							metadata.len(),
							mtime_from_metadata(&metadata),
						)
					};
					if !state.is_unchanged(&observed) {
						creates.push(observed);
					}
				}
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
					// Only ever remove what the engine has tracked
					if let Some(tracked) = state.get(&relative) {
						removes.push(tracked.clone());
					}
				}
				Err(err) => {
					debug!("[Upstream] Skip {}: {}", relative, err);
				}
			}
		}

		(creates, removes)
	}
}

// vim: ts=4
