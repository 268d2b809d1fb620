//! Session orchestrator: lifecycle, transport setup and the watcher

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::downstream::Downstream;
use crate::error::SyncError;
use crate::exclusion::ExcludeMatcher;
use crate::exec::{ExecClient, PodHandle};
use crate::protocol::{downstream_command, upstream_command};
use crate::state::{SharedState, SyncState};
use crate::upstream::Upstream;
use crate::util::dir_exists;

/// Caller-facing knobs for a single session
#[derive(Debug, Clone)]
pub struct SessionOptions {
	pub watch_path: PathBuf,
	pub dest_path: String,
	pub pod: PodHandle,
	pub exclude_paths: Vec<String>,
	pub silent: bool,
	/// Start without background pipelines, for one-shot transfers
	pub testing: bool,
}

/// Immutable session configuration shared by both pipelines
pub struct SessionConfig {
	pub watch_path: PathBuf,
	pub dest_path: String,
	pub pod: PodHandle,
	pub exclude: ExcludeMatcher,
	pub testing: bool,
}

/// Lifecycle of a session, advanced only by start() and stop()
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
	Created,
	Starting,
	Running,
	Stopping,
	Stopped,
}

/// One synchronization session between a local directory and a pod path.
///
/// Owns the watcher, the shutdown channel and the pipeline tasks. Dropping
/// a running session without stop() leaves the remote agents to die with
/// their streams.
pub struct SyncSession {
	config: Arc<SessionConfig>,
	state: SharedState,
	status: Arc<std::sync::Mutex<SessionStatus>>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	watcher: Option<RecommendedWatcher>,
	tasks: Vec<JoinHandle<()>>,
	error_rx: Option<mpsc::UnboundedReceiver<SyncError>>,
}

impl SyncSession {
	pub fn new(options: SessionOptions) -> Result<Self, SyncError> {
		let exclude = if options.exclude_paths.is_empty() {
			ExcludeMatcher::empty()
		} else {
			ExcludeMatcher::compile(&options.exclude_paths)?
		};

		let config = Arc::new(SessionConfig {
			watch_path: options.watch_path,
			dest_path: options.dest_path,
			pod: options.pod,
			exclude,
			testing: options.testing,
		});
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Ok(SyncSession {
			config,
			state: SyncState::new(options.silent),
			status: Arc::new(std::sync::Mutex::new(SessionStatus::Created)),
			shutdown_tx,
			shutdown_rx,
			watcher: None,
			tasks: Vec::new(),
			error_rx: None,
		})
	}

	pub fn status(&self) -> SessionStatus {
		*self.status.lock().unwrap()
	}

	fn set_status(&self, status: SessionStatus) {
		*self.status.lock().unwrap() = status;
	}

	/// Establish both pipelines and transition to Running.
	///
	/// The initial upstream transfer completes before this returns, so a
	/// caller observing Running knows the remote tree is populated. With
	/// testing set, no background tasks or watcher are spawned.
	pub async fn start(&mut self, client: &dyn ExecClient) -> Result<(), SyncError> {
		// Refuse before touching the transport; the session stays startable
		if !dir_exists(&self.config.watch_path)? {
			return Err(SyncError::Session {
				message: format!(
					"watch path {} is not a directory",
					self.config.watch_path.display()
				),
			});
		}

		{
			let mut status = self.status.lock().unwrap();
			if *status != SessionStatus::Created {
				return Err(SyncError::Session {
					message: format!("cannot start session in state {:?}", *status),
				});
			}
			*status = SessionStatus::Starting;
		}

		if !self.state.lock().await.silent {
			info!(
				"[Sync] Starting {} <-> {}",
				self.config.watch_path.display(),
				self.config.dest_path
			);
		}

		let up_stream = client
			.exec(&self.config.pod, &upstream_command(&self.config.dest_path))
			.await?;
		let mut upstream = Upstream::new(up_stream, self.config.clone(), self.state.clone());
		upstream.start().await?;
		upstream.initial_sync().await?;

		if !self.config.testing {
			let down_stream = client
				.exec(&self.config.pod, &downstream_command(&self.config.dest_path))
				.await?;
			let mut downstream =
				Downstream::new(down_stream, self.config.clone(), self.state.clone());
			downstream.start().await?;

			let (event_tx, event_rx) = mpsc::unbounded_channel();
			self.watcher = Some(spawn_watcher(&self.config.watch_path, event_tx)?);

			let (error_tx, error_rx) = mpsc::unbounded_channel();
			self.error_rx = Some(error_rx);
			let active = Arc::new(AtomicUsize::new(2));

			self.tasks.push(self.spawn_pipeline(
				"Upstream",
				upstream.run(event_rx, self.shutdown_rx.clone()),
				error_tx.clone(),
				active.clone(),
			));
			self.tasks.push(self.spawn_pipeline(
				"Downstream",
				downstream.run(self.shutdown_rx.clone()),
				error_tx,
				active,
			));
		}

		self.set_status(SessionStatus::Running);
		Ok(())
	}

	fn spawn_pipeline(
		&self,
		name: &'static str,
		future: impl std::future::Future<Output = Result<(), SyncError>> + Send + 'static,
		error_tx: mpsc::UnboundedSender<SyncError>,
		active: Arc<AtomicUsize>,
	) -> JoinHandle<()> {
		let status = self.status.clone();
		let shutdown_tx = self.shutdown_tx.clone();

		tokio::spawn(async move {
			if let Err(err) = future.await {
				error!("[{}] {}", name, err);
				{
					let mut status = status.lock().unwrap();
					if *status == SessionStatus::Running {
						*status = SessionStatus::Stopping;
					}
				}
				let _ = shutdown_tx.send(true);
				let _ = error_tx.send(err);
			}
			// Last pipeline out marks the session stopped
			if active.fetch_sub(1, Ordering::SeqCst) == 1 {
				let mut status = status.lock().unwrap();
				if *status == SessionStatus::Stopping {
					*status = SessionStatus::Stopped;
				}
			}
		})
	}

	/// First fatal pipeline error, if one has been reported. None once the
	/// session ended cleanly or was never running in the background.
	pub async fn fatal_error(&mut self) -> Option<SyncError> {
		match self.error_rx.as_mut() {
			Some(rx) => rx.recv().await,
			None => None,
		}
	}

	/// Stop the session and wait for both pipelines to wind down. Safe to
	/// call more than once.
	pub async fn stop(&mut self) {
		if self.status() == SessionStatus::Stopped {
			return;
		}
		self.set_status(SessionStatus::Stopping);

		let _ = self.shutdown_tx.send(true);
		// Dropping the watcher closes the event channel as well
		self.watcher = None;

		let tasks: Vec<_> = self.tasks.drain(..).collect();
		for result in futures::future::join_all(tasks).await {
			if let Err(err) = result {
				debug!("[Sync] Pipeline task ended abnormally: {}", err);
			}
		}

		self.set_status(SessionStatus::Stopped);
		if !self.state.lock().await.silent {
			info!("[Sync] Stopped {}", self.config.watch_path.display());
		}
	}

	pub fn state(&self) -> SharedState {
		self.state.clone()
	}
}

fn spawn_watcher(
	watch_path: &Path,
	events: mpsc::UnboundedSender<PathBuf>,
) -> Result<RecommendedWatcher, SyncError> {
	let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
		match result {
			Ok(event) => {
				for path in event.paths {
					let _ = events.send(path);
				}
			}
			Err(err) => debug!("[Watcher] {}", err),
		}
	})
	.map_err(|err| SyncError::Watch { message: err.to_string() })?;

	watcher
		.watch(watch_path, RecursiveMode::Recursive)
		.map_err(|err| SyncError::Watch { message: err.to_string() })?;

	Ok(watcher)
}

/// One-shot transfer of a local file or directory into the pod.
///
/// For a single file the parent directory becomes the transfer root and
/// every sibling is excluded, so exactly that file lands under dest_path.
pub async fn copy_initial(
	client: &dyn ExecClient,
	pod: PodHandle,
	local_path: &Path,
	dest_path: &str,
	exclude_paths: &[String],
) -> Result<(), SyncError> {
	let metadata = std::fs::metadata(local_path)
		.map_err(|err| SyncError::filesystem(local_path.to_string_lossy(), err))?;

	let mut exclude_paths = exclude_paths.to_vec();
	let watch_path = if metadata.is_dir() {
		local_path.to_path_buf()
	} else {
		let parent = local_path
			.parent()
			.filter(|p| !p.as_os_str().is_empty())
			.ok_or_else(|| SyncError::Session {
				message: format!("no parent directory for {}", local_path.display()),
			})?;
		let name = local_path
			.file_name()
			.and_then(|n| n.to_str())
			.ok_or_else(|| SyncError::Session {
				message: format!("invalid file name {}", local_path.display()),
			})?;

		// Exclude every sibling so only the requested file transfers
		let entries = std::fs::read_dir(parent)
			.map_err(|err| SyncError::filesystem(parent.to_string_lossy(), err))?;
		for entry in entries {
			let entry = entry.map_err(|err| SyncError::filesystem(parent.to_string_lossy(), err))?;
			if let Some(sibling) = entry.file_name().to_str() {
				if sibling != name {
					exclude_paths.push(format!("/{}", sibling));
				}
			}
		}
		parent.to_path_buf()
	};

	let mut session = SyncSession::new(SessionOptions {
		watch_path,
		dest_path: dest_path.to_string(),
		pod,
		exclude_paths,
		silent: true,
		testing: true,
	})?;
	session.start(client).await?;
	session.stop().await;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_new_session_is_created() {
		let session = SyncSession::new(SessionOptions {
			watch_path: PathBuf::from("/tmp/does-not-matter"),
			dest_path: "/app".to_string(),
			pod: PodHandle::new("default", "pod", "main"),
			exclude_paths: vec!["*.log".to_string()],
			silent: true,
			testing: true,
		})
		.unwrap();
		assert_eq!(session.status(), SessionStatus::Created);
	}

	#[test]
	fn test_invalid_exclude_pattern_is_rejected() {
		let result = SyncSession::new(SessionOptions {
			watch_path: PathBuf::from("/tmp"),
			dest_path: "/app".to_string(),
			pod: PodHandle::new("default", "pod", "main"),
			exclude_paths: vec!["a{b".to_string()],
			silent: true,
			testing: true,
		});
		assert!(matches!(result, Err(SyncError::Pattern { .. })));
	}

	#[tokio::test]
	async fn test_stop_is_idempotent() {
		let mut session = SyncSession::new(SessionOptions {
			watch_path: PathBuf::from("/tmp"),
			dest_path: "/app".to_string(),
			pod: PodHandle::new("default", "pod", "main"),
			exclude_paths: Vec::new(),
			silent: true,
			testing: true,
		})
		.unwrap();
		session.stop().await;
		session.stop().await;
		assert_eq!(session.status(), SessionStatus::Stopped);
	}
}

// vim: ts=4
