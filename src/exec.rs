//! Remote exec channel abstraction
//!
//! The cluster API is an external collaborator: all the engine needs from
//! it is a duplex byte stream attached to an exec session inside a target
//! container. `KubectlExecClient` is the provided process-backed
//! implementation; tests substitute in-memory duplex streams.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::SyncError;

/// Identifies the container an exec session attaches to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodHandle {
	pub namespace: String,
	pub pod: String,
	pub container: String,
}

impl PodHandle {
	pub fn new(
		namespace: impl Into<String>,
		pod: impl Into<String>,
		container: impl Into<String>,
	) -> Self {
		PodHandle { namespace: namespace.into(), pod: pod.into(), container: container.into() }
	}
}

/// Duplex byte stream of one exec session.
///
/// `stdin` carries archive payloads and command text; `stdout` carries
/// archive payloads, status lines and keyword markers.
pub struct ExecStream {
	pub stdin: Box<dyn AsyncWrite + Send + Sync + Unpin>,
	pub stdout: Box<dyn AsyncRead + Send + Sync + Unpin>,

	/// Keeps a backing process alive for the lifetime of the stream
	_child: Option<Child>,
}

impl ExecStream {
	pub fn new(
		stdin: Box<dyn AsyncWrite + Send + Sync + Unpin>,
		stdout: Box<dyn AsyncRead + Send + Sync + Unpin>,
	) -> Self {
		ExecStream { stdin, stdout, _child: None }
	}

	fn with_child(
		stdin: Box<dyn AsyncWrite + Send + Sync + Unpin>,
		stdout: Box<dyn AsyncRead + Send + Sync + Unpin>,
		child: Child,
	) -> Self {
		ExecStream { stdin, stdout, _child: Some(child) }
	}
}

impl std::fmt::Debug for ExecStream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExecStream").field("child", &self._child.is_some()).finish()
	}
}

/// Opens exec sessions against a target container
#[async_trait]
pub trait ExecClient: Send + Sync {
	async fn exec(&self, target: &PodHandle, command: &[String]) -> Result<ExecStream, SyncError>;
}

/// Exec client that shells out to `kubectl exec -i`
pub struct KubectlExecClient {
	kubectl_path: String,
}

impl KubectlExecClient {
	pub fn new() -> Self {
		KubectlExecClient { kubectl_path: "kubectl".to_string() }
	}

	pub fn with_binary(kubectl_path: impl Into<String>) -> Self {
		KubectlExecClient { kubectl_path: kubectl_path.into() }
	}
}

impl Default for KubectlExecClient {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ExecClient for KubectlExecClient {
	async fn exec(&self, target: &PodHandle, command: &[String]) -> Result<ExecStream, SyncError> {
		let mut child = Command::new(&self.kubectl_path)
			.arg("exec")
			.arg("-i")
			.arg("-n")
			.arg(&target.namespace)
			.arg(&target.pod)
			.arg("-c")
			.arg(&target.container)
			.arg("--")
			.args(command)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()
			.map_err(|e| SyncError::Transport {
				message: format!("failed to spawn {} exec: {}", self.kubectl_path, e),
			})?;

		let stdin = child.stdin.take().ok_or_else(|| SyncError::Transport {
			message: "exec session has no stdin".to_string(),
		})?;
		let stdout = child.stdout.take().ok_or_else(|| SyncError::Transport {
			message: "exec session has no stdout".to_string(),
		})?;

		// Remote diagnostics surface on the local stderr
		if let Some(mut stderr) = child.stderr.take() {
			tokio::spawn(async move {
				let mut sink = tokio::io::stderr();
				let _ = crate::util::pipe_stream(&mut sink, &mut stderr).await;
			});
		}

		Ok(ExecStream::with_child(Box::new(stdin), Box::new(stdout), child))
	}
}

// vim: ts=4
