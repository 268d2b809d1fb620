//! Error types for podsync operations

use std::error::Error;
use std::fmt;
use std::io;

/// Main error type for sync operations
#[derive(Debug)]
pub enum SyncError {
	/// An exclude pattern failed to compile (fatal at session startup)
	Pattern { pattern: String, message: String },

	/// Read/write failure on the remote exec channel (fatal to a pipeline)
	Transport { message: String },

	/// The remote side reported an error or sent a malformed control line
	Protocol { message: String },

	/// Local I/O failure while applying a single entry (entry is skipped)
	Filesystem { path: String, source: io::Error },

	/// Filesystem watcher failure
	Watch { message: String },

	/// Invalid session lifecycle transition
	Session { message: String },
}

impl SyncError {
	/// Wrap an I/O error from the remote channel with context
	pub fn transport(context: &str, source: io::Error) -> Self {
		SyncError::Transport { message: format!("{}: {}", context, source) }
	}

	/// Wrap a local I/O error for one path
	pub fn filesystem(path: impl Into<String>, source: io::Error) -> Self {
		SyncError::Filesystem { path: path.into(), source }
	}

	/// True for errors that must stop the whole session
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			SyncError::Pattern { .. }
				| SyncError::Transport { .. }
				| SyncError::Protocol { .. }
				| SyncError::Session { .. }
		)
	}
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Pattern { pattern, message } => {
				write!(f, "Invalid exclude pattern '{}': {}", pattern, message)
			}
			SyncError::Transport { message } => write!(f, "Transport error: {}", message),
			SyncError::Protocol { message } => write!(f, "Protocol error: {}", message),
			SyncError::Filesystem { path, source } => {
				write!(f, "Filesystem error on {}: {}", path, source)
			}
			SyncError::Watch { message } => write!(f, "Watcher error: {}", message),
			SyncError::Session { message } => write!(f, "Session error: {}", message),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Filesystem { source, .. } => Some(source),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fatal_classification() {
		let transport = SyncError::Transport { message: "broken pipe".to_string() };
		assert!(transport.is_fatal());

		let fs = SyncError::filesystem(
			"a.txt",
			io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
		);
		assert!(!fs.is_fatal());
	}

	#[test]
	fn test_display_carries_cause() {
		let err = SyncError::transport(
			"write archive",
			io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"),
		);
		let text = err.to_string();
		assert!(text.contains("write archive"));
		assert!(text.contains("pipe closed"));
	}
}

// vim: ts=4
