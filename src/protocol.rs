//! Wire contract between the engine and its remote agent
//!
//! The exec channel carries colon-separated control lines and keyword
//! markers interleaved with length-prefixed binary tar payloads. The
//! literal strings here must match the remote agent exactly on both ends.

use crate::error::SyncError;
use crate::types::FileInformation;

/// Emitted by the remote agent once it is ready to process commands
pub const READY: &str = "READY";

/// Acknowledges a fully processed batch
pub const DONE: &str = "DONE";

/// Prefix of an error status line from the remote agent
pub const ERROR_PREFIX: &str = "ERROR:";

/// Terminates a multi-line command
pub const END: &str = ".";

/// Header announcing a tar payload of the given byte length
pub const CMD_ARCHIVE: &str = "ARCHIVE";

/// Requests removal of one path
pub const CMD_REMOVE: &str = "REMOVE";

/// Requests a full listing of the destination root
pub const CMD_LIST: &str = "LIST";

/// Requests a tar payload for the listed paths
pub const CMD_GET: &str = "GET";

/// Command line for the long-lived upstream agent
pub fn upstream_command(dest_path: &str) -> Vec<String> {
	vec!["podsync-agent".to_string(), "apply".to_string(), dest_path.to_string()]
}

/// Command line for the long-lived downstream agent
pub fn downstream_command(dest_path: &str) -> Vec<String> {
	vec!["podsync-agent".to_string(), "watch".to_string(), dest_path.to_string()]
}

/// Header line announcing an archive payload
pub fn archive_header(len: usize) -> String {
	format!("{}:{}\n", CMD_ARCHIVE, len)
}

/// Parse an `ARCHIVE:<len>` header into the payload length
pub fn parse_archive_header(line: &str) -> Result<usize, SyncError> {
	let fields = parse_fields(line, 2)?;
	if fields[0] != CMD_ARCHIVE {
		return Err(SyncError::Protocol {
			message: format!("expected {} header, got: {}", CMD_ARCHIVE, line.trim()),
		});
	}
	fields[1].parse().map_err(|_| SyncError::Protocol {
		message: format!("invalid archive length in header: {}", line.trim()),
	})
}

/// Parse one listing line of the form `F|D:<mtime>:<size>:<path>`.
///
/// The path field is last and may itself contain colons.
pub fn parse_list_line(line: &str) -> Result<FileInformation, SyncError> {
	let fields: Vec<&str> = line.trim().splitn(4, ':').collect();
	if fields.len() < 4 {
		return Err(SyncError::Protocol {
			message: format!("expected 4 fields in listing line: {}", line.trim()),
		});
	}

	let is_directory = match fields[0] {
		"F" => false,
		"D" => true,
		other => {
			return Err(SyncError::Protocol {
				message: format!("unknown entry kind '{}' in listing line: {}", other, line.trim()),
			})
		}
	};

	let mtime: i64 = fields[1].parse().map_err(|_| SyncError::Protocol {
		message: format!("invalid mtime in listing line: {}", line.trim()),
	})?;
	let size: u64 = fields[2].parse().map_err(|_| SyncError::Protocol {
		message: format!("invalid size in listing line: {}", line.trim()),
	})?;

	let name = fields[3].strip_prefix('/').unwrap_or(fields[3]).to_string();

	Ok(FileInformation { name, is_directory, size, mtime })
}

/// Split a colon-separated control line, validating minimum field count
pub fn parse_fields(line: &str, expected: usize) -> Result<Vec<&str>, SyncError> {
	let fields: Vec<&str> = line.trim().split(':').collect();
	if fields.len() < expected {
		return Err(SyncError::Protocol {
			message: format!(
				"expected {} fields, got {} in line: {}",
				expected,
				fields.len(),
				line.trim()
			),
		});
	}
	Ok(fields)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_archive_header_round_trip() {
		let header = archive_header(4096);
		assert_eq!(parse_archive_header(header.trim()).unwrap(), 4096);
	}

	#[test]
	fn test_parse_list_line_file() {
		let info = parse_list_line("F:1700000000:10:a.txt").unwrap();
		assert_eq!(info.name, "a.txt");
		assert!(!info.is_directory);
		assert_eq!(info.size, 10);
		assert_eq!(info.mtime, 1700000000);
	}

	#[test]
	fn test_parse_list_line_directory() {
		let info = parse_list_line("D:1700000000:0:b").unwrap();
		assert!(info.is_directory);
		assert_eq!(info.name, "b");
	}

	#[test]
	fn test_parse_list_line_path_with_colon() {
		let info = parse_list_line("F:0:1:weird:name.txt").unwrap();
		assert_eq!(info.name, "weird:name.txt");
	}

	#[test]
	fn test_parse_list_line_rejects_garbage() {
		assert!(parse_list_line("X:0:0:foo").is_err());
		assert!(parse_list_line("F:abc:0:foo").is_err());
		assert!(parse_list_line("F:0:0").is_err());
	}
}

// vim: ts=4
