//! Keyword scanning over the raw exec stream
//!
//! The exec channel interleaves plain-text marker lines with binary archive
//! payloads on the same byte stream. The scanner locates a literal keyword
//! standing alone on a line without assuming it arrives in one read: the
//! last line fragment of each chunk is carried over as an overlap until the
//! next chunk proves it complete, so a keyword split across read boundaries
//! is still detected.
//!
//! End-of-stream before the keyword is not an error. The remote process may
//! exit immediately after emitting its last marker, and stopping a session
//! closes the channel under a blocked read; both must unblock cleanly.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::SyncError;

const CHUNK_SIZE: usize = 512;

/// Scanner state shared by `read_till` and `wait_till`
struct Scanner {
	keyword: String,
	overlap: String,
	lines: Vec<String>,
	found: bool,
}

impl Scanner {
	fn new(keyword: &str) -> Self {
		Scanner {
			keyword: keyword.to_string(),
			overlap: String::new(),
			lines: Vec::new(),
			found: false,
		}
	}

	/// Feed one chunk of bytes, splitting into lines with overlap carry.
	///
	/// The first fragment completes the held overlap (unless the chunk has
	/// no newline at all, in which case it only extends it); the last
	/// fragment becomes the new overlap; everything between is a complete
	/// line.
	fn feed(&mut self, chunk: &[u8]) {
		let text = String::from_utf8_lossy(chunk);
		let parts: Vec<&str> = text.split('\n').collect();

		for (index, part) in parts.iter().enumerate() {
			let mut line: Option<String> = None;

			if index == 0 {
				if parts.len() > 1 {
					line = Some(std::mem::take(&mut self.overlap) + part);
				} else {
					self.overlap.push_str(part);
				}
			} else if index == parts.len() - 1 {
				self.overlap = part.to_string();
			} else {
				line = Some(part.to_string());
			}

			if let Some(line) = line {
				if line == self.keyword {
					self.found = true;
					return;
				}
				self.lines.push(line);
			} else if self.overlap == self.keyword {
				self.found = true;
				return;
			}
		}
	}

	/// Flush a pending non-keyword overlap at end-of-stream
	fn finish(&mut self) {
		if !self.found && !self.overlap.is_empty() {
			let overlap = std::mem::take(&mut self.overlap);
			if overlap == self.keyword {
				self.found = true;
			} else {
				self.lines.push(overlap);
			}
		}
	}

	fn into_output(self) -> String {
		self.lines.join("\n")
	}
}

/// Consume the stream until `keyword` appears alone on a line, returning
/// the text read before it.
///
/// The keyword itself is not part of the returned text. End-of-stream
/// before the keyword is not an error: whatever was accumulated is
/// returned. Any other read failure is a transport error.
pub async fn read_till<R>(keyword: &str, reader: &mut R) -> Result<String, SyncError>
where
	R: AsyncRead + Unpin,
{
	let mut scanner = Scanner::new(keyword);
	let mut buf = [0u8; CHUNK_SIZE];

	while !scanner.found {
		let n = reader
			.read(&mut buf)
			.await
			.map_err(|e| SyncError::transport("read from exec stream", e))?;
		if n == 0 {
			scanner.finish();
			break;
		}
		scanner.feed(&buf[..n]);
	}

	Ok(scanner.into_output())
}

/// Consume the stream until `keyword` appears alone on a line, discarding
/// everything read.
///
/// Returns Ok if the stream ends before the keyword appears; only a read
/// failure distinct from clean end-of-stream is an error.
pub async fn wait_till<R>(keyword: &str, reader: &mut R) -> Result<(), SyncError>
where
	R: AsyncRead + Unpin,
{
	let mut scanner = Scanner::new(keyword);
	let mut buf = [0u8; CHUNK_SIZE];

	while !scanner.found {
		let n = reader
			.read(&mut buf)
			.await
			.map_err(|e| SyncError::transport("read from exec stream", e))?;
		if n == 0 {
			break;
		}
		scanner.feed(&buf[..n]);
		scanner.lines.clear();
	}

	Ok(())
}

/// Read a single header line byte by byte.
///
/// Used for the `ARCHIVE:<len>` header directly preceding a binary
/// payload: reading one byte at a time guarantees no payload bytes are
/// consumed past the newline. Header lines are short, so this stays cheap.
pub async fn read_header_line<R>(reader: &mut R) -> Result<String, SyncError>
where
	R: AsyncRead + Unpin,
{
	let mut line = Vec::new();
	let mut byte = [0u8; 1];

	loop {
		let n = reader
			.read(&mut byte)
			.await
			.map_err(|e| SyncError::transport("read header line", e))?;
		if n == 0 || byte[0] == b'\n' {
			break;
		}
		line.push(byte[0]);
	}

	Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::pin::Pin;
	use std::task::{Context, Poll};
	use tokio::io::ReadBuf;

	/// Reader that hands out the input in fixed-size chunks, so tests can
	/// force any split of the byte stream across read calls.
	struct ChunkedReader {
		data: Vec<u8>,
		pos: usize,
		chunk: usize,
	}

	impl ChunkedReader {
		fn new(data: impl Into<Vec<u8>>, chunk: usize) -> Self {
			ChunkedReader { data: data.into(), pos: 0, chunk }
		}
	}

	impl AsyncRead for ChunkedReader {
		fn poll_read(
			self: Pin<&mut Self>,
			_cx: &mut Context<'_>,
			buf: &mut ReadBuf<'_>,
		) -> Poll<std::io::Result<()>> {
			let me = self.get_mut();
			if me.pos >= me.data.len() {
				return Poll::Ready(Ok(()));
			}
			let end = (me.pos + me.chunk).min(me.data.len()).min(me.pos + buf.remaining());
			buf.put_slice(&me.data[me.pos..end]);
			me.pos = end;
			Poll::Ready(Ok(()))
		}
	}

	#[tokio::test]
	async fn test_read_till_returns_preceding_text() {
		let mut reader = ChunkedReader::new("status line\ndone\ntrailing", 512);
		let output = read_till("done", &mut reader).await.unwrap();
		assert_eq!(output, "status line");
	}

	#[tokio::test]
	async fn test_read_till_chunking_invariance() {
		let body = "alpha\nbeta\n\ngamma";
		let input = format!("{}\ndone\ntail data", body);

		for chunk in 1..=input.len() {
			let mut reader = ChunkedReader::new(input.as_bytes(), chunk);
			let output = read_till("done", &mut reader).await.unwrap();
			assert_eq!(output, body, "chunk size {}", chunk);
		}
	}

	#[tokio::test]
	async fn test_keyword_split_across_chunk_boundary() {
		// 2-byte chunks split "done" in the middle of the keyword
		let mut reader = ChunkedReader::new("x\ndone\n", 2);
		wait_till("done", &mut reader).await.unwrap();
	}

	#[tokio::test]
	async fn test_multiple_lines_in_one_chunk() {
		let mut reader = ChunkedReader::new("a\nb\ndone\nc\n", 512);
		let output = read_till("done", &mut reader).await.unwrap();
		assert_eq!(output, "a\nb");
	}

	#[tokio::test]
	async fn test_wait_till_eof_is_not_an_error() {
		let mut reader = ChunkedReader::new("no keyword here\n", 3);
		assert!(wait_till("done", &mut reader).await.is_ok());
	}

	#[tokio::test]
	async fn test_read_till_eof_returns_accumulated() {
		let mut reader = ChunkedReader::new("partial\noutput", 4);
		let output = read_till("done", &mut reader).await.unwrap();
		assert_eq!(output, "partial\noutput");
	}

	#[tokio::test]
	async fn test_keyword_must_stand_alone() {
		let mut reader = ChunkedReader::new("well done\ndone\n", 512);
		let output = read_till("done", &mut reader).await.unwrap();
		assert_eq!(output, "well done");
	}

	#[tokio::test]
	async fn test_keyword_as_final_unterminated_line() {
		let mut reader = ChunkedReader::new("text\ndone", 512);
		let output = read_till("done", &mut reader).await.unwrap();
		assert_eq!(output, "text");
	}

	#[tokio::test]
	async fn test_read_header_line_stops_at_newline() {
		let mut reader = ChunkedReader::new("ARCHIVE:42\nBINARYBYTES", 512);
		let header = read_header_line(&mut reader).await.unwrap();
		assert_eq!(header, "ARCHIVE:42");

		// The payload after the newline is untouched
		let mut rest = Vec::new();
		tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest).await.unwrap();
		assert_eq!(rest, b"BINARYBYTES");
	}
}

// vim: ts=4
