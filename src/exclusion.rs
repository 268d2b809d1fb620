//! Gitignore-style exclusion matching
//!
//! Compiled once at session startup from the configured pattern list and
//! queried on every observed filesystem event in both directions. The
//! matcher is immutable after construction, so both pipelines call it
//! concurrently without synchronization.

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::SyncError;

/// Compiled exclusion predicate over canonical relative paths
pub struct ExcludeMatcher {
	gitignore: Option<Gitignore>,
}

impl ExcludeMatcher {
	/// Compile a list of gitignore-style patterns.
	///
	/// An empty list yields a matcher that rejects nothing. A syntactically
	/// invalid pattern fails compilation; the session aborts startup and
	/// does not retry.
	pub fn compile(patterns: &[String]) -> Result<Self, SyncError> {
		if patterns.is_empty() {
			return Ok(ExcludeMatcher { gitignore: None });
		}

		let mut builder = GitignoreBuilder::new("");
		for pattern in patterns {
			builder.add_line(None, pattern).map_err(|err| SyncError::Pattern {
				pattern: pattern.clone(),
				message: err.to_string(),
			})?;
		}

		let gitignore = builder.build().map_err(|err| SyncError::Pattern {
			pattern: patterns.join(", "),
			message: err.to_string(),
		})?;

		Ok(ExcludeMatcher { gitignore: Some(gitignore) })
	}

	/// Matcher that excludes nothing
	pub fn empty() -> Self {
		ExcludeMatcher { gitignore: None }
	}

	/// Whether a canonical relative path is excluded.
	///
	/// A leading `/` on the queried path is tolerated. A path whose parent
	/// directory matches is excluded as well.
	pub fn matches(&self, relative: &str, is_dir: bool) -> bool {
		let Some(gitignore) = &self.gitignore else {
			return false;
		};

		let relative = relative.strip_prefix('/').unwrap_or(relative);
		if relative.is_empty() {
			return false;
		}

		gitignore.matched_path_or_any_parents(relative, is_dir).is_ignore()
	}
}

impl std::fmt::Debug for ExcludeMatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExcludeMatcher")
			.field("compiled", &self.gitignore.is_some())
			.finish()
	}
}


// vim: ts=4
