//! Core data types shared by both pipelines

/// One tracked entry: the engine's last-known metadata for a relative path.
///
/// `name` is root-relative, slash-separated, with no leading dot or slash
/// (see `util::relative_from_full`). `mtime` is whole seconds since the
/// epoch; the archive transport truncates sub-second precision on both
/// ends, so nothing finer is ever stored or compared.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileInformation {
	pub name: String,
	pub is_directory: bool,
	pub size: u64,
	pub mtime: i64,
}

impl FileInformation {
	/// Descriptor for a directory (size and mtime are not meaningful)
	pub fn directory(name: impl Into<String>) -> Self {
		FileInformation { name: name.into(), is_directory: true, size: 0, mtime: 0 }
	}

	/// Descriptor for a regular file
	pub fn file(name: impl Into<String>, size: u64, mtime: i64) -> Self {
		FileInformation { name: name.into(), is_directory: false, size, mtime }
	}

	/// Whether another observation describes the same synchronized object.
	///
	/// Directories compare by kind only; files also compare size and the
	/// rounded mtime.
	pub fn is_same_as(&self, other: &FileInformation) -> bool {
		if self.is_directory != other.is_directory {
			return false;
		}
		if self.is_directory {
			return true;
		}
		self.size == other.size && self.mtime == other.mtime
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_directory_compares_by_kind() {
		let a = FileInformation::directory("b");
		let b = FileInformation { name: "b".to_string(), is_directory: true, size: 42, mtime: 7 };
		assert!(a.is_same_as(&b));
	}

	#[test]
	fn test_file_compares_size_and_mtime() {
		let a = FileInformation::file("a.txt", 10, 1000);
		assert!(a.is_same_as(&FileInformation::file("a.txt", 10, 1000)));
		assert!(!a.is_same_as(&FileInformation::file("a.txt", 11, 1000)));
		assert!(!a.is_same_as(&FileInformation::file("a.txt", 10, 1001)));
		assert!(!a.is_same_as(&FileInformation::directory("a.txt")));
	}
}

// vim: ts=4
