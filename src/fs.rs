//! Filesystem collaborator: raw stat of a path and directory listings

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Result of a stat call on an existing path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
	pub size: u64,
	pub modified: SystemTime,
	pub is_dir: bool,
}

/// Stat access used by the monitor and file entities
pub trait FileSystem: Send + Sync {
	/// Stat a path. `Ok(None)` means the path does not exist.
	fn stat(&self, path: &Path) -> io::Result<Option<FileStat>>;

	/// Paths directly inside a directory, sorted
	fn list(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

	fn exists(&self, path: &Path) -> bool {
		matches!(self.stat(path), Ok(Some(_)))
	}
}

/// The local disk
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileSystem for LocalFs {
	fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
		match std::fs::metadata(path) {
			Ok(meta) => Ok(Some(FileStat {
				size: meta.len(),
				modified: meta.modified()?,
				is_dir: meta.is_dir(),
			})),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e),
		}
	}

	fn list(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
		let mut paths = std::fs::read_dir(path)?.map(|entry| entry.map(|e| e.path())).collect::<io::Result<Vec<_>>>()?;
		paths.sort();
		Ok(paths)
	}
}


// vim: ts=4
