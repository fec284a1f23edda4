//! Discovery: populate the arena from the physical filesystem
//!
//! Entries are read depth-first in name order. Known records are resolved
//! through the store by path so IDs survive restarts, even for entries
//! that share a name. Unreadable entries are logged and skipped.

use std::fs;
use std::path::Path;

use super::{Directory, Tree};
use crate::error::{Result, SyncError};
use crate::exclusion::PatternMatcher;
use crate::file::File;
use crate::logging::*;
use crate::store::Store;
use crate::types::{ChecksumAlgorithm, DirId, DriveId};

/// Discovery settings
#[derive(Clone, Copy)]
pub struct Discovery<'a> {
	pub algorithm: ChecksumAlgorithm,
	pub matcher: Option<&'a PatternMatcher>,
	pub store: Option<&'a dyn Store>,
}

impl Default for Discovery<'_> {
	fn default() -> Self {
		Discovery { algorithm: ChecksumAlgorithm::default(), matcher: None, store: None }
	}
}

/// What one discovery pass found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
	pub dirs_added: usize,
	pub files_added: usize,
	/// Entries resolved to a stored record
	pub known: usize,
	pub excluded: usize,
	pub skipped: usize,
}

impl Tree {
	/// Read the physical directory behind `start` and everything below it.
	///
	/// Entries already in the tree (matched by path) are left alone, so a
	/// second pass only picks up new entries.
	pub fn discover(&mut self, start: &DirId, ctx: &Discovery<'_>) -> Result<DiscoveryReport> {
		let mut report = DiscoveryReport::default();
		self.discover_dir(start, ctx, &mut report)?;
		debug!(
			"discovery: {} dirs, {} files added ({} known, {} excluded, {} skipped)",
			report.dirs_added, report.files_added, report.known, report.excluded, report.skipped
		);
		Ok(report)
	}

	fn discover_dir(
		&mut self,
		dir_id: &DirId,
		ctx: &Discovery<'_>,
		report: &mut DiscoveryReport,
	) -> Result<()> {
		let dir = self.node(dir_id)?;
		let path = dir.path.clone();
		let owner = dir.owner_id.clone();
		let drive_id = dir.drive_id;
		let base = self.root().path.clone();

		let mut entries: Vec<fs::DirEntry> = fs::read_dir(&path)
			.map_err(|e| SyncError::io(&path, e))?
			.filter_map(|entry| match entry {
				Ok(e) => Some(e),
				Err(e) => {
					warn!("unreadable entry in {}: {}", path.display(), e);
					None
				}
			})
			.collect();
		entries.sort_by_key(|e| e.file_name());
		if entries.is_empty() {
			debug!("{} is empty", path.display());
		}

		for entry in entries {
			let entry_path = entry.path();
			let name = entry.file_name().to_string_lossy().into_owned();
			if let Some(matcher) = ctx.matcher {
				let rel = entry_path.strip_prefix(&base).unwrap_or(&entry_path);
				if matcher.is_excluded(rel) {
					report.excluded += 1;
					continue;
				}
			}

			let file_type = match entry.file_type() {
				Ok(t) => t,
				Err(e) => {
					warn!("cannot stat {}: {}", entry_path.display(), e);
					report.skipped += 1;
					continue;
				}
			};

			if file_type.is_dir() {
				let child = match self.child_dir_at(dir_id, &entry_path) {
					Some(id) => id,
					None => match self.discover_subdir(dir_id, &name, &entry_path, &owner, drive_id, ctx, report) {
						Ok(id) => id,
						Err(e) => {
							warn!("skipping {}: {}", entry_path.display(), e);
							report.skipped += 1;
							continue;
						}
					},
				};
				if let Err(e) = self.discover_dir(&child, ctx, report) {
					warn!("skipping contents of {}: {}", entry_path.display(), e);
					report.skipped += 1;
				}
			} else if file_type.is_file() {
				if self.has_file_at(dir_id, &entry_path) {
					continue;
				}
				if let Err(e) = self.discover_file(dir_id, &entry_path, &owner, ctx, report) {
					warn!("skipping {}: {}", entry_path.display(), e);
					report.skipped += 1;
				}
			} else {
				debug!("ignoring special entry {}", entry_path.display());
			}
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	fn discover_subdir(
		&mut self,
		parent: &DirId,
		name: &str,
		path: &Path,
		owner: &str,
		drive_id: DriveId,
		ctx: &Discovery<'_>,
		report: &mut DiscoveryReport,
	) -> Result<DirId> {
		let mut dir = Directory::new(name, owner, drive_id, path);
		let known = match ctx.store {
			Some(store) => store.get_directory_by_path(path)?,
			None => None,
		};

		match known {
			Some(rec) => {
				dir.id = rec.id;
				dir.protected = rec.protected;
				dir.key = rec.key;
				dir.endpoint = rec.endpoint;
				dir.overwrite = rec.overwrite;
				report.known += 1;
			}
			None => {
				if let Some(store) = ctx.store {
					if let Err(e) = store.add_dir(&dir) {
						error!("failed to persist dir {}: {}", path.display(), e);
					}
				}
			}
		}

		let id = dir.id;
		if self.add_subdir(parent, dir)? {
			report.dirs_added += 1;
		}
		Ok(id)
	}

	fn discover_file(
		&mut self,
		dir_id: &DirId,
		path: &Path,
		owner: &str,
		ctx: &Discovery<'_>,
		report: &mut DiscoveryReport,
	) -> Result<()> {
		let mut file = File::discover(path, owner, ctx.algorithm)?;
		let known = match ctx.store {
			Some(store) => store.get_file_by_path(path)?,
			None => None,
		};

		match known {
			Some(rec) => {
				file.id = rec.id;
				file.protected = rec.protected;
				file.key = rec.key;
				file.endpoint = rec.endpoint;
				report.known += 1;
			}
			None => {
				if let Some(store) = ctx.store {
					if let Err(e) = store.add_file(&file) {
						error!("failed to persist file {}: {}", path.display(), e);
					}
				}
			}
		}

		if self.add_file(dir_id, file)? {
			report.files_added += 1;
		}
		Ok(())
	}

	fn child_dir_at(&self, dir_id: &DirId, path: &Path) -> Option<DirId> {
		let dir = self.nodes.get(dir_id)?;
		dir.dirs.iter().copied().find(|c| self.nodes.get(c).map(|d| d.path == path).unwrap_or(false))
	}

	fn has_file_at(&self, dir_id: &DirId, path: &Path) -> bool {
		self.nodes
			.get(dir_id)
			.map(|d| d.files.values().any(|f| f.path == path))
			.unwrap_or(false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemoryStore;
	use tempfile::TempDir;

	fn populate(root: &Path) {
		fs::write(root.join("a.txt"), b"a").unwrap();
		fs::write(root.join("b.log"), b"b").unwrap();
		fs::create_dir_all(root.join("sub/deeper")).unwrap();
		fs::write(root.join("sub/c.txt"), b"c").unwrap();
		fs::write(root.join("sub/deeper/d.txt"), b"d").unwrap();
		fs::create_dir(root.join("empty")).unwrap();
	}

	fn tree_at(path: &Path) -> Tree {
		Tree::new(Directory::new_root("root", "owner", DriveId::new(), path))
	}

	#[test]
	fn test_discover_depth_first() {
		let tmp = TempDir::new().unwrap();
		populate(tmp.path());
		let mut tree = tree_at(tmp.path());
		let root = tree.root_id();

		let report = tree.discover(&root, &Discovery::default()).unwrap();
		assert_eq!(report.files_added, 4);
		assert_eq!(report.dirs_added, 3);
		assert_eq!(tree.walk_fs(&root).len(), 4);
		assert!(tree.validate().is_ok());

		let deep = tree.walk_fs(&root).values().find(|f| f.name == "d.txt").map(|f| f.dir_id).unwrap();
		let deeper = tree.get(&deep.unwrap()).unwrap();
		assert_eq!(deeper.name, "deeper");
		assert_eq!(tree.parent(&deeper.id).unwrap().name, "sub");
	}

	#[test]
	fn test_rediscovery_adds_only_new_entries() {
		let tmp = TempDir::new().unwrap();
		populate(tmp.path());
		let mut tree = tree_at(tmp.path());
		let root = tree.root_id();
		tree.discover(&root, &Discovery::default()).unwrap();

		fs::write(tmp.path().join("sub/new.txt"), b"new").unwrap();
		let report = tree.discover(&root, &Discovery::default()).unwrap();
		assert_eq!(report.files_added, 1);
		assert_eq!(report.dirs_added, 0);
		assert_eq!(tree.file_count(), 5);
	}

	#[test]
	fn test_discover_applies_exclusions() {
		let tmp = TempDir::new().unwrap();
		populate(tmp.path());
		let matcher = PatternMatcher::new(&["*.log".to_string(), "sub".to_string()]).unwrap();
		let mut tree = tree_at(tmp.path());
		let root = tree.root_id();

		let ctx = Discovery { matcher: Some(&matcher), ..Discovery::default() };
		let report = tree.discover(&root, &ctx).unwrap();
		assert_eq!(report.excluded, 2);
		assert_eq!(report.files_added, 1);
		assert_eq!(tree.dir_count(), 2);
	}

	#[test]
	fn test_discover_reuses_stored_ids() {
		let tmp = TempDir::new().unwrap();
		populate(tmp.path());
		let store = MemoryStore::new();
		let ctx = Discovery { store: Some(&store), ..Discovery::default() };

		let mut first = tree_at(tmp.path());
		let root = first.root_id();
		first.discover(&root, &ctx).unwrap();
		assert_eq!(store.file_count(), 4);
		assert_eq!(store.dir_count(), 3);
		let ids: Vec<_> = first.walk_fs(&root).keys().copied().collect();

		let mut second = tree_at(tmp.path());
		let root2 = second.root_id();
		let report = second.discover(&root2, &ctx).unwrap();
		assert_eq!(report.known, 7);
		let mut again: Vec<_> = second.walk_fs(&root2).keys().copied().collect();
		again.sort();
		let mut ids = ids;
		ids.sort();
		assert_eq!(ids, again);
	}

	#[test]
	fn test_same_names_keep_their_ids() {
		let tmp = TempDir::new().unwrap();
		for sub in ["x", "y"] {
			fs::create_dir_all(tmp.path().join(sub).join("inner")).unwrap();
			fs::write(tmp.path().join(sub).join("a.txt"), sub.as_bytes()).unwrap();
		}
		let store = MemoryStore::new();
		let ctx = Discovery { store: Some(&store), ..Discovery::default() };

		let snapshot = |tree: &Tree| {
			let root = tree.root_id();
			let mut files: Vec<_> = tree.walk_fs(&root).values().map(|f| (f.path.clone(), f.id)).collect();
			let mut dirs: Vec<_> = tree.walk_ds(&root).values().map(|d| (d.path.clone(), d.id)).collect();
			files.sort();
			dirs.sort();
			(files, dirs)
		};

		let mut first = tree_at(tmp.path());
		let root = first.root_id();
		first.discover(&root, &ctx).unwrap();
		let before = snapshot(&first);

		for _ in 0..2 {
			let mut again = tree_at(tmp.path());
			let root = again.root_id();
			let report = again.discover(&root, &ctx).unwrap();
			assert_eq!(report.known, 6);
			assert_eq!(snapshot(&again), before);
		}
		assert_eq!(store.file_count(), 2);
		assert_eq!(store.dir_count(), 4);
	}

	#[test]
	fn test_discover_missing_start_is_io_error() {
		let mut tree = tree_at(Path::new("/nonexistent/sfsync/root"));
		let root = tree.root_id();
		let result = tree.discover(&root, &Discovery::default());
		assert!(matches!(result, Err(SyncError::Io { .. })));
	}
}

// vim: ts=4
