//! Depth-first walks over the directory arena
//!
//! Every walk is a single pass starting at a given directory. Children are
//! visited in ID order, so results are deterministic for a given tree.

use std::collections::BTreeMap;

use super::{Directory, Tree};
use crate::error::Result;
use crate::file::File;
use crate::index::SyncIndex;
use crate::logging::*;
use crate::types::{DirId, FileId};

/// Outcome of [`Tree::walk_o`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkReport {
	pub visited: usize,
	pub failed: usize,
}

impl Tree {
	/// Find a file below `start`, stopping at the first match
	pub fn walk_f(&self, start: &DirId, id: &FileId) -> Option<&File> {
		let dir = self.nodes.get(start)?;
		if let Some(file) = dir.files.get(id) {
			return Some(file);
		}
		dir.dirs.iter().find_map(|child| self.walk_f(child, id))
	}

	/// Find a directory at or below `start`, stopping at the first match
	pub fn walk_d(&self, start: &DirId, id: &DirId) -> Option<&Directory> {
		let dir = self.nodes.get(start)?;
		if dir.id == *id {
			return Some(dir);
		}
		dir.dirs.iter().find_map(|child| self.walk_d(child, id))
	}

	/// Every file reachable from `start`
	pub fn walk_fs(&self, start: &DirId) -> BTreeMap<FileId, &File> {
		let mut out = BTreeMap::new();
		self.collect_files(start, &mut out);
		out
	}

	fn collect_files<'a>(&'a self, id: &DirId, out: &mut BTreeMap<FileId, &'a File>) {
		let Some(dir) = self.nodes.get(id) else {
			return;
		};
		for (fid, file) in &dir.files {
			out.insert(*fid, file);
		}
		for child in &dir.dirs {
			self.collect_files(child, out);
		}
	}

	/// Every directory below `start` (`start` itself excluded)
	pub fn walk_ds(&self, start: &DirId) -> BTreeMap<DirId, &Directory> {
		let mut out = BTreeMap::new();
		self.collect_dirs(start, &mut out);
		out
	}

	fn collect_dirs<'a>(&'a self, id: &DirId, out: &mut BTreeMap<DirId, &'a Directory>) {
		let Some(dir) = self.nodes.get(id) else {
			return;
		};
		for child in &dir.dirs {
			if let Some(node) = self.nodes.get(child) {
				out.insert(*child, node);
				self.collect_dirs(child, out);
			}
		}
	}

	/// Record the sync timestamp of every file below `start` that the
	/// index does not know yet. Known entries are left untouched.
	///
	/// Returns the number of newly indexed files.
	pub fn walk_s(&self, start: &DirId, idx: &mut SyncIndex) -> usize {
		let mut added = 0;
		for id in self.subtree_ids(start) {
			let Some(dir) = self.nodes.get(&id) else {
				continue;
			};
			for (fid, file) in &dir.files {
				if !idx.last_sync.contains_key(fid) {
					idx.last_sync.insert(*fid, file.last_sync);
					added += 1;
				}
			}
		}
		added
	}

	/// Queue every indexed file below `start` whose timestamp is strictly
	/// newer than the indexed one. Files the index has never seen are skipped.
	///
	/// Returns the number of files in the update set after the walk.
	pub fn walk_u(&self, start: &DirId, idx: &mut SyncIndex) -> usize {
		for id in self.subtree_ids(start) {
			let Some(dir) = self.nodes.get(&id) else {
				continue;
			};
			for (fid, file) in &dir.files {
				match idx.last_sync.get(fid) {
					Some(known) if file.last_sync > *known => {
						idx.to_update.insert(*fid, file.clone());
					}
					Some(_) => {}
					None => debug!("{} not indexed yet, skipping", file.name),
				}
			}
		}
		idx.to_update.len()
	}

	/// Apply `op` to every file below `start`. A failing file is logged and
	/// the walk continues with the rest.
	pub fn walk_o<F>(&mut self, start: &DirId, mut op: F) -> WalkReport
	where
		F: FnMut(&mut File) -> Result<()>,
	{
		let mut report = WalkReport::default();
		for id in self.subtree_ids(start) {
			let Some(dir) = self.nodes.get_mut(&id) else {
				continue;
			};
			for file in dir.files.values_mut() {
				report.visited += 1;
				if let Err(e) = op(file) {
					warn!("{} ({}): {}", file.path.display(), file.id, e);
					report.failed += 1;
				}
			}
		}
		report
	}

	/// Files directly owned by a directory
	pub fn get_files(&self, dir_id: &DirId) -> Vec<&File> {
		self.nodes.get(dir_id).map(|d| d.files.values().collect()).unwrap_or_default()
	}

	/// Direct children of a directory
	pub fn get_subdirs(&self, dir_id: &DirId) -> Vec<&Directory> {
		self.nodes
			.get(dir_id)
			.map(|d| d.dirs.iter().filter_map(|c| self.nodes.get(c)).collect())
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::SyncError;
	use crate::types::DriveId;
	use std::time::{Duration, SystemTime};

	// root -> a -> b, root -> c; two files per directory
	fn sample_tree() -> (Tree, Vec<DirId>, Vec<FileId>) {
		let drive = DriveId::new();
		let mut tree = Tree::new(Directory::new_root("root", "o", drive, "/virtual/root"));
		let root = tree.root_id();
		let mut dirs = vec![root];
		let mut files = Vec::new();

		let a = Directory::new("a", "o", drive, "/virtual/root/a");
		let b = Directory::new("b", "o", drive, "/virtual/root/a/b");
		let c = Directory::new("c", "o", drive, "/virtual/root/c");
		let (aid, bid, cid) = (a.id, b.id, c.id);
		tree.add_subdir(&root, a).unwrap();
		tree.add_subdir(&aid, b).unwrap();
		tree.add_subdir(&root, c).unwrap();
		dirs.extend([aid, bid, cid]);

		for d in &dirs {
			for i in 0..2 {
				let f = File::new(&format!("f{}", i), "o", format!("/virtual/{}/{}", d, i));
				files.push(f.id);
				tree.add_file(d, f).unwrap();
			}
		}
		(tree, dirs, files)
	}

	#[test]
	fn test_walk_fs_collects_everything_once() {
		let (tree, dirs, files) = sample_tree();
		let all = tree.walk_fs(&dirs[0]);
		assert_eq!(all.len(), files.len());
		assert!(files.iter().all(|f| all.contains_key(f)));

		// subtree a holds a and b
		assert_eq!(tree.walk_fs(&dirs[1]).len(), 4);
	}

	#[test]
	fn test_walk_f_and_walk_d() {
		let (tree, dirs, files) = sample_tree();
		let deep = files[5];
		assert_eq!(tree.walk_f(&dirs[0], &deep).map(|f| f.id), Some(deep));
		// not reachable from the sibling branch
		assert!(tree.walk_f(&dirs[3], &deep).is_none());

		assert_eq!(tree.walk_d(&dirs[0], &dirs[2]).map(|d| d.id), Some(dirs[2]));
		assert_eq!(tree.walk_d(&dirs[2], &dirs[2]).map(|d| d.id), Some(dirs[2]));
		assert!(tree.walk_d(&dirs[3], &dirs[1]).is_none());
	}

	#[test]
	fn test_walk_ds_excludes_start() {
		let (tree, dirs, _) = sample_tree();
		let found = tree.walk_ds(&dirs[0]);
		assert_eq!(found.len(), 3);
		assert!(!found.contains_key(&dirs[0]));
		assert_eq!(tree.walk_ds(&dirs[2]).len(), 0);
	}

	#[test]
	fn test_walk_s_merges() {
		let (tree, dirs, files) = sample_tree();
		let mut idx = SyncIndex::new("o");
		let pinned = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
		idx.last_sync.insert(files[0], pinned);

		assert_eq!(tree.walk_s(&dirs[0], &mut idx), files.len() - 1);
		assert_eq!(idx.last_sync.len(), files.len());
		assert_eq!(idx.last_sync[&files[0]], pinned);
		// second pass finds nothing new
		assert_eq!(tree.walk_s(&dirs[0], &mut idx), 0);
	}

	#[test]
	fn test_walk_u_only_newer() {
		let (mut tree, dirs, files) = sample_tree();
		let mut idx = SyncIndex::new("o");
		tree.walk_s(&dirs[0], &mut idx);

		let changed = files[3];
		let later = idx.last_sync[&changed] + Duration::from_secs(5);
		tree.file_mut(&changed).unwrap().touch(later);
		let stale = files[4];
		let earlier = idx.last_sync[&stale] - Duration::from_secs(5);
		tree.file_mut(&stale).unwrap().last_sync = earlier;

		assert_eq!(tree.walk_u(&dirs[0], &mut idx), 1);
		assert!(idx.to_update.contains_key(&changed));
	}

	#[test]
	fn test_walk_o_continues_past_failures() {
		let (mut tree, dirs, files) = sample_tree();
		let bad = files[2];
		let report = tree.walk_o(&dirs[0], |f| {
			if f.id == bad {
				return Err(SyncError::Other { message: "corrupt".into() });
			}
			f.name.push_str(".seen");
			Ok(())
		});

		assert_eq!(report, WalkReport { visited: files.len(), failed: 1 });
		let seen = tree.walk_fs(&dirs[0]).values().filter(|f| f.name.ends_with(".seen")).count();
		assert_eq!(seen, files.len() - 1);
	}

	#[test]
	fn test_direct_children() {
		let (tree, dirs, _) = sample_tree();
		assert_eq!(tree.get_files(&dirs[1]).len(), 2);
		let names: Vec<&str> = tree.get_subdirs(&dirs[0]).iter().map(|d| d.name.as_str()).collect();
		assert_eq!(names.len(), 2);
		assert!(names.contains(&"a") && names.contains(&"c"));
	}
}

// vim: ts=4
