//! Sync index: last-known sync timestamps and the working set of files due
//! for transfer
//!
//! Every key in `to_update` is also a key in `last_sync`: a file has to be
//! indexed once before it can be queued.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::{ItemKind, Result, StateError, SyncError};
use crate::file::File;
use crate::logging::*;
use crate::tree::Tree;
use crate::types::{DirId, FileId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncIndex {
	pub owner_id: String,

	/// File ID -> last time the file was synced
	pub last_sync: BTreeMap<FileId, SystemTime>,

	/// Files queued for the next transfer round
	pub to_update: BTreeMap<FileId, File>,
}

impl SyncIndex {
	pub fn new(owner_id: &str) -> Self {
		SyncIndex { owner_id: owner_id.to_string(), ..Default::default() }
	}

	/// Whether the file has been indexed at least once
	pub fn has_file(&self, id: &FileId) -> bool {
		self.last_sync.contains_key(id)
	}

	/// Both maps are populated
	pub fn is_mapped(&self) -> bool {
		!self.last_sync.is_empty() && !self.to_update.is_empty()
	}

	/// Files queued for transfer, in ID order
	pub fn files(&self) -> Vec<File> {
		if self.to_update.is_empty() {
			debug!("no files matched for syncing");
		}
		self.to_update.values().cloned().collect()
	}

	pub fn file_paths(&self) -> Vec<PathBuf> {
		self.to_update.values().map(|f| f.path.clone()).collect()
	}

	/// First sync of a file the index has never seen: record it and queue
	/// it right away. Returns false if the file was already indexed.
	pub fn index_new_file(&mut self, file: &File) -> bool {
		if self.has_file(&file.id) {
			return false;
		}
		self.last_sync.insert(file.id, file.last_sync);
		self.to_update.insert(file.id, file.clone());
		true
	}

	/// Record a completed transfer and drop the file from the working set
	pub fn mark_synced(&mut self, id: &FileId, time: SystemTime) -> Result<()> {
		match self.last_sync.get_mut(id) {
			Some(t) => {
				*t = time;
				self.to_update.remove(id);
				Ok(())
			}
			None => Err(SyncError::not_found(ItemKind::File, id)),
		}
	}

	/// Forget a file entirely
	pub fn remove(&mut self, id: &FileId) -> bool {
		self.to_update.remove(id);
		self.last_sync.remove(id).is_some()
	}

	/// Clear the working set between cycles. Timestamps are kept.
	pub fn reset(&mut self) {
		self.to_update.clear();
	}

	/// Check the queued-implies-indexed invariant
	pub fn validate(&self) -> Result<()> {
		match self.to_update.keys().find(|id| !self.last_sync.contains_key(id)) {
			Some(id) => Err(StateError::Corrupted {
				message: format!("file {} queued without an index entry", id),
			}
			.into()),
			None => Ok(()),
		}
	}

	// ----------- handshake payload

	pub fn to_json(&self) -> Result<String> {
		Ok(serde_json::to_string_pretty(self)?)
	}

	pub fn from_json(data: &str) -> Result<Self> {
		let idx: SyncIndex = serde_json::from_str(data)?;
		idx.validate()?;
		Ok(idx)
	}
}

/// Index every file reachable from `start`
pub fn build_sync_index(owner_id: &str, tree: &Tree, start: &DirId) -> SyncIndex {
	let mut idx = SyncIndex::new(owner_id);
	let n = tree.walk_s(start, &mut idx);
	debug!("sync index for {} built with {} files", owner_id, n);
	idx
}

/// Queue every indexed file whose timestamp moved past the indexed one.
/// Returns the size of the working set.
pub fn build_to_update(tree: &Tree, start: &DirId, idx: &mut SyncIndex) -> usize {
	tree.walk_u(start, idx)
}

/// Reconcile two independently built indices.
///
/// For every file ID present in both, the result keeps the more recent
/// timestamp, and takes the queued entry from `new` wherever `orig` is
/// staler.
pub fn compare(orig: &SyncIndex, new: &SyncIndex) -> SyncIndex {
	let mut out = SyncIndex::new(&orig.owner_id);
	for (id, orig_time) in &orig.last_sync {
		let Some(new_time) = new.last_sync.get(id) else {
			continue;
		};
		out.last_sync.insert(*id, (*orig_time).max(*new_time));
		if new_time > orig_time {
			if let Some(file) = new.to_update.get(id) {
				out.to_update.insert(*id, file.clone());
			}
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tree::Directory;
	use crate::types::DriveId;
	use std::fs;
	use std::time::Duration;
	use tempfile::TempDir;

	fn at(secs: u64) -> SystemTime {
		SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
	}

	fn small_tree(tmp: &TempDir, n: usize) -> (Tree, Vec<FileId>) {
		let mut tree = Tree::new(Directory::new_root("root", "o", DriveId::new(), tmp.path()));
		let root = tree.root_id();
		let mut ids = Vec::new();
		for i in 0..n {
			let path = tmp.path().join(format!("f{}", i));
			fs::write(&path, [i as u8]).unwrap();
			let f = File::discover(path, "o", Default::default()).unwrap();
			ids.push(f.id);
			tree.add_file(&root, f).unwrap();
		}
		(tree, ids)
	}

	#[test]
	fn test_fresh_index_has_nothing_to_update() {
		let tmp = TempDir::new().unwrap();
		let (tree, ids) = small_tree(&tmp, 5);
		let idx = build_sync_index("o", &tree, &tree.root_id());
		assert_eq!(idx.last_sync.len(), ids.len());
		assert!(idx.to_update.is_empty());
		assert!(!idx.is_mapped());
	}

	#[test]
	fn test_save_queues_file_and_is_idempotent() {
		let tmp = TempDir::new().unwrap();
		let (mut tree, ids) = small_tree(&tmp, 3);
		let root = tree.root_id();
		let mut idx = build_sync_index("o", &tree, &root);

		let t0 = idx.last_sync[&ids[1]];
		tree.file_mut(&ids[1]).unwrap().save(b"changed").unwrap();
		assert!(tree.file(&ids[1]).unwrap().last_sync > t0);

		assert_eq!(build_to_update(&tree, &root, &mut idx), 1);
		assert!(idx.to_update.contains_key(&ids[1]));
		let before: Vec<FileId> = idx.to_update.keys().copied().collect();
		build_to_update(&tree, &root, &mut idx);
		let after: Vec<FileId> = idx.to_update.keys().copied().collect();
		assert_eq!(before, after);
		assert!(idx.validate().is_ok());
	}

	#[test]
	fn test_unindexed_files_are_not_inferred() {
		let tmp = TempDir::new().unwrap();
		let (mut tree, _) = small_tree(&tmp, 2);
		let root = tree.root_id();
		let mut idx = build_sync_index("o", &tree, &root);

		let path = tmp.path().join("late");
		fs::write(&path, b"late").unwrap();
		let late = File::discover(path, "o", Default::default()).unwrap();
		let late_id = late.id;
		tree.add_file(&root, late.clone()).unwrap();

		assert_eq!(build_to_update(&tree, &root, &mut idx), 0);
		assert!(idx.index_new_file(&late));
		assert!(!idx.index_new_file(&late));
		assert!(idx.to_update.contains_key(&late_id));
		assert!(idx.is_mapped());
	}

	#[test]
	fn test_mark_synced_and_reset() {
		let mut idx = SyncIndex::new("o");
		let file = File::new("a", "o", "/virtual/a");
		idx.index_new_file(&file);

		idx.mark_synced(&file.id, at(500)).unwrap();
		assert_eq!(idx.last_sync[&file.id], at(500));
		assert!(idx.to_update.is_empty());

		let ghost = FileId::new();
		assert!(matches!(idx.mark_synced(&ghost, at(1)), Err(SyncError::NotFound { .. })));

		idx.to_update.insert(file.id, file.clone());
		idx.reset();
		assert!(idx.to_update.is_empty());
		assert!(idx.has_file(&file.id));
		assert!(idx.remove(&file.id));
		assert!(!idx.has_file(&file.id));
	}

	#[test]
	fn test_compare_keeps_newest() {
		let a = File::new("a", "o", "/virtual/a");
		let b = File::new("b", "o", "/virtual/b");
		let only_orig = FileId::new();

		let mut orig = SyncIndex::new("o");
		orig.last_sync.insert(a.id, at(100));
		orig.last_sync.insert(b.id, at(300));
		orig.last_sync.insert(only_orig, at(1));

		let mut new = SyncIndex::new("o");
		new.last_sync.insert(a.id, at(200));
		new.to_update.insert(a.id, a.clone());
		new.last_sync.insert(b.id, at(250));
		new.to_update.insert(b.id, b.clone());

		let merged = compare(&orig, &new);
		assert_eq!(merged.last_sync.len(), 2);
		assert_eq!(merged.last_sync[&a.id], at(200));
		assert_eq!(merged.last_sync[&b.id], at(300));
		assert!(merged.to_update.contains_key(&a.id));
		assert!(!merged.to_update.contains_key(&b.id));
		assert!(merged.validate().is_ok());
	}

	#[test]
	fn test_payload_rejects_broken_invariant() {
		let mut idx = SyncIndex::new("o");
		let file = File::new("a", "o", "/virtual/a");
		idx.to_update.insert(file.id, file);
		let json = idx.to_json().unwrap();
		assert!(matches!(SyncIndex::from_json(&json), Err(SyncError::State(_))));

		let ok = SyncIndex::new("o");
		assert!(SyncIndex::from_json(&ok.to_json().unwrap()).is_ok());
	}
}

// vim: ts=4
