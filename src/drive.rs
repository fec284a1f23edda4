//! Drive: one owner's root tree plus its sync index
//!
//! A drive enforces a byte ceiling over the files it tracks and exposes
//! tree operations at drive scope. Structural changes go through `&mut
//! self`; concurrent users share a drive as [`SharedDrive`], whose lock
//! serializes tree and index mutation alike.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

use crate::config::DriveConfig;
use crate::error::{ItemKind, Result, SyncError};
use crate::exclusion::PatternMatcher;
use crate::file::File;
use crate::index::{self, SyncIndex};
use crate::logging::*;
use crate::store::{MemoryStore, Store};
use crate::tree::{Directory, Discovery, DiscoveryReport, Tree};
use crate::types::{ChecksumAlgorithm, DirId, DriveId, FileId};

const DEFAULT_KEY: &str = "default";

/// A drive shared between the monitor, the listener and sync cycles
pub type SharedDrive = Arc<RwLock<Drive>>;

fn default_store() -> Arc<dyn Store> {
	Arc::new(MemoryStore::new())
}

#[derive(Serialize, Deserialize)]
pub struct Drive {
	pub id: DriveId,
	pub owner_name: String,
	pub owner_id: String,

	pub total_size: u64,
	pub used_space: u64,
	pub free_space: u64,

	pub protected: bool,
	pub key: String,

	/// Location of the drive on disk (holds `root/` and `state/`)
	pub drive_root: PathBuf,

	tree: Tree,
	index: SyncIndex,

	/// Bytes charged against the drive for each tracked file
	allocations: BTreeMap<FileId, u64>,

	#[serde(skip, default = "default_store")]
	store: Arc<dyn Store>,
}

impl fmt::Debug for Drive {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Drive")
			.field("id", &self.id)
			.field("owner_id", &self.owner_id)
			.field("used_space", &self.used_space)
			.field("total_size", &self.total_size)
			.field("files", &self.tree.file_count())
			.field("indexed", &self.index.last_sync.len())
			.finish()
	}
}

impl Drive {
	/// Create a drive around `root_path`. Does not touch the filesystem.
	pub fn new(owner_name: &str, owner_id: &str, root_path: impl Into<PathBuf>, config: &DriveConfig) -> Self {
		let root_path = root_path.into();
		let id = DriveId::new();
		let drive_root = root_path.parent().map(Path::to_path_buf).unwrap_or_else(|| root_path.clone());
		let root = Directory::new_root(owner_name, owner_id, id, root_path);
		Drive {
			id,
			owner_name: owner_name.to_string(),
			owner_id: owner_id.to_string(),
			total_size: config.total_size,
			used_space: 0,
			free_space: config.total_size,
			protected: false,
			key: DEFAULT_KEY.to_string(),
			drive_root,
			tree: Tree::new(root),
			index: SyncIndex::new(owner_id),
			allocations: BTreeMap::new(),
			store: default_store(),
		}
	}

	/// Create `<svc_root>/users/<name>/{root,state}` and a drive over it
	pub fn allocate(name: &str, owner_id: &str, svc_root: &Path, config: &DriveConfig) -> Result<Self> {
		let user_root = svc_root.join("users").join(name);
		if let Some(parent) = user_root.parent() {
			fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
		}
		match fs::create_dir(&user_root) {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
				return Err(SyncError::duplicate(ItemKind::Drive, user_root.display()));
			}
			Err(e) => return Err(SyncError::io(&user_root, e)),
		}
		for sub in ["root", "state"] {
			let p = user_root.join(sub);
			fs::create_dir(&p).map_err(|e| SyncError::io(&p, e))?;
		}

		info!("allocated drive for {} at {}", name, user_root.display());
		Ok(Drive::new(name, owner_id, user_root.join("root"), config))
	}

	/// Use `store` for record persistence
	pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
		self.store = store;
		self
	}

	pub fn set_store(&mut self, store: Arc<dyn Store>) {
		self.store = store;
	}

	pub fn shared(self) -> SharedDrive {
		Arc::new(RwLock::new(self))
	}

	pub fn tree(&self) -> &Tree {
		&self.tree
	}

	pub fn index(&self) -> &SyncIndex {
		&self.index
	}

	pub fn index_mut(&mut self) -> &mut SyncIndex {
		&mut self.index
	}

	pub fn root_id(&self) -> DirId {
		self.tree.root_id()
	}

	pub fn root_path(&self) -> &Path {
		&self.tree.root().path
	}

	pub fn state_dir(&self) -> PathBuf {
		self.drive_root.join("state")
	}

	// ------- state queries

	pub fn remaining(&self) -> u64 {
		self.total_size.saturating_sub(self.used_space)
	}

	/// Whether the root directory exists on disk
	pub fn has_root(&self) -> bool {
		self.tree.root().exists()
	}

	/// Root directory has no files and no subdirectories
	pub fn empty_root(&self) -> bool {
		let root = self.tree.root();
		root.files.is_empty() && root.dirs.is_empty()
	}

	/// Sync index has been built and holds entries
	pub fn is_indexed(&self) -> bool {
		!self.index.last_sync.is_empty()
	}

	// ------- security

	pub fn lock(&mut self, password: &str) -> Result<()> {
		self.check_key(password)?;
		self.protected = true;
		Ok(())
	}

	pub fn unlock(&mut self, password: &str) -> Result<()> {
		self.check_key(password)?;
		self.protected = false;
		Ok(())
	}

	/// Change the drive password. A protected drive only accepts an admin override.
	pub fn set_password(&mut self, password: &str, new_password: &str, is_admin: bool) -> Result<()> {
		if self.protected {
			if !is_admin {
				return Err(SyncError::protected(ItemKind::Drive, self.id));
			}
			info!("admin password override on drive {}", self.id);
		} else {
			self.check_key(password)?;
		}
		self.key = new_password.to_string();
		Ok(())
	}

	fn check_key(&self, password: &str) -> Result<()> {
		if password == self.key {
			Ok(())
		} else {
			Err(SyncError::WrongPassword)
		}
	}

	fn check_unprotected(&self) -> Result<()> {
		if self.protected {
			Err(SyncError::protected(ItemKind::Drive, self.id))
		} else {
			Ok(())
		}
	}

	// ------- accounting

	fn charge(&mut self, id: FileId, size: u64) {
		let prev = self.allocations.insert(id, size).unwrap_or(0);
		self.used_space = self.used_space - prev + size;
		self.free_space = self.total_size.saturating_sub(self.used_space);
	}

	fn release(&mut self, id: &FileId) {
		if let Some(size) = self.allocations.remove(id) {
			self.used_space -= size;
			self.free_space = self.total_size.saturating_sub(self.used_space);
		}
	}

	fn ensure_room(&self, needed: u64) -> Result<()> {
		let available = self.remaining();
		if needed > available {
			return Err(SyncError::DriveFull { needed, available });
		}
		Ok(())
	}

	fn persist<F>(&self, what: &str, op: F)
	where
		F: FnOnce(&dyn Store) -> Result<()>,
	{
		if let Err(e) = op(self.store.as_ref()) {
			error!("failed to persist {}: {}", what, e);
		}
	}

	// ------- file management

	/// Add a file to a directory. Returns false for an already tracked ID.
	pub fn add_file(&mut self, dir_id: &DirId, file: File) -> Result<bool> {
		self.check_unprotected()?;
		let size = match file.size() {
			Ok(s) => s,
			Err(e) if e.is_skippable() => {
				debug!("{} not on disk yet: {}", file.path.display(), e);
				0
			}
			Err(e) => return Err(e),
		};
		self.ensure_room(size)?;

		let id = file.id;
		if !self.tree.add_file(dir_id, file)? {
			return Ok(false);
		}
		self.charge(id, size);
		if let Some(f) = self.tree.file(&id) {
			self.persist("file", |s| s.add_file(f));
		}
		Ok(true)
	}

	pub fn get_file(&self, id: &FileId) -> Result<&File> {
		self.tree.file(id).ok_or_else(|| SyncError::not_found(ItemKind::File, id))
	}

	/// Every file on the drive
	pub fn files(&self) -> BTreeMap<FileId, &File> {
		self.tree.walk_fs(&self.tree.root_id())
	}

	/// Write new content into a tracked file
	pub fn modify_file(&mut self, dir_id: &DirId, file_id: &FileId, data: &[u8]) -> Result<()> {
		self.check_unprotected()?;
		let prev = self.allocations.get(file_id).copied().unwrap_or(0);
		let needed = (data.len() as u64).saturating_sub(prev);
		self.ensure_room(needed)?;

		self.tree.modify_file(dir_id, file_id, data)?;
		self.charge(*file_id, data.len() as u64);
		if let Some(f) = self.tree.file(file_id) {
			self.persist("file", |s| s.update_file(f));
		}
		Ok(())
	}

	/// Replace the metadata of a tracked file
	pub fn update_file(&mut self, dir_id: &DirId, file: File) -> Result<()> {
		self.check_unprotected()?;
		let id = file.id;
		self.tree.put_file(dir_id, file)?;
		if let Some(f) = self.tree.file(&id) {
			self.persist("file", |s| s.update_file(f));
		}
		Ok(())
	}

	/// Remove a file from the tree, the index and the disk
	pub fn remove_file(&mut self, dir_id: &DirId, file_id: &FileId) -> Result<File> {
		self.check_unprotected()?;
		let file = self.tree.remove_file(dir_id, file_id)?;
		self.release(file_id);
		self.index.remove(file_id);
		self.persist("file removal", |s| s.remove_file(&file));
		Ok(file)
	}

	/// Drop a file that has disappeared from disk
	pub fn forget_file(&mut self, file_id: &FileId) -> Result<File> {
		let file = self
			.tree
			.forget_file(file_id)
			.ok_or_else(|| SyncError::not_found(ItemKind::File, file_id))?;
		self.release(file_id);
		self.index.remove(file_id);
		self.persist("file removal", |s| s.remove_file(&file));
		Ok(file)
	}

	/// Advance a tracked file's sync timestamp (used when a change is observed)
	pub fn touch_file(&mut self, file_id: &FileId, time: SystemTime) -> Result<()> {
		let file = self
			.tree
			.file_mut(file_id)
			.ok_or_else(|| SyncError::not_found(ItemKind::File, file_id))?;
		file.touch(time);
		Ok(())
	}

	/// Apply a change seen on disk: move the file strictly past its last
	/// sync and charge its current size. Returns the new size.
	pub fn record_change(&mut self, file_id: &FileId, observed: SystemTime) -> Result<u64> {
		let file = self
			.tree
			.file_mut(file_id)
			.ok_or_else(|| SyncError::not_found(ItemKind::File, file_id))?;
		file.mark_changed(observed);
		let size = file.size()?;
		self.charge(*file_id, size);
		if self.used_space > self.total_size {
			warn!("drive {} over capacity: {} of {} bytes used", self.id, self.used_space, self.total_size);
		}
		Ok(size)
	}

	/// Locate a tracked file by its working path
	pub fn find_by_path(&self, path: &Path) -> Option<FileId> {
		self.files().values().find(|f| f.path == path).map(|f| f.id)
	}

	/// Locate a tracked directory (the root included) by its working path
	pub fn dir_by_path(&self, path: &Path) -> Option<DirId> {
		let root = self.tree.root();
		if root.path == path {
			return Some(root.id);
		}
		self.dirs().values().find(|d| d.path == path).map(|d| d.id)
	}

	// ------- directory management

	pub fn add_subdir(&mut self, parent: &DirId, dir: Directory) -> Result<bool> {
		self.check_unprotected()?;
		let id = dir.id;
		let added = self.tree.add_subdir(parent, dir)?;
		if added {
			if let Some(d) = self.tree.get(&id) {
				self.persist("dir", |s| s.add_dir(d));
			}
		}
		Ok(added)
	}

	/// Create a physical subdirectory and track it
	pub fn make_dir(&mut self, parent: &DirId, name: &str) -> Result<DirId> {
		self.check_unprotected()?;
		let id = self.tree.make_subdir(parent, name)?;
		if let Some(d) = self.tree.get(&id) {
			self.persist("dir", |s| s.add_dir(d));
		}
		Ok(id)
	}

	pub fn get_dir(&self, id: &DirId) -> Result<&Directory> {
		self.tree.get(id).ok_or_else(|| SyncError::not_found(ItemKind::Directory, id))
	}

	/// Every directory below the root
	pub fn dirs(&self) -> BTreeMap<DirId, &Directory> {
		self.tree.walk_ds(&self.tree.root_id())
	}

	/// Replace a directory's metadata. Children are kept.
	pub fn update_dir(&mut self, updated: &Directory) -> Result<()> {
		self.check_unprotected()?;
		let dir = self
			.tree
			.get_mut(&updated.id)
			.ok_or_else(|| SyncError::not_found(ItemKind::Directory, updated.id))?;
		dir.name = updated.name.clone();
		dir.endpoint = updated.endpoint.clone();
		dir.protected = updated.protected;
		dir.key = updated.key.clone();
		dir.overwrite = updated.overwrite;
		dir.last_sync = SystemTime::now();
		if let Some(d) = self.tree.get(&updated.id) {
			self.persist("dir", |s| s.update_dir(d));
		}
		Ok(())
	}

	/// Delete a directory and everything below it, in memory and on disk.
	/// Irreversible, so the caller has to confirm.
	pub fn remove_dir(&mut self, dir_id: &DirId, confirmed: bool) -> Result<()> {
		self.check_unprotected()?;
		if !confirmed {
			return Err(SyncError::Other {
				message: format!("removal of directory {} requires confirmation", dir_id),
			});
		}
		let parent = self
			.tree
			.parent_id(dir_id)
			.ok_or_else(|| SyncError::protected(ItemKind::Directory, dir_id))?;

		let removed = self.tree.remove_subdir(&parent, dir_id)?;
		for dir in &removed {
			for (fid, file) in &dir.files {
				self.release(fid);
				self.index.remove(fid);
				self.persist("file removal", |s| s.remove_file(file));
			}
			self.persist("dir removal", |s| s.remove_dir(dir));
		}
		Ok(())
	}

	/// Drop a directory that has disappeared from disk, with everything below it
	pub fn forget_dir(&mut self, dir_id: &DirId) -> Result<Vec<Directory>> {
		let removed = self
			.tree
			.forget_subdir(dir_id)
			.ok_or_else(|| SyncError::not_found(ItemKind::Directory, dir_id))?;
		for dir in &removed {
			for (fid, file) in &dir.files {
				self.release(fid);
				self.index.remove(fid);
				self.persist("file removal", |s| s.remove_file(file));
			}
			self.persist("dir removal", |s| s.remove_dir(dir));
		}
		Ok(removed)
	}

	/// Wipe every file and directory under the root, on disk and in memory
	pub fn clear(&mut self) -> Result<()> {
		self.check_unprotected()?;
		let root = self.tree.root_id();
		let password = self.tree.root().key.clone();
		self.tree.clean(&root, &password)?;
		self.allocations.clear();
		self.used_space = 0;
		self.free_space = self.total_size;
		self.index = SyncIndex::new(&self.owner_id);
		info!("drive {} cleared", self.id);
		Ok(())
	}

	// ------- discovery and indexing

	/// Populate the tree from disk, resolving known records through the store
	pub fn discover(&mut self, algorithm: ChecksumAlgorithm, matcher: Option<&PatternMatcher>) -> Result<DiscoveryReport> {
		let root = self.tree.root_id();
		self.discover_from(&root, algorithm, matcher)
	}

	/// Discovery limited to the subtree of `dir_id`
	pub fn discover_from(
		&mut self,
		dir_id: &DirId,
		algorithm: ChecksumAlgorithm,
		matcher: Option<&PatternMatcher>,
	) -> Result<DiscoveryReport> {
		let store = Arc::clone(&self.store);
		let ctx = Discovery { algorithm, matcher, store: Some(store.as_ref()) };
		let report = self.tree.discover(dir_id, &ctx)?;

		let unaccounted: Vec<(FileId, u64)> = self
			.files()
			.values()
			.filter(|f| !self.allocations.contains_key(&f.id))
			.filter_map(|f| f.size().ok().map(|s| (f.id, s)))
			.collect();
		for (id, size) in unaccounted {
			self.charge(id, size);
		}
		if self.used_space > self.total_size {
			warn!("drive {} over capacity: {} of {} bytes used", self.id, self.used_space, self.total_size);
		}
		Ok(report)
	}

	/// Replace the sync index with a full walk of the tree
	pub fn build_index(&mut self) {
		self.index = index::build_sync_index(&self.owner_id, &self.tree, &self.tree.root_id());
	}

	/// Queue files whose timestamps moved past the index
	pub fn build_to_update(&mut self) -> usize {
		index::build_to_update(&self.tree, &self.tree.root_id(), &mut self.index)
	}

	/// Index and queue every tracked file the index has never seen
	pub fn index_new_files(&mut self) -> usize {
		let root = self.tree.root_id();
		let fresh: Vec<&File> =
			self.tree.walk_fs(&root).into_values().filter(|f| !self.index.has_file(&f.id)).collect();
		let mut n = 0;
		for file in fresh {
			if self.index.index_new_file(file) {
				n += 1;
			}
		}
		n
	}

	/// Build the index if needed, then run the delta walk
	pub fn refresh(&mut self) -> usize {
		if !self.is_indexed() {
			self.build_index();
		}
		self.build_to_update()
	}

	// ------- serialization

	pub fn to_json(&self) -> Result<String> {
		Ok(serde_json::to_string_pretty(self)?)
	}

	/// Restore a drive snapshot. The store has to be attached again.
	pub fn from_json(data: &str) -> Result<Self> {
		let drive: Drive = serde_json::from_str(data)?;
		drive.tree.validate()?;
		drive.index.validate()?;
		Ok(drive)
	}
}


// vim: ts=4
