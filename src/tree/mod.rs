//! In-memory directory tree
//!
//! Directories live in an arena keyed by [`DirId`]; each node lists its
//! children by ID and a separate map records every non-root node's parent.
//! Files are owned by exactly one directory node. A secondary index maps
//! every file ID to its owning directory so IDs stay unique tree-wide.
//!
//! Constructors never touch the physical filesystem. [`Tree::discover`]
//! reads it and populates the arena depth-first.

mod discover;
mod walk;

pub use discover::{Discovery, DiscoveryReport};
pub use walk::WalkReport;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{ItemKind, Result, SyncError};
use crate::file::File;
use crate::logging::*;
use crate::types::{DirId, DriveId, FileId};

const DEFAULT_KEY: &str = "default";

/// A directory node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
	pub id: DirId,
	pub name: String,
	pub owner_id: String,
	pub drive_id: DriveId,

	pub path: PathBuf,
	pub client_path: PathBuf,
	pub server_path: PathBuf,
	pub endpoint: String,

	pub root: bool,
	pub protected: bool,
	pub key: String,

	/// Allow automatic replacement of existing contents
	pub overwrite: bool,

	/// Last structural modification
	pub last_sync: SystemTime,

	/// Files owned by this directory
	pub files: BTreeMap<FileId, File>,

	/// Child directory IDs (nodes are owned by the tree arena)
	pub dirs: BTreeSet<DirId>,
}

impl Directory {
	/// Create a non-root directory record. Does not create a physical directory.
	pub fn new(name: &str, owner_id: &str, drive_id: DriveId, path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		Directory {
			id: DirId::new(),
			name: name.to_string(),
			owner_id: owner_id.to_string(),
			drive_id,
			client_path: path.clone(),
			server_path: path.clone(),
			path,
			endpoint: String::new(),
			root: false,
			protected: false,
			key: DEFAULT_KEY.to_string(),
			overwrite: false,
			last_sync: SystemTime::now(),
			files: BTreeMap::new(),
			dirs: BTreeSet::new(),
		}
	}

	/// Create a root directory record
	pub fn new_root(name: &str, owner_id: &str, drive_id: DriveId, path: impl Into<PathBuf>) -> Self {
		let mut dir = Directory::new(name, owner_id, drive_id, path);
		dir.root = true;
		dir
	}

	pub fn with_endpoint(mut self, base: &str) -> Self {
		self.endpoint = format!("{}/v1/dirs/{}", base.trim_end_matches('/'), self.id);
		self
	}

	/// Copy of the record with no child files, as persisted
	pub fn without_files(&self) -> Directory {
		Directory {
			id: self.id,
			name: self.name.clone(),
			owner_id: self.owner_id.clone(),
			drive_id: self.drive_id,
			path: self.path.clone(),
			client_path: self.client_path.clone(),
			server_path: self.server_path.clone(),
			endpoint: self.endpoint.clone(),
			root: self.root,
			protected: self.protected,
			key: self.key.clone(),
			overwrite: self.overwrite,
			last_sync: self.last_sync,
			files: BTreeMap::new(),
			dirs: self.dirs.clone(),
		}
	}

	pub fn has_file(&self, id: &FileId) -> bool {
		self.files.contains_key(id)
	}

	pub fn has_dir(&self, id: &DirId) -> bool {
		self.dirs.contains(id)
	}

	/// Whether the physical directory exists
	pub fn exists(&self) -> bool {
		self.path.is_dir()
	}

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

	pub fn set_password(&mut self, password: &str, new_password: &str) -> Result<()> {
		self.check_key(password)?;
		self.key = new_password.to_string();
		debug!("dir {} ({}) password updated", self.name, self.id);
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
			Err(SyncError::protected(ItemKind::Directory, self.id))
		} else {
			Ok(())
		}
	}
}

/// Arena of directory nodes rooted at a single root directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
	root: DirId,
	nodes: BTreeMap<DirId, Directory>,
	parents: BTreeMap<DirId, DirId>,
	file_dirs: BTreeMap<FileId, DirId>,
}

impl Tree {
	/// Build a tree around a root directory. Any children already listed on
	/// the record are dropped; the arena starts with the root alone.
	pub fn new(mut root: Directory) -> Self {
		root.root = true;
		root.dirs.clear();
		let root_id = root.id;
		let file_dirs = root.files.keys().map(|f| (*f, root_id)).collect();
		for file in root.files.values_mut() {
			file.dir_id = Some(root_id);
			file.drive_id = Some(root.drive_id);
		}

		let mut nodes = BTreeMap::new();
		nodes.insert(root_id, root);
		Tree { root: root_id, nodes, parents: BTreeMap::new(), file_dirs }
	}

	pub fn root_id(&self) -> DirId {
		self.root
	}

	pub fn root(&self) -> &Directory {
		// the root node is never removed from the arena
		&self.nodes[&self.root]
	}

	pub fn get(&self, id: &DirId) -> Option<&Directory> {
		self.nodes.get(id)
	}

	pub fn get_mut(&mut self, id: &DirId) -> Option<&mut Directory> {
		self.nodes.get_mut(id)
	}

	fn node(&self, id: &DirId) -> Result<&Directory> {
		self.nodes.get(id).ok_or_else(|| SyncError::not_found(ItemKind::Directory, id))
	}

	fn node_mut(&mut self, id: &DirId) -> Result<&mut Directory> {
		self.nodes.get_mut(id).ok_or_else(|| SyncError::not_found(ItemKind::Directory, id))
	}

	/// Parent of a directory. `None` for the root or unknown IDs.
	pub fn parent(&self, id: &DirId) -> Option<&Directory> {
		self.parents.get(id).and_then(|p| self.nodes.get(p))
	}

	pub fn parent_id(&self, id: &DirId) -> Option<DirId> {
		self.parents.get(id).copied()
	}

	pub fn contains_dir(&self, id: &DirId) -> bool {
		self.nodes.contains_key(id)
	}

	pub fn contains_file(&self, id: &FileId) -> bool {
		self.file_dirs.contains_key(id)
	}

	/// Directory that owns a file
	pub fn file_dir(&self, id: &FileId) -> Option<DirId> {
		self.file_dirs.get(id).copied()
	}

	/// Direct lookup of a file anywhere in the tree
	pub fn file(&self, id: &FileId) -> Option<&File> {
		let dir = self.file_dirs.get(id)?;
		self.nodes.get(dir)?.files.get(id)
	}

	pub fn file_mut(&mut self, id: &FileId) -> Option<&mut File> {
		let dir = *self.file_dirs.get(id)?;
		self.nodes.get_mut(&dir)?.files.get_mut(id)
	}

	pub fn dir_count(&self) -> usize {
		self.nodes.len()
	}

	pub fn file_count(&self) -> usize {
		self.file_dirs.len()
	}

	// --------- file management

	/// Add a file to a directory.
	///
	/// Returns `Ok(false)` without changes if the ID is already tracked
	/// anywhere in the tree; fails on a protected directory.
	pub fn add_file(&mut self, dir_id: &DirId, mut file: File) -> Result<bool> {
		let dir = self.node(dir_id)?;
		dir.check_unprotected()?;
		if let Some(owner) = self.file_dirs.get(&file.id) {
			debug!("file {} ({}) already present in dir {}", file.name, file.id, owner);
			return Ok(false);
		}

		let drive_id = dir.drive_id;
		let dir = self.node_mut(dir_id)?;
		file.dir_id = Some(*dir_id);
		file.drive_id = Some(drive_id);
		dir.last_sync = SystemTime::now();
		let file_id = file.id;
		dir.files.insert(file_id, file);
		self.file_dirs.insert(file_id, *dir_id);
		Ok(true)
	}

	/// Add several files, logging and skipping duplicates. Returns the number added.
	pub fn add_files(&mut self, dir_id: &DirId, files: Vec<File>) -> Result<usize> {
		let mut added = 0;
		for file in files {
			if self.add_file(dir_id, file)? {
				added += 1;
			}
		}
		Ok(added)
	}

	/// Replace the metadata of a file already owned by `dir_id`. Ownership
	/// fields always follow the directory.
	pub fn put_file(&mut self, dir_id: &DirId, mut file: File) -> Result<()> {
		let dir = self.node_mut(dir_id)?;
		dir.check_unprotected()?;
		let drive_id = dir.drive_id;
		match dir.files.get_mut(&file.id) {
			Some(slot) => {
				file.dir_id = Some(*dir_id);
				file.drive_id = Some(drive_id);
				*slot = file;
				Ok(())
			}
			None => Err(SyncError::not_found(ItemKind::File, file.id)),
		}
	}

	/// Write new content into a file owned by `dir_id`
	pub fn modify_file(&mut self, dir_id: &DirId, file_id: &FileId, data: &[u8]) -> Result<()> {
		let dir = self.node_mut(dir_id)?;
		dir.check_unprotected()?;
		let file = dir
			.files
			.get_mut(file_id)
			.ok_or_else(|| SyncError::not_found(ItemKind::File, file_id))?;
		file.save(data)?;
		dir.last_sync = SystemTime::now();
		Ok(())
	}

	/// Remove a file record and delete its physical counterpart
	pub fn remove_file(&mut self, dir_id: &DirId, file_id: &FileId) -> Result<File> {
		let dir = self.node_mut(dir_id)?;
		dir.check_unprotected()?;
		let file = dir
			.files
			.remove(file_id)
			.ok_or_else(|| SyncError::not_found(ItemKind::File, file_id))?;
		dir.last_sync = SystemTime::now();
		self.file_dirs.remove(file_id);

		remove_physical(&file.path, false)?;
		debug!("file {} ({}) removed", file.name, file.id);
		Ok(file)
	}

	/// Drop a file record without touching the disk (the file is already gone)
	pub fn forget_file(&mut self, file_id: &FileId) -> Option<File> {
		let dir_id = self.file_dirs.remove(file_id)?;
		let dir = self.nodes.get_mut(&dir_id)?;
		dir.last_sync = SystemTime::now();
		dir.files.remove(file_id)
	}

	// --------- subdirectory management

	/// Attach a directory record under `parent_id`. Does not create a physical directory.
	///
	/// Returns `Ok(false)` if a node with the same ID already exists.
	pub fn add_subdir(&mut self, parent_id: &DirId, mut dir: Directory) -> Result<bool> {
		let parent = self.node(parent_id)?;
		parent.check_unprotected()?;
		if self.nodes.contains_key(&dir.id) {
			debug!("dir {} ({}) already present", dir.name, dir.id);
			return Ok(false);
		}

		dir.root = false;
		dir.drive_id = parent.drive_id;
		let id = dir.id;
		for file in dir.files.values_mut() {
			file.dir_id = Some(id);
			file.drive_id = Some(dir.drive_id);
		}
		// children listed on a detached record are not part of this tree
		dir.dirs.clear();
		let dup = dir.files.keys().find(|f| self.file_dirs.contains_key(f)).copied();
		if let Some(f) = dup {
			return Err(SyncError::duplicate(ItemKind::File, f));
		}
		for f in dir.files.keys() {
			self.file_dirs.insert(*f, id);
		}

		let parent = self.node_mut(parent_id)?;
		parent.dirs.insert(id);
		parent.last_sync = SystemTime::now();
		self.parents.insert(id, *parent_id);
		self.nodes.insert(id, dir);
		Ok(true)
	}

	/// Detach a subtree without touching the disk (the directory is already
	/// gone). The root cannot be forgotten.
	pub fn forget_subdir(&mut self, dir_id: &DirId) -> Option<Vec<Directory>> {
		let parent_id = self.parents.get(dir_id).copied()?;
		if let Some(parent) = self.nodes.get_mut(&parent_id) {
			parent.dirs.remove(dir_id);
			parent.last_sync = SystemTime::now();
		}
		Some(self.detach_subtree(dir_id))
	}

	/// Create a physical directory under `parent_id` and attach its record
	pub fn make_subdir(&mut self, parent_id: &DirId, name: &str) -> Result<DirId> {
		let parent = self.node(parent_id)?;
		parent.check_unprotected()?;
		let path = parent.path.join(name);
		fs::create_dir_all(&path).map_err(|e| SyncError::io(&path, e))?;

		let dir = Directory::new(name, &parent.owner_id, parent.drive_id, path);
		let id = dir.id;
		self.add_subdir(parent_id, dir)?;
		Ok(id)
	}

	/// IDs of `start` and every directory below it, depth-first
	pub(crate) fn subtree_ids(&self, start: &DirId) -> Vec<DirId> {
		let mut out = Vec::new();
		let mut stack = vec![*start];
		while let Some(id) = stack.pop() {
			if let Some(dir) = self.nodes.get(&id) {
				out.push(id);
				stack.extend(dir.dirs.iter().rev());
			}
		}
		out
	}

	fn detach_subtree(&mut self, dir_id: &DirId) -> Vec<Directory> {
		let ids = self.subtree_ids(dir_id);
		let mut removed = Vec::with_capacity(ids.len());
		for id in ids {
			self.parents.remove(&id);
			if let Some(dir) = self.nodes.remove(&id) {
				for f in dir.files.keys() {
					self.file_dirs.remove(f);
				}
				removed.push(dir);
			}
		}
		removed
	}

	/// Remove a subdirectory, all of its descendants and the physical
	/// directory. Irreversible.
	///
	/// Returns the removed records so callers can update persistence.
	pub fn remove_subdir(&mut self, parent_id: &DirId, dir_id: &DirId) -> Result<Vec<Directory>> {
		let parent = self.node(parent_id)?;
		parent.check_unprotected()?;
		if !parent.has_dir(dir_id) {
			return Err(SyncError::not_found(ItemKind::Directory, dir_id));
		}
		for id in self.subtree_ids(dir_id) {
			self.node(&id)?.check_unprotected()?;
		}

		let path = self.node(dir_id)?.path.clone();
		remove_physical(&path, true)?;

		let parent = self.node_mut(parent_id)?;
		parent.dirs.remove(dir_id);
		parent.last_sync = SystemTime::now();
		let removed = self.detach_subtree(dir_id);
		debug!("directory {} deleted ({} nodes)", dir_id, removed.len());
		Ok(removed)
	}

	/// Drop every in-memory child of a directory. The disk is not touched.
	///
	/// A protected directory requires its password.
	pub fn clear(&mut self, dir_id: &DirId, password: &str) -> Result<()> {
		let dir = self.node(dir_id)?;
		if dir.protected {
			dir.check_key(password)?;
		}
		let children: Vec<DirId> = dir.dirs.iter().copied().collect();
		for child in children {
			self.detach_subtree(&child);
		}
		let dir = self.node_mut(dir_id)?;
		let file_ids: Vec<FileId> = dir.files.keys().copied().collect();
		dir.files.clear();
		dir.dirs.clear();
		dir.last_sync = SystemTime::now();
		for f in file_ids {
			self.file_dirs.remove(&f);
		}
		debug!("dir {} all directories and files cleared", dir_id);
		Ok(())
	}

	/// Delete every physical file and subdirectory inside a directory, then
	/// clear its in-memory children
	pub fn clean(&mut self, dir_id: &DirId, password: &str) -> Result<()> {
		let dir = self.node(dir_id)?;
		if dir.protected {
			dir.check_key(password)?;
		}
		let path = dir.path.clone();
		let entries = fs::read_dir(&path).map_err(|e| SyncError::io(&path, e))?;
		for entry in entries {
			let entry = entry.map_err(|e| SyncError::io(&path, e))?;
			let p = entry.path();
			let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
			remove_physical(&p, is_dir)?;
		}
		self.clear(dir_id, password)
	}

	/// Total size of every file in the subtree, from fresh stats.
	/// Files that fail to stat are skipped.
	pub fn dir_size(&self, dir_id: &DirId) -> Result<u64> {
		self.node(dir_id)?;
		Ok(self
			.walk_fs(dir_id)
			.values()
			.filter_map(|f| match f.size() {
				Ok(s) => Some(s),
				Err(e) => {
					debug!("size of {} unavailable: {}", f.path.display(), e);
					None
				}
			})
			.sum())
	}

	/// Copy the physical contents of a directory tree to `dest`
	pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
		fs::create_dir_all(dest).map_err(|e| SyncError::io(dest, e))?;
		let entries = fs::read_dir(src).map_err(|e| SyncError::io(src, e))?;
		for entry in entries {
			let entry = entry.map_err(|e| SyncError::io(src, e))?;
			let from = entry.path();
			let to = dest.join(entry.file_name());
			let ft = entry.file_type().map_err(|e| SyncError::io(&from, e))?;
			if ft.is_dir() {
				Tree::copy_dir(&from, &to)?;
			} else {
				fs::copy(&from, &to).map_err(|e| SyncError::io(&from, e))?;
			}
		}
		Ok(())
	}

	/// Check the structural invariants of the arena
	pub fn validate(&self) -> Result<()> {
		let roots: Vec<&Directory> = self.nodes.values().filter(|d| d.root).collect();
		if roots.len() != 1 || roots[0].id != self.root {
			return Err(broken(format!("expected exactly one root, found {}", roots.len())));
		}
		if self.parents.contains_key(&self.root) {
			return Err(broken("root has a parent".to_string()));
		}
		for (id, dir) in &self.nodes {
			if *id != self.root {
				let parent = self
					.parents
					.get(id)
					.ok_or_else(|| broken(format!("dir {} has no parent", id)))?;
				let listed = self.nodes.get(parent).map(|p| p.has_dir(id)).unwrap_or(false);
				if !listed {
					return Err(broken(format!("dir {} missing from parent {}", id, parent)));
				}
			}
			for child in &dir.dirs {
				if self.parents.get(child) != Some(id) {
					return Err(broken(format!("child {} of {} has wrong parent", child, id)));
				}
			}
			for f in dir.files.keys() {
				if self.file_dirs.get(f) != Some(id) {
					return Err(broken(format!("file {} not indexed under {}", f, id)));
				}
			}
		}
		let total: usize = self.nodes.values().map(|d| d.files.len()).sum();
		if total != self.file_dirs.len() {
			return Err(broken("file index out of sync".to_string()));
		}
		Ok(())
	}
}

fn broken(message: String) -> SyncError {
	SyncError::Other { message: format!("tree invariant violated: {}", message) }
}

/// Delete a physical file or directory; an already missing path is fine
fn remove_physical(path: &Path, recursive: bool) -> Result<()> {
	let result = if recursive { fs::remove_dir_all(path) } else { fs::remove_file(path) };
	match result {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			debug!("{} already absent from disk", path.display());
			Ok(())
		}
		Err(e) => Err(SyncError::io(path, e)),
	}
}


// vim: ts=4
