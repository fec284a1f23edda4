//! Persistence collaborator
//!
//! The engine needs only idempotent upsert-by-ID and lookup by name or path. Two
//! backends are provided: an in-memory map and a redb database whose
//! values are json5-encoded records.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, StoreError, SyncError};
use crate::file::File;
use crate::tree::Directory;
use crate::types::{DirId, FileId};

/// Record persistence used by discovery and tree mutations
pub trait Store: Send + Sync {
	/// Insert or replace a file record by ID
	fn add_file(&self, file: &File) -> Result<()>;

	fn update_file(&self, file: &File) -> Result<()> {
		self.add_file(file)
	}

	fn remove_file(&self, file: &File) -> Result<()>;

	/// Insert or replace a directory record by ID. Child files are not
	/// part of the record.
	fn add_dir(&self, dir: &Directory) -> Result<()>;

	fn update_dir(&self, dir: &Directory) -> Result<()> {
		self.add_dir(dir)
	}

	fn remove_dir(&self, dir: &Directory) -> Result<()>;

	fn get_file_by_name(&self, name: &str) -> Result<Option<File>>;

	fn get_directory_by_name(&self, name: &str) -> Result<Option<Directory>>;

	/// Record stored for exactly this working path
	fn get_file_by_path(&self, path: &Path) -> Result<Option<File>>;

	fn get_directory_by_path(&self, path: &Path) -> Result<Option<Directory>>;

	fn get_file(&self, id: &FileId) -> Result<Option<File>>;
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

/// Store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
	files: Mutex<BTreeMap<FileId, File>>,
	dirs: Mutex<BTreeMap<DirId, Directory>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
	m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn file_count(&self) -> usize {
		guard(&self.files).len()
	}

	pub fn dir_count(&self) -> usize {
		guard(&self.dirs).len()
	}
}

impl Store for MemoryStore {
	fn add_file(&self, file: &File) -> Result<()> {
		guard(&self.files).insert(file.id, file.clone());
		Ok(())
	}

	fn remove_file(&self, file: &File) -> Result<()> {
		guard(&self.files).remove(&file.id);
		Ok(())
	}

	fn add_dir(&self, dir: &Directory) -> Result<()> {
		guard(&self.dirs).insert(dir.id, dir.without_files());
		Ok(())
	}

	fn remove_dir(&self, dir: &Directory) -> Result<()> {
		guard(&self.dirs).remove(&dir.id);
		Ok(())
	}

	fn get_file_by_name(&self, name: &str) -> Result<Option<File>> {
		Ok(guard(&self.files).values().find(|f| f.name == name).cloned())
	}

	fn get_directory_by_name(&self, name: &str) -> Result<Option<Directory>> {
		Ok(guard(&self.dirs).values().find(|d| d.name == name).cloned())
	}

	fn get_file_by_path(&self, path: &Path) -> Result<Option<File>> {
		Ok(guard(&self.files).values().find(|f| f.path == path).cloned())
	}

	fn get_directory_by_path(&self, path: &Path) -> Result<Option<Directory>> {
		Ok(guard(&self.dirs).values().find(|d| d.path == path).cloned())
	}

	fn get_file(&self, id: &FileId) -> Result<Option<File>> {
		Ok(guard(&self.files).get(id).cloned())
	}
}

// ============================================================================
// REDB BACKEND
// ============================================================================

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Key: file ID, value: json5-encoded File
const FILES_TABLE: RecordTable = TableDefinition::new("files");

/// Key: directory ID, value: json5-encoded Directory (without files)
const DIRS_TABLE: RecordTable = TableDefinition::new("dirs");

fn txn_err<E: Error + Send + Sync + 'static>(e: E) -> SyncError {
	StoreError::TransactionFailed { source: Box::new(e) }.into()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
	json5::to_string(value)
		.map(String::into_bytes)
		.map_err(|e| StoreError::Corrupted { message: e.to_string() }.into())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
	let text = std::str::from_utf8(bytes)
		.map_err(|e| SyncError::from(StoreError::Corrupted { message: e.to_string() }))?;
	json5::from_str(text).map_err(|e| StoreError::Corrupted { message: e.to_string() }.into())
}

/// Store backed by a redb database file
pub struct RedbStore {
	db: redb::Database,
	path: PathBuf,
}

impl RedbStore {
	/// Open or create the database and make sure both tables exist
	pub fn open(path: &Path) -> Result<Self> {
		let db = redb::Database::create(path)
			.map_err(|e| StoreError::OpenFailed { source: Box::new(e) })?;
		{
			let write_txn = db.begin_write().map_err(txn_err)?;
			write_txn.open_table(FILES_TABLE).map_err(txn_err)?;
			write_txn.open_table(DIRS_TABLE).map_err(txn_err)?;
			write_txn.commit().map_err(txn_err)?;
		}
		Ok(RedbStore { db, path: path.to_path_buf() })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn put(&self, table: RecordTable, key: &str, bytes: &[u8]) -> Result<()> {
		let write_txn = self.db.begin_write().map_err(txn_err)?;
		{
			let mut t = write_txn.open_table(table).map_err(txn_err)?;
			t.insert(key, bytes).map_err(txn_err)?;
		}
		write_txn.commit().map_err(txn_err)
	}

	fn delete(&self, table: RecordTable, key: &str) -> Result<()> {
		let write_txn = self.db.begin_write().map_err(txn_err)?;
		{
			let mut t = write_txn.open_table(table).map_err(txn_err)?;
			t.remove(key).map_err(txn_err)?;
		}
		write_txn.commit().map_err(txn_err)
	}

	/// First record in `table` accepted by `pick`
	fn scan<T, F>(&self, table: RecordTable, pick: F) -> Result<Option<T>>
	where
		T: DeserializeOwned,
		F: Fn(&T) -> bool,
	{
		let read_txn = self.db.begin_read().map_err(txn_err)?;
		let t = read_txn.open_table(table).map_err(txn_err)?;
		for entry in t.iter().map_err(txn_err)? {
			let (_, value) = entry.map_err(txn_err)?;
			let record: T = decode(value.value())?;
			if pick(&record) {
				return Ok(Some(record));
			}
		}
		Ok(None)
	}
}

impl Store for RedbStore {
	fn add_file(&self, file: &File) -> Result<()> {
		self.put(FILES_TABLE, &file.id.to_string(), &encode(file)?)
	}

	fn remove_file(&self, file: &File) -> Result<()> {
		self.delete(FILES_TABLE, &file.id.to_string())
	}

	fn add_dir(&self, dir: &Directory) -> Result<()> {
		self.put(DIRS_TABLE, &dir.id.to_string(), &encode(&dir.without_files())?)
	}

	fn remove_dir(&self, dir: &Directory) -> Result<()> {
		self.delete(DIRS_TABLE, &dir.id.to_string())
	}

	fn get_file_by_name(&self, name: &str) -> Result<Option<File>> {
		self.scan(FILES_TABLE, |f: &File| f.name == name)
	}

	fn get_directory_by_name(&self, name: &str) -> Result<Option<Directory>> {
		self.scan(DIRS_TABLE, |d: &Directory| d.name == name)
	}

	fn get_file_by_path(&self, path: &Path) -> Result<Option<File>> {
		self.scan(FILES_TABLE, |f: &File| f.path == path)
	}

	fn get_directory_by_path(&self, path: &Path) -> Result<Option<Directory>> {
		self.scan(DIRS_TABLE, |d: &Directory| d.path == path)
	}

	fn get_file(&self, id: &FileId) -> Result<Option<File>> {
		let read_txn = self.db.begin_read().map_err(txn_err)?;
		let t = read_txn.open_table(FILES_TABLE).map_err(txn_err)?;
		match t.get(id.to_string().as_str()).map_err(txn_err)? {
			Some(entry) => Ok(Some(decode(entry.value())?)),
			None => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::DriveId;
	use tempfile::TempDir;

	fn exercise(store: &dyn Store) {
		let mut file = File::new("report.pdf", "owner", "/data/report.pdf");
		store.add_file(&file).unwrap();
		// upsert is idempotent
		store.add_file(&file).unwrap();

		file.checksum = "abc".into();
		store.update_file(&file).unwrap();
		let got = store.get_file(&file.id).unwrap().unwrap();
		assert_eq!(got.checksum, "abc");
		assert_eq!(store.get_file_by_name("report.pdf").unwrap().map(|f| f.id), Some(file.id));
		assert!(store.get_file_by_name("missing").unwrap().is_none());

		// same name, other directory
		let twin = File::new("report.pdf", "owner", "/data/old/report.pdf");
		store.add_file(&twin).unwrap();
		let at = |p: &str| store.get_file_by_path(Path::new(p)).unwrap().map(|f| f.id);
		assert_eq!(at("/data/report.pdf"), Some(file.id));
		assert_eq!(at("/data/old/report.pdf"), Some(twin.id));
		assert_eq!(at("/data/new/report.pdf"), None);
		store.remove_file(&twin).unwrap();

		let mut dir = Directory::new("docs", "owner", DriveId::new(), "/data/docs");
		dir.files.insert(file.id, file.clone());
		store.add_dir(&dir).unwrap();
		let rec = store.get_directory_by_name("docs").unwrap().unwrap();
		assert_eq!(rec.id, dir.id);
		assert!(rec.files.is_empty());
		let rec = store.get_directory_by_path(Path::new("/data/docs")).unwrap().unwrap();
		assert_eq!(rec.id, dir.id);
		assert!(store.get_directory_by_path(Path::new("/data/other/docs")).unwrap().is_none());

		store.remove_file(&file).unwrap();
		assert!(store.get_file(&file.id).unwrap().is_none());
		store.remove_dir(&dir).unwrap();
		assert!(store.get_directory_by_name("docs").unwrap().is_none());
	}

	#[test]
	fn test_memory_store() {
		let store = MemoryStore::new();
		exercise(&store);
		assert_eq!(store.file_count(), 0);
		assert_eq!(store.dir_count(), 0);
	}

	#[test]
	fn test_redb_store() {
		let tmp = TempDir::new().unwrap();
		let store = RedbStore::open(&tmp.path().join("store.db")).unwrap();
		exercise(&store);
	}

	#[test]
	fn test_redb_store_persists_across_reopen() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("store.db");
		let file = File::new("keep.txt", "owner", "/data/keep.txt");
		{
			let store = RedbStore::open(&path).unwrap();
			store.add_file(&file).unwrap();
		}
		let store = RedbStore::open(&path).unwrap();
		let got = store.get_file(&file.id).unwrap().unwrap();
		assert_eq!(got.name, "keep.txt");
		assert_eq!(got.last_sync, file.last_sync);
	}
}

// vim: ts=4
