//! Tracked file entity: checksum, content I/O and password locking

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::error::{ItemKind, Result, SyncError};
use crate::logging::*;
use crate::types::{ChecksumAlgorithm, DirId, DriveId, FileId};

const DEFAULT_KEY: &str = "default";
const READ_BUF_SIZE: usize = 64 * 1024;

/// A single tracked file
///
/// The ID is the key everywhere; paths may change on rename. Size is never
/// cached and always comes from a fresh stat. `content` is an in-memory
/// buffer filled by [`File::load`] and never serialized.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
	pub id: FileId,
	pub name: String,
	pub owner_id: String,
	pub dir_id: Option<DirId>,
	pub drive_id: Option<DriveId>,

	/// Working path on this machine
	pub path: PathBuf,
	pub client_path: PathBuf,
	pub server_path: PathBuf,

	/// Remote endpoint the transfer collaborator addresses this file by
	pub endpoint: String,

	pub checksum: String,
	pub algorithm: ChecksumAlgorithm,

	/// Last time this file was synced or modified
	pub last_sync: SystemTime,

	pub protected: bool,
	pub key: String,

	#[serde(skip)]
	content: Mutex<Vec<u8>>,
}

impl Clone for File {
	fn clone(&self) -> Self {
		File {
			id: self.id,
			name: self.name.clone(),
			owner_id: self.owner_id.clone(),
			dir_id: self.dir_id,
			drive_id: self.drive_id,
			path: self.path.clone(),
			client_path: self.client_path.clone(),
			server_path: self.server_path.clone(),
			endpoint: self.endpoint.clone(),
			checksum: self.checksum.clone(),
			algorithm: self.algorithm,
			last_sync: self.last_sync,
			protected: self.protected,
			key: self.key.clone(),
			content: Mutex::new(self.content_guard().clone()),
		}
	}
}

impl File {
	/// Create a file record without touching the filesystem
	pub fn new(name: &str, owner_id: &str, path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		File {
			id: FileId::new(),
			name: name.to_string(),
			owner_id: owner_id.to_string(),
			dir_id: None,
			drive_id: None,
			client_path: path.clone(),
			server_path: path.clone(),
			path,
			endpoint: String::new(),
			checksum: String::new(),
			algorithm: ChecksumAlgorithm::default(),
			last_sync: SystemTime::now(),
			protected: false,
			key: DEFAULT_KEY.to_string(),
			content: Mutex::new(Vec::new()),
		}
	}

	/// Create a file record from an existing physical file (stat + checksum)
	///
	/// The sync timestamp starts at the file's modification time.
	pub fn discover(
		path: impl Into<PathBuf>,
		owner_id: &str,
		algorithm: ChecksumAlgorithm,
	) -> Result<Self> {
		let path = path.into();
		let meta = fs::metadata(&path).map_err(|e| SyncError::io(&path, e))?;
		let name = path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default();

		let mut file = File::new(&name, owner_id, path);
		file.algorithm = algorithm;
		file.checksum = calculate_checksum(&file.path, algorithm)?;
		file.last_sync = meta.modified().map_err(|e| SyncError::io(&file.path, e))?;
		Ok(file)
	}

	/// Set the remote endpoint from a server base URL
	pub fn with_endpoint(mut self, base: &str) -> Self {
		self.endpoint = format!("{}/v1/files/{}", base.trim_end_matches('/'), self.id);
		self
	}

	/// Size in bytes from a fresh stat
	pub fn size(&self) -> Result<u64> {
		match fs::metadata(&self.path) {
			Ok(meta) => Ok(meta.len()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				Err(SyncError::not_found(ItemKind::File, self.path.display()))
			}
			Err(e) => Err(SyncError::io(&self.path, e)),
		}
	}

	pub fn exists(&self) -> bool {
		self.path.exists()
	}

	// ----------- password protection

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

	pub fn change_password(&mut self, password: &str, new_password: &str) -> Result<()> {
		self.check_key(password)?;
		self.key = new_password.to_string();
		debug!("file {} ({}) password updated", self.name, self.id);
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
			Err(SyncError::protected(ItemKind::File, self.id))
		} else {
			Ok(())
		}
	}

	// ----------- content I/O

	fn content_guard(&self) -> MutexGuard<'_, Vec<u8>> {
		// a poisoned buffer is still a valid byte vector
		self.content.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Read the physical file into the in-memory buffer
	pub fn load(&self) -> Result<()> {
		self.check_unprotected()?;
		let mut content = self.content_guard();
		*content = fs::read(&self.path).map_err(|e| SyncError::io(&self.path, e))?;
		Ok(())
	}

	/// Copy of the in-memory buffer
	pub fn content(&self) -> Vec<u8> {
		self.content_guard().clone()
	}

	pub fn is_loaded(&self) -> bool {
		!self.content_guard().is_empty()
	}

	/// Create or truncate the physical file with `data`, then refresh the
	/// checksum and advance the sync timestamp
	pub fn save(&mut self, data: &[u8]) -> Result<()> {
		self.check_unprotected()?;
		{
			let _content = self.content_guard();
			fs::write(&self.path, data).map_err(|e| SyncError::io(&self.path, e))?;
		}
		self.checksum = calculate_checksum(&self.path, self.algorithm)?;
		self.last_sync = next_timestamp(self.last_sync);
		Ok(())
	}

	/// Drop the in-memory buffer. The physical file is not touched.
	pub fn clear(&self) -> Result<()> {
		self.check_unprotected()?;
		self.content_guard().clear();
		debug!("{} in-memory content cleared", self.name);
		Ok(())
	}

	/// Copy the physical file to another location
	pub fn copy_to(&self, dest: &Path) -> Result<u64> {
		let _content = self.content_guard();
		fs::copy(&self.path, dest).map_err(|e| SyncError::io(dest, e))
	}

	/// Advance the sync timestamp to `time` if it is newer
	pub fn touch(&mut self, time: SystemTime) {
		if time > self.last_sync {
			self.last_sync = time;
		}
	}

	/// Record an observed content change. The timestamp moves strictly
	/// forward even when the reported mtime did not.
	pub fn mark_changed(&mut self, observed: SystemTime) {
		self.last_sync = observed.max(next_timestamp(self.last_sync));
	}

	// ----------- integrity

	pub fn update_checksum(&mut self) -> Result<()> {
		self.checksum = calculate_checksum(&self.path, self.algorithm)?;
		Ok(())
	}

	/// Recompute the checksum and compare with the recorded one
	pub fn validate_checksum(&self) -> Result<()> {
		let actual = calculate_checksum(&self.path, self.algorithm)?;
		if actual != self.checksum {
			return Err(SyncError::Integrity {
				file: self.id.to_string(),
				expected: self.checksum.clone(),
				actual,
			});
		}
		Ok(())
	}

	// ----------- serialization

	pub fn to_json(&self) -> Result<String> {
		Ok(serde_json::to_string_pretty(self)?)
	}

	pub fn from_json(data: &str) -> Result<Self> {
		Ok(serde_json::from_str(data)?)
	}
}

/// Hex-encoded checksum of the file at `path`
pub fn calculate_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
	let mut f = fs::File::open(path).map_err(|e| SyncError::io(path, e))?;
	let mut buf = vec![0u8; READ_BUF_SIZE];

	match algorithm {
		ChecksumAlgorithm::Blake3 => {
			let mut hasher = blake3::Hasher::new();
			loop {
				let n = f.read(&mut buf).map_err(|e| SyncError::io(path, e))?;
				if n == 0 {
					break;
				}
				hasher.update(&buf[..n]);
			}
			Ok(hasher.finalize().to_hex().to_string())
		}
		ChecksumAlgorithm::Sha256 => {
			let mut hasher = Sha256::new();
			loop {
				let n = f.read(&mut buf).map_err(|e| SyncError::io(path, e))?;
				if n == 0 {
					break;
				}
				hasher.update(&buf[..n]);
			}
			Ok(hex::encode(hasher.finalize()))
		}
	}
}

/// Current time, forced strictly past `prev` on coarse clocks
pub(crate) fn next_timestamp(prev: SystemTime) -> SystemTime {
	let now = SystemTime::now();
	if now > prev {
		now
	} else {
		prev + Duration::from_micros(1)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn make_file(dir: &TempDir, name: &str, data: &[u8]) -> File {
		let path = dir.path().join(name);
		fs::write(&path, data).unwrap();
		File::discover(path, "owner", ChecksumAlgorithm::Blake3).unwrap()
	}

	#[test]
	fn test_new_does_not_touch_disk() {
		let file = File::new("ghost.txt", "owner", "/nonexistent/ghost.txt");
		assert!(!file.exists());
		assert!(matches!(file.size(), Err(SyncError::NotFound { .. })));
	}

	#[test]
	fn test_discover_and_size() {
		let tmp = TempDir::new().unwrap();
		let file = make_file(&tmp, "a.txt", b"hello world");
		assert_eq!(file.name, "a.txt");
		assert_eq!(file.size().unwrap(), 11);
		assert_eq!(file.checksum, blake3::hash(b"hello world").to_hex().to_string());
	}

	#[test]
	fn test_sha256_checksum() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("b.txt");
		fs::write(&path, b"abc").unwrap();
		let cs = calculate_checksum(&path, ChecksumAlgorithm::Sha256).unwrap();
		assert_eq!(cs, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
	}

	#[test]
	fn test_save_updates_checksum_and_timestamp() {
		let tmp = TempDir::new().unwrap();
		let mut file = make_file(&tmp, "c.txt", b"one");
		let before = file.last_sync;
		let old_cs = file.checksum.clone();

		file.save(b"two").unwrap();
		assert!(file.last_sync > before);
		assert_ne!(file.checksum, old_cs);
		assert_eq!(fs::read(&file.path).unwrap(), b"two");
		assert!(file.validate_checksum().is_ok());
	}

	#[test]
	fn test_load_and_clear() {
		let tmp = TempDir::new().unwrap();
		let file = make_file(&tmp, "d.txt", b"payload");
		file.load().unwrap();
		assert_eq!(file.content(), b"payload");
		file.clear().unwrap();
		assert!(!file.is_loaded());
		assert!(file.exists());
	}

	#[test]
	fn test_protected_file_rejects_io() {
		let tmp = TempDir::new().unwrap();
		let mut file = make_file(&tmp, "e.txt", b"secret");

		assert!(matches!(file.lock("nope"), Err(SyncError::WrongPassword)));
		file.lock("default").unwrap();
		assert!(matches!(file.save(b"x"), Err(SyncError::Protected { .. })));
		assert!(matches!(file.load(), Err(SyncError::Protected { .. })));

		file.change_password("default", "hunter2").unwrap();
		file.unlock("hunter2").unwrap();
		assert!(file.save(b"x").is_ok());
	}

	#[test]
	fn test_validate_detects_tampering() {
		let tmp = TempDir::new().unwrap();
		let file = make_file(&tmp, "f.txt", b"original");
		fs::write(&file.path, b"tampered").unwrap();
		assert!(matches!(file.validate_checksum(), Err(SyncError::Integrity { .. })));
	}

	#[test]
	fn test_json_round_trip_drops_content() {
		let tmp = TempDir::new().unwrap();
		let file = make_file(&tmp, "g.txt", b"data").with_endpoint("http://localhost:8080/");
		file.load().unwrap();

		let back = File::from_json(&file.to_json().unwrap()).unwrap();
		assert_eq!(back.id, file.id);
		assert_eq!(back.checksum, file.checksum);
		assert_eq!(back.last_sync, file.last_sync);
		assert_eq!(back.endpoint, format!("http://localhost:8080/v1/files/{}", file.id));
		assert!(!back.is_loaded());
	}

	#[test]
	fn test_next_timestamp_is_strictly_later() {
		let future = SystemTime::now() + Duration::from_secs(3600);
		assert!(next_timestamp(future) > future);
	}
}

// vim: ts=4
