//! Drive snapshots and sync-index payloads on disk

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::drive::Drive;
use crate::error::StateError;
use crate::index::SyncIndex;
use crate::logging::*;

const LOCK_FILE: &str = ".sfsync-lock";
const TMP_SUFFIX: &str = "sfsync-tmp";

/// Persistent state manager for one profile
pub struct StateManager {
	state_dir: PathBuf,
	profile: String,
}

impl StateManager {
	pub fn new(state_dir: impl Into<PathBuf>, profile: &str) -> Self {
		StateManager { state_dir: state_dir.into(), profile: profile.to_string() }
	}

	pub fn from_config(config: &Config) -> Self {
		Self::new(&config.state_dir, &config.profile)
	}

	pub fn state_dir(&self) -> &Path {
		&self.state_dir
	}

	/// Snapshot file path
	pub fn state_path(&self) -> PathBuf {
		self.state_dir.join(format!("{}.drive.json", self.profile))
	}

	/// Load the drive snapshot if one exists. The store has to be attached again.
	pub async fn load(&self) -> Result<Option<Drive>, StateError> {
		let path = self.state_path();
		if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
			return Ok(None);
		}

		let contents = tokio::fs::read_to_string(&path)
			.await
			.map_err(|e| StateError::LoadFailed { source: Box::new(e) })?;
		let drive = Drive::from_json(&contents).map_err(|e| StateError::Corrupted {
			message: format!("{}: {}", path.display(), e),
		})?;
		debug!("loaded snapshot of drive {} from {}", drive.id, path.display());
		Ok(Some(drive))
	}

	/// Save the drive snapshot (tree and index included)
	pub async fn save(&self, drive: &Drive) -> Result<(), StateError> {
		let json = drive.to_json().map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		let path = self.state_path();
		self.write_atomic(&path, json).await?;
		debug!("saved snapshot of drive {} to {}", drive.id, path.display());
		Ok(())
	}

	/// Delete the saved snapshot
	pub async fn clear(&self) -> Result<(), StateError> {
		let path = self.state_path();
		match tokio::fs::remove_file(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StateError::SaveFailed { source: Box::new(e) }),
		}
	}

	/// Write the index as a handshake payload named
	/// `<owner>-sync-index-<millis>.json`
	pub async fn save_index(&self, idx: &SyncIndex) -> Result<PathBuf, StateError> {
		let json = idx.to_json().map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or_default();
		let path = self.state_dir.join(format!("{}-sync-index-{}.json", idx.owner_id, millis));
		self.write_atomic(&path, json).await?;
		Ok(path)
	}

	/// Read a handshake payload written by [`StateManager::save_index`]
	pub async fn load_index(path: &Path) -> Result<SyncIndex, StateError> {
		let contents = tokio::fs::read_to_string(path)
			.await
			.map_err(|e| StateError::LoadFailed { source: Box::new(e) })?;
		SyncIndex::from_json(&contents).map_err(|e| StateError::Corrupted {
			message: format!("{}: {}", path.display(), e),
		})
	}

	async fn write_atomic(&self, path: &Path, contents: String) -> Result<(), StateError> {
		tokio::fs::create_dir_all(&self.state_dir)
			.await
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;

		let tmp = path.with_extension(TMP_SUFFIX);
		tokio::fs::write(&tmp, contents)
			.await
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		tokio::fs::rename(&tmp, path)
			.await
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })
	}

	/// Acquire an exclusive lock on the state directory
	pub async fn lock(&self) -> Result<StateLock, StateError> {
		tokio::fs::create_dir_all(&self.state_dir)
			.await
			.map_err(|e| StateError::LockFailed { message: format!("cannot create state dir: {}", e) })?;

		let lock_path = self.state_dir.join(LOCK_FILE);
		let file = tokio::fs::OpenOptions::new().write(true).create_new(true).open(&lock_path).await;
		match file {
			Ok(_) => {}
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
				return Err(StateError::LockFailed {
					message: format!(
						"sync already in progress (lock file exists). If stale, delete: {}",
						lock_path.display()
					),
				});
			}
			Err(e) => {
				return Err(StateError::LockFailed { message: format!("failed to create lock file: {}", e) })
			}
		}

		tokio::fs::write(&lock_path, std::process::id().to_string())
			.await
			.map_err(|e| StateError::LockFailed { message: format!("failed to write lock file: {}", e) })?;
		Ok(StateLock { path: lock_path })
	}
}

/// Lock guard, removes the lock file on drop
pub struct StateLock {
	path: PathBuf,
}

impl Drop for StateLock {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.path);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::DriveConfig;
	use crate::types::ChecksumAlgorithm;
	use tempfile::TempDir;

	fn drive(root: &Path) -> Drive {
		std::fs::write(root.join("a.txt"), b"alpha").unwrap();
		std::fs::create_dir(root.join("sub")).unwrap();
		std::fs::write(root.join("sub/b.txt"), b"bravo").unwrap();
		let mut d = Drive::new("alice", "u1", root, &DriveConfig::default());
		d.discover(ChecksumAlgorithm::default(), None).unwrap();
		d.build_index();
		d
	}

	#[test]
	fn test_state_path() {
		let manager = StateManager::new("/tmp", "myprofile");
		assert!(manager.state_path().to_string_lossy().ends_with("myprofile.drive.json"));
	}

	#[tokio::test]
	async fn test_save_load_snapshot() {
		let root = TempDir::new().unwrap();
		let state = TempDir::new().unwrap();
		let manager = StateManager::new(state.path(), "p");
		assert!(manager.load().await.unwrap().is_none());

		let d = drive(root.path());
		manager.save(&d).await.unwrap();
		let loaded = manager.load().await.unwrap().unwrap();
		assert_eq!(loaded.id, d.id);
		assert_eq!(loaded.tree().file_count(), 2);
		assert_eq!(loaded.index().last_sync.len(), 2);

		manager.clear().await.unwrap();
		assert!(manager.load().await.unwrap().is_none());
		manager.clear().await.unwrap();
	}

	#[tokio::test]
	async fn test_corrupt_snapshot() {
		let state = TempDir::new().unwrap();
		let manager = StateManager::new(state.path(), "p");
		tokio::fs::write(manager.state_path(), "{ not json").await.unwrap();
		assert!(matches!(manager.load().await, Err(StateError::Corrupted { .. })));
	}

	#[tokio::test]
	async fn test_index_payload() {
		let root = TempDir::new().unwrap();
		let state = TempDir::new().unwrap();
		let manager = StateManager::new(state.path(), "p");
		let d = drive(root.path());

		let path = manager.save_index(d.index()).await.unwrap();
		let name = path.file_name().unwrap().to_string_lossy().into_owned();
		assert!(name.starts_with("u1-sync-index-"));
		let idx = StateManager::load_index(&path).await.unwrap();
		assert_eq!(idx.last_sync, d.index().last_sync);
	}

	#[tokio::test]
	async fn test_lock_exclusive() {
		let state = TempDir::new().unwrap();
		let manager = StateManager::new(state.path(), "p");
		let guard = manager.lock().await.unwrap();
		assert!(matches!(manager.lock().await, Err(StateError::LockFailed { .. })));
		drop(guard);
		assert!(manager.lock().await.is_ok());
	}
}

// vim: ts=4
