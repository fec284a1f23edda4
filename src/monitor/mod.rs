//! Live file-change monitor
//!
//! One polling task per watched path feeds a shared event channel. Files
//! and directories are both watched, so entries created later are picked
//! up. A [`Listener`] drains the channel, applies each event to the drive
//! and asks for sync cycles.

mod event;
mod listener;
mod watcher;

pub use event::{Event, EventKind};
pub use listener::{Listener, ListenerStats, SyncRequest};
pub use watcher::{WatchState, Watcher};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::drive::SharedDrive;
use crate::exclusion::PatternMatcher;
use crate::fs::FileSystem;
use crate::logging::*;
use crate::types::{ChecksumAlgorithm, FileId};

const EVENT_CHANNEL_SIZE: usize = 256;

struct WatchHandle {
	stop: watch::Sender<bool>,
	task: JoinHandle<WatchState>,
}

/// Registry of watcher tasks
pub struct Monitor {
	config: MonitorConfig,
	fs: Arc<dyn FileSystem>,
	events: mpsc::Sender<Event>,
	watchers: Mutex<HashMap<PathBuf, WatchHandle>>,
}

impl Monitor {
	pub fn new(config: MonitorConfig, fs: Arc<dyn FileSystem>) -> (Self, mpsc::Receiver<Event>) {
		let (events, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
		let monitor = Monitor { config, fs, events, watchers: Mutex::new(HashMap::new()) };
		(monitor, rx)
	}

	fn watchers(&self) -> MutexGuard<'_, HashMap<PathBuf, WatchHandle>> {
		self.watchers.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Start a watcher task for a file or directory at `path`. Must be called
	/// inside a tokio runtime. Returns false if a live watcher already covers
	/// the path.
	pub fn watch_file(&self, path: impl AsRef<Path>, file_id: Option<FileId>) -> bool {
		let path = path.as_ref().to_path_buf();
		let mut watchers = self.watchers();
		if let Some(handle) = watchers.get(&path) {
			if !handle.task.is_finished() {
				return false;
			}
		}

		let (stop, stop_rx) = watch::channel(false);
		let watcher = Watcher::new(path.clone(), file_id, Arc::clone(&self.fs), self.config.clone());
		let task = tokio::spawn(watcher.run(self.events.clone(), stop_rx));
		watchers.insert(path, WatchHandle { stop, task });
		true
	}

	/// Watch the root, every directory and every file tracked by a drive.
	/// Paths already watched are skipped, so this is safe to call again
	/// after the tree grew.
	pub async fn watch_drive(&self, drive: &SharedDrive) -> usize {
		let targets: Vec<(PathBuf, Option<FileId>)> = {
			let drive = drive.read().await;
			let dirs = drive.dirs().into_values().map(|d| (d.path.clone(), None));
			let files = drive.files().into_values().map(|f| (f.path.clone(), Some(f.id)));
			std::iter::once((drive.root_path().to_path_buf(), None)).chain(dirs).chain(files).collect()
		};
		let started = targets.into_iter().filter(|(path, id)| self.watch_file(path, *id)).count();
		if started > 0 {
			info!("watching {} more paths", started);
		}
		started
	}

	/// Signal the watcher on `path` to stop. Returns false if none was registered.
	pub fn stop(&self, path: &Path) -> bool {
		match self.watchers().remove(path) {
			Some(handle) => {
				let _ = handle.stop.send(true);
				true
			}
			None => false,
		}
	}

	pub fn stop_all(&self) {
		for (_, handle) in self.watchers().drain() {
			let _ = handle.stop.send(true);
		}
	}

	/// Stop every watcher and wait for the tasks to exit
	pub async fn shutdown(&self) {
		let handles: Vec<WatchHandle> = self.watchers().drain().map(|(_, h)| h).collect();
		for handle in handles {
			let _ = handle.stop.send(true);
			if let Err(e) = handle.task.await {
				warn!("watcher task failed: {}", e);
			}
		}
	}

	pub fn is_watching(&self, path: &Path) -> bool {
		self.watchers().get(path).is_some_and(|h| !h.task.is_finished())
	}

	/// Paths with a live watcher
	pub fn watched(&self) -> Vec<PathBuf> {
		let mut paths: Vec<PathBuf> =
			self.watchers().iter().filter(|(_, h)| !h.task.is_finished()).map(|(p, _)| p.clone()).collect();
		paths.sort();
		paths
	}
}

impl Drop for Monitor {
	fn drop(&mut self) {
		self.stop_all();
	}
}

/// A running monitor plus its listener task
pub struct Session {
	pub monitor: Arc<Monitor>,
	stop: watch::Sender<bool>,
	listener: JoinHandle<ListenerStats>,
}

impl Session {
	/// Watch `drive` and start the listener. New paths are filtered through
	/// `matcher` before they are tracked. The receiver yields the sync
	/// requests the listener raises.
	pub async fn start(
		drive: SharedDrive,
		config: MonitorConfig,
		fs: Arc<dyn FileSystem>,
		algorithm: ChecksumAlgorithm,
		matcher: Option<PatternMatcher>,
	) -> (Session, mpsc::Receiver<SyncRequest>) {
		let (monitor, events) = Monitor::new(config.clone(), fs);
		let monitor = Arc::new(monitor);
		monitor.watch_drive(&drive).await;

		let (signal_tx, signals) = mpsc::channel(EVENT_CHANNEL_SIZE);
		let (stop, stop_rx) = watch::channel(false);
		let listener = Listener::new(drive, Arc::clone(&monitor), config, algorithm).with_matcher(matcher);
		let listener = tokio::spawn(listener.run(events, signal_tx, stop_rx));
		(Session { monitor, stop, listener }, signals)
	}

	/// Stop the watchers and the listener
	pub async fn stop(self) -> ListenerStats {
		self.monitor.shutdown().await;
		let _ = self.stop.send(true);
		match self.listener.await {
			Ok(stats) => stats,
			Err(e) => {
				error!("listener task failed: {}", e);
				ListenerStats::default()
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fs::LocalFs;
	use std::fs;
	use std::time::Duration;
	use tempfile::TempDir;

	fn fast() -> MonitorConfig {
		MonitorConfig { poll_active_ms: 10, poll_idle_ms: 20, idle_after: 5, max_retries: 2, ..MonitorConfig::default() }
	}

	#[tokio::test]
	async fn test_watch_registry() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("f");
		fs::write(&path, b"x").unwrap();

		let (monitor, _rx) = Monitor::new(fast(), Arc::new(LocalFs));
		assert!(monitor.watch_file(&path, None));
		assert!(!monitor.watch_file(&path, None));
		assert!(monitor.is_watching(&path));
		assert_eq!(monitor.watched(), vec![path.clone()]);

		assert!(monitor.stop(&path));
		assert!(!monitor.stop(&path));
		assert!(!monitor.is_watching(&path));
	}

	#[tokio::test]
	async fn test_watch_drive_covers_dirs() {
		let tmp = TempDir::new().unwrap();
		fs::create_dir(tmp.path().join("sub")).unwrap();
		fs::write(tmp.path().join("sub").join("f"), b"x").unwrap();
		let mut drive = crate::drive::Drive::new("o", "owner", tmp.path(), &crate::config::DriveConfig::default());
		drive.discover(ChecksumAlgorithm::default(), None).unwrap();
		let drive = drive.shared();

		let (monitor, _rx) = Monitor::new(fast(), Arc::new(LocalFs));
		assert_eq!(monitor.watch_drive(&drive).await, 3);
		assert_eq!(monitor.watched(), vec![tmp.path().to_path_buf(), tmp.path().join("sub"), tmp.path().join("sub").join("f")]);
		assert_eq!(monitor.watch_drive(&drive).await, 0);
		monitor.shutdown().await;
	}

	#[tokio::test]
	async fn test_delete_detected() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("f");
		fs::write(&path, b"x").unwrap();

		let (monitor, mut rx) = Monitor::new(fast(), Arc::new(LocalFs));
		let id = FileId::new();
		monitor.watch_file(&path, Some(id));
		fs::remove_file(&path).unwrap();

		let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
		assert_eq!(event.kind, EventKind::Delete);
		assert_eq!(event.file_id, Some(id));
		monitor.shutdown().await;
	}
}

// vim: ts=4
