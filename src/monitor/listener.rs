//! Applies watcher events to a drive and signals sync cycles

use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::event::{Event, EventKind};
use super::Monitor;
use crate::config::MonitorConfig;
use crate::drive::SharedDrive;
use crate::error::{ItemKind, Result, SyncError};
use crate::exclusion::PatternMatcher;
use crate::logging::*;
use crate::types::{ChecksumAlgorithm, FileId};

/// Asks the engine to run a sync cycle for the events collected so far
#[derive(Debug, Clone)]
pub struct SyncRequest {
	pub events: Vec<Event>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
	pub received: usize,
	pub applied: usize,
	pub failed: usize,
	pub signals: usize,
}

pub struct Listener {
	drive: SharedDrive,
	monitor: Arc<Monitor>,
	config: MonitorConfig,
	algorithm: ChecksumAlgorithm,
	matcher: Option<PatternMatcher>,
	pending: Vec<Event>,
}

impl Listener {
	pub fn new(drive: SharedDrive, monitor: Arc<Monitor>, config: MonitorConfig, algorithm: ChecksumAlgorithm) -> Self {
		Listener { drive, monitor, config, algorithm, matcher: None, pending: Vec::new() }
	}

	/// Leave out new paths the matcher excludes
	pub fn with_matcher(mut self, matcher: Option<PatternMatcher>) -> Self {
		self.matcher = matcher;
		self
	}

	/// Update drive and index state for one event
	pub async fn apply(&self, event: &Event) -> Result<()> {
		debug!("{} event for {}", event.kind, event.path.display());
		match event.kind {
			EventKind::Change => {
				let mut drive = self.drive.write().await;
				let id = resolve(event, drive.find_by_path(&event.path))?;
				let size = drive.record_change(&id, event.time)?;
				debug!("{} now {} bytes", event.path.display(), size);
				Ok(())
			}
			EventKind::Delete => self.forget(event).await,
			EventKind::Create => self.track_new(event).await,
		}
	}

	async fn forget(&self, event: &Event) -> Result<()> {
		let mut drive = self.drive.write().await;
		if event.file_id.is_none() {
			if let Some(dir_id) = drive.dir_by_path(&event.path) {
				let removed = drive.forget_dir(&dir_id)?;
				drop(drive);
				for dir in &removed {
					self.monitor.stop(&dir.path);
					for file in dir.files.values() {
						self.monitor.stop(&file.path);
					}
				}
				info!("{} deleted, dropped {} directories", event.path.display(), removed.len());
				return Ok(());
			}
		}

		let id = resolve(event, drive.find_by_path(&event.path))?;
		let file = drive.forget_file(&id)?;
		self.monitor.stop(&event.path);
		info!("{} deleted, dropped from drive and index", file.path.display());
		Ok(())
	}

	async fn track_new(&self, event: &Event) -> Result<()> {
		let mut drive = self.drive.write().await;
		if let Some(id) = drive.find_by_path(&event.path) {
			drive.record_change(&id, event.time)?;
			return Ok(());
		}
		if drive.dir_by_path(&event.path).is_some() {
			return Ok(());
		}

		let parent = event.path.parent().unwrap_or_else(|| Path::new("/"));
		let dir_id = drive
			.dir_by_path(parent)
			.ok_or_else(|| SyncError::not_found(ItemKind::Directory, parent.display()))?;
		let report = drive.discover_from(&dir_id, self.algorithm, self.matcher.as_ref())?;

		// first sync of new files is explicit
		let indexed = drive.index_new_files();
		drop(drive);

		// a watcher started on a missing path carries no ID, so replace it
		self.monitor.stop(&event.path);
		self.monitor.watch_drive(&self.drive).await;
		info!(
			"{} created: {} files and {} directories now tracked, {} queued",
			event.path.display(),
			report.files_added,
			report.dirs_added,
			indexed
		);
		Ok(())
	}

	fn buffer(&mut self, event: Event) -> Option<SyncRequest> {
		if !self.config.buffered {
			return Some(SyncRequest { events: vec![event] });
		}
		self.pending.push(event);
		if self.pending.len() >= self.config.buffer_size {
			return Some(SyncRequest { events: std::mem::take(&mut self.pending) });
		}
		None
	}

	/// Consume events until stopped or the channel closes
	pub async fn run(
		mut self,
		mut events: mpsc::Receiver<Event>,
		signals: mpsc::Sender<SyncRequest>,
		mut stop: watch::Receiver<bool>,
	) -> ListenerStats {
		let mut stats = ListenerStats::default();
		loop {
			tokio::select! {
				changed = stop.changed() => {
					if changed.is_err() || *stop.borrow() {
						break;
					}
				}
				event = events.recv() => {
					let Some(event) = event else { break };
					stats.received += 1;
					match self.apply(&event).await {
						Ok(()) => stats.applied += 1,
						Err(e) => {
							warn!("could not apply {} event for {}: {}", event.kind, event.path.display(), e);
							stats.failed += 1;
						}
					}
					if let Some(request) = self.buffer(event) {
						stats.signals += 1;
						if signals.send(request).await.is_err() {
							debug!("no sync consumer, dropping signal");
						}
					}
				}
			}
		}

		if !self.pending.is_empty() {
			let request = SyncRequest { events: std::mem::take(&mut self.pending) };
			if signals.try_send(request).is_ok() {
				stats.signals += 1;
			}
		}
		debug!("listener stopped: {:?}", stats);
		stats
	}
}

fn resolve(event: &Event, by_path: Option<FileId>) -> Result<FileId> {
	event
		.file_id
		.or(by_path)
		.ok_or_else(|| SyncError::not_found(ItemKind::File, event.path.display()))
}


// vim: ts=4
