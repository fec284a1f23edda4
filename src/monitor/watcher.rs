//! Stat-polling watcher for a single path
//!
//! State machine: Idle -> Watching -> (Changed | Deleted) -> Idle. A watcher
//! started on a missing path stays Idle until the path appears, which is
//! reported as a create. Changed is transient: the next poll goes back to
//! Watching. Deleted ends the watch.
//!
//! A watcher on a directory also lists it on every poll and reports each
//! entry that was not there before as a create for that entry. Directories
//! never report changes of their own.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};

use super::event::{Event, EventKind};
use crate::config::MonitorConfig;
use crate::fs::{FileStat, FileSystem};
use crate::logging::*;
use crate::types::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
	Idle,
	Watching,
	Changed,
	Deleted,
}

pub struct Watcher {
	path: PathBuf,
	file_id: Option<FileId>,
	fs: Arc<dyn FileSystem>,
	config: MonitorConfig,

	state: WatchState,
	last: Option<FileStat>,
	quiet_polls: u32,
	failures: u32,

	/// Known entries, for directories only
	entries: Option<BTreeSet<PathBuf>>,
	pending: VecDeque<Event>,
}

impl Watcher {
	/// Take the baseline stat right away. An existing path starts Watching.
	pub fn new(path: impl Into<PathBuf>, file_id: Option<FileId>, fs: Arc<dyn FileSystem>, config: MonitorConfig) -> Self {
		let path = path.into();
		let last = fs.stat(&path).ok().flatten();
		let state = if last.is_some() { WatchState::Watching } else { WatchState::Idle };
		let mut watcher = Watcher {
			path,
			file_id,
			fs,
			config,
			state,
			last,
			quiet_polls: 0,
			failures: 0,
			entries: None,
			pending: VecDeque::new(),
		};
		if last.is_some_and(|s| s.is_dir) {
			watcher.entries = Some(watcher.list());
		}
		watcher
	}

	fn list(&self) -> BTreeSet<PathBuf> {
		match self.fs.list(&self.path) {
			Ok(paths) => paths.into_iter().collect(),
			Err(e) => {
				warn!("cannot list {}: {}", self.path.display(), e);
				BTreeSet::new()
			}
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn state(&self) -> WatchState {
		self.state
	}

	/// Tight after recent activity, relaxed once the path has been quiet
	pub fn interval(&self) -> Duration {
		if self.quiet_polls >= self.config.idle_after {
			Duration::from_millis(self.config.poll_idle_ms)
		} else {
			Duration::from_millis(self.config.poll_active_ms)
		}
	}

	fn event(&self, kind: EventKind, time: SystemTime) -> Event {
		Event::new(kind, &self.path, self.file_id, time)
	}

	/// Stat the path once and advance the state machine. Events queued by a
	/// directory listing come out first, one per call.
	pub fn poll(&mut self) -> Option<Event> {
		if let Some(event) = self.pending.pop_front() {
			return Some(event);
		}
		match self.state {
			WatchState::Deleted => None,
			WatchState::Idle => self.poll_idle(),
			WatchState::Watching | WatchState::Changed => {
				self.state = WatchState::Watching;
				self.poll_watching()
			}
		}
	}

	fn poll_idle(&mut self) -> Option<Event> {
		match self.fs.stat(&self.path) {
			Ok(Some(stat)) => {
				self.last = Some(stat);
				self.state = WatchState::Watching;
				self.quiet_polls = 0;
				if stat.is_dir {
					self.entries = Some(self.list());
				}
				Some(self.event(EventKind::Create, stat.modified))
			}
			_ => {
				self.quiet_polls = self.quiet_polls.saturating_add(1);
				None
			}
		}
	}

	fn poll_watching(&mut self) -> Option<Event> {
		let stat = match self.fs.stat(&self.path) {
			Ok(Some(stat)) => stat,
			Ok(None) => return self.stat_failed("not found".to_string()),
			Err(e) => return self.stat_failed(e.to_string()),
		};

		self.failures = 0;
		if self.entries.is_some() {
			self.last = Some(stat);
			return self.poll_entries(stat.modified);
		}
		let changed = match self.last {
			Some(prev) => prev.size != stat.size || prev.modified != stat.modified,
			None => true,
		};
		self.last = Some(stat);
		if changed {
			self.state = WatchState::Changed;
			self.quiet_polls = 0;
			Some(self.event(EventKind::Change, stat.modified))
		} else {
			self.quiet_polls = self.quiet_polls.saturating_add(1);
			None
		}
	}

	fn poll_entries(&mut self, time: SystemTime) -> Option<Event> {
		let current = self.list();
		let known = self.entries.get_or_insert_with(BTreeSet::new);
		let fresh: Vec<PathBuf> = current.difference(known).cloned().collect();
		*known = current;

		if fresh.is_empty() {
			self.quiet_polls = self.quiet_polls.saturating_add(1);
			return None;
		}
		self.quiet_polls = 0;
		self.state = WatchState::Changed;
		self.pending.extend(fresh.into_iter().map(|path| Event::new(EventKind::Create, path, None, time)));
		self.pending.pop_front()
	}

	fn stat_failed(&mut self, reason: String) -> Option<Event> {
		self.failures += 1;
		if self.failures < self.config.max_retries {
			warn!("stat of {} failed ({}), retry {}/{}", self.path.display(), reason, self.failures, self.config.max_retries);
			self.quiet_polls = 0;
			return None;
		}
		self.state = WatchState::Deleted;
		Some(self.event(EventKind::Delete, SystemTime::now()))
	}

	/// Poll until stopped, deleted, or the event receiver goes away
	pub async fn run(mut self, events: mpsc::Sender<Event>, mut stop: watch::Receiver<bool>) -> WatchState {
		debug!("watching {}", self.path.display());
		loop {
			if *stop.borrow() {
				break;
			}
			let mut next = self.poll();
			while let Some(event) = next {
				let kind = event.kind;
				if events.send(event).await.is_err() {
					debug!("event channel closed, stopping watch on {}", self.path.display());
					return self.finish();
				}
				if kind == EventKind::Delete {
					return self.finish();
				}
				next = self.pending.pop_front();
			}
			tokio::select! {
				changed = stop.changed() => {
					if changed.is_err() || *stop.borrow() {
						break;
					}
				}
				_ = tokio::time::sleep(self.interval()) => {}
			}
		}
		self.finish()
	}

	fn finish(mut self) -> WatchState {
		let end = self.state;
		if end != WatchState::Deleted {
			self.state = WatchState::Idle;
		}
		debug!("watch on {} ended ({:?})", self.path.display(), end);
		self.state
	}
}


// vim: ts=4
