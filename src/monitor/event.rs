//! File events emitted by watchers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::types::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
	Create,
	Change,
	Delete,
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EventKind::Create => write!(f, "create"),
			EventKind::Change => write!(f, "change"),
			EventKind::Delete => write!(f, "delete"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
	pub kind: EventKind,

	/// Path of the file the event refers to
	pub path: PathBuf,

	/// Tracked file, if the watcher was started for one
	pub file_id: Option<FileId>,

	/// Modification time observed for create/change, detection time for delete
	pub time: SystemTime,
}

impl Event {
	pub fn new(kind: EventKind, path: impl Into<PathBuf>, file_id: Option<FileId>, time: SystemTime) -> Self {
		Event { kind, path: path.into(), file_id, time }
	}
}

// vim: ts=4
