//! Capacity-bounded transfer batches
//!
//! Candidates are sorted ascending by size and added first-fit: a file that
//! would overflow the remaining budget is set aside and the pass continues.
//! Sizes come from one fresh stat per file; a file that cannot be stat'ed
//! drops out of the current cycle.

use std::collections::BTreeMap;
use std::fmt;

use crate::file::File;
use crate::logging::*;
use crate::types::{BatchId, FileId};

/// Outcome of [`Batch::add_files`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
	/// Every candidate was added
	Success,
	/// Remaining budget is zero and candidates are left over
	CapMaxed,
	/// Budget remains but every leftover is larger than it
	UnderCap,
}

impl fmt::Display for BatchStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BatchStatus::Success => write!(f, "success"),
			BatchStatus::CapMaxed => write!(f, "capacity maxed"),
			BatchStatus::UnderCap => write!(f, "under capacity"),
		}
	}
}

/// A file together with the size it had when it was stat'ed
pub(crate) type SizedFile = (u64, File);

#[derive(Debug)]
pub struct AddReport {
	/// Files that did not fit
	pub left_over: Vec<File>,
	/// IDs already present in the batch (or repeated in the input)
	pub duplicates: Vec<FileId>,
	/// Files whose size could not be read
	pub failed: Vec<FileId>,
	pub status: BatchStatus,
}

/// A group of files selected for one transfer round
#[derive(Debug, Clone)]
pub struct Batch {
	pub id: BatchId,
	/// Remaining byte budget
	pub cap: u64,
	/// Total byte budget
	pub max: u64,
	pub files: BTreeMap<FileId, File>,
	/// Holds a file larger than the normal ceiling
	pub large: bool,
}

impl Batch {
	pub fn new(max: u64) -> Self {
		Batch { id: BatchId::new(), cap: max, max, files: BTreeMap::new(), large: false }
	}

	pub fn has_file(&self, id: &FileId) -> bool {
		self.files.contains_key(id)
	}

	pub fn len(&self) -> usize {
		self.files.len()
	}

	pub fn is_empty(&self) -> bool {
		self.files.is_empty()
	}

	/// Bytes committed to this batch
	pub fn used(&self) -> u64 {
		self.max - self.cap
	}

	pub fn files(&self) -> Vec<&File> {
		self.files.values().collect()
	}

	/// Add as many of `files` as the remaining budget allows
	pub fn add_files(&mut self, files: Vec<File>) -> AddReport {
		let (candidates, failed) = stat_all(files);
		let (left, status, duplicates) = self.pack(candidates);
		AddReport { left_over: left.into_iter().map(|(_, f)| f).collect(), duplicates, failed, status }
	}

	/// First-fit over candidates sorted by (size, id)
	pub(crate) fn pack(&mut self, mut candidates: Vec<SizedFile>) -> (Vec<SizedFile>, BatchStatus, Vec<FileId>) {
		candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.id.cmp(&b.1.id)));

		let mut left = Vec::new();
		let mut duplicates = Vec::new();
		for (size, file) in candidates {
			if self.has_file(&file.id) {
				debug!("file (id={}) already present, skipping", file.id);
				duplicates.push(file.id);
				continue;
			}
			if size <= self.cap {
				self.cap -= size;
				self.files.insert(file.id, file);
			} else {
				debug!("file size ({} bytes) exceeds remaining batch capacity ({} bytes)", size, self.cap);
				left.push((size, file));
			}
		}
		if !duplicates.is_empty() {
			debug!("{} duplicates in supplied file list", duplicates.len());
		}

		let status = if left.is_empty() {
			BatchStatus::Success
		} else if self.cap == 0 {
			BatchStatus::CapMaxed
		} else {
			BatchStatus::UnderCap
		};
		debug!("batch {}: {} files, {} bytes left, {}", self.id, self.len(), self.cap, status);
		(left, status, duplicates)
	}

	/// Add files regardless of the byte budget. The batch is flagged large
	/// and its budget grows to what it holds.
	pub fn add_large_files(&mut self, files: Vec<File>) -> usize {
		let (candidates, _) = stat_all(files);
		self.add_large(candidates)
	}

	pub(crate) fn add_large(&mut self, candidates: Vec<SizedFile>) -> usize {
		let mut added = 0;
		let mut used = self.used();
		for (size, file) in candidates {
			if self.has_file(&file.id) {
				continue;
			}
			used += size;
			self.files.insert(file.id, file);
			added += 1;
		}
		self.large = true;
		self.max = self.max.max(used);
		self.cap = self.max - used;
		added
	}
}

/// Stat every file once. Unreadable files are logged and returned by ID.
pub(crate) fn stat_all(files: Vec<File>) -> (Vec<SizedFile>, Vec<FileId>) {
	let mut sized = Vec::with_capacity(files.len());
	let mut failed = Vec::new();
	for file in files {
		match file.size() {
			Ok(size) => sized.push((size, file)),
			Err(e) => {
				warn!("dropping {} from this cycle: {}", file.path.display(), e);
				failed.push(file.id);
			}
		}
	}
	(sized, failed)
}


// vim: ts=4
