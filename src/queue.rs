//! Transfer queues built from a sync index
//!
//! Queue building stops on one rule: keep opening fresh batches while files
//! remain. A file that a fresh, empty batch cannot hold is larger than the
//! ceiling; such files are split out up front and each one gets its own
//! flagged batch in the large-file queue.

use std::collections::{BTreeSet, VecDeque};

use crate::batch::{stat_all, Batch, SizedFile};
use crate::file::File;
use crate::index::SyncIndex;
use crate::logging::*;

/// FIFO sequence of batches
#[derive(Debug, Clone, Default)]
pub struct Queue {
	batches: VecDeque<Batch>,
}

impl Queue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn enqueue(&mut self, batch: Batch) {
		self.batches.push_back(batch);
	}

	pub fn dequeue(&mut self) -> Option<Batch> {
		self.batches.pop_front()
	}

	pub fn len(&self) -> usize {
		self.batches.len()
	}

	pub fn is_empty(&self) -> bool {
		self.batches.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Batch> {
		self.batches.iter()
	}

	/// Number of files across all batches
	pub fn file_count(&self) -> usize {
		self.batches.iter().map(Batch::len).sum()
	}

	/// Bytes across all batches
	pub fn total_bytes(&self) -> u64 {
		self.batches.iter().map(Batch::used).sum()
	}
}

/// Normal and large-file queues for one transfer cycle
#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
	pub queue: Queue,
	pub large: Queue,
}

impl TransferPlan {
	pub fn is_empty(&self) -> bool {
		self.queue.is_empty() && self.large.is_empty()
	}

	pub fn file_count(&self) -> usize {
		self.queue.file_count() + self.large.file_count()
	}

	/// Normal batches first, then large ones
	pub fn into_batches(self) -> impl Iterator<Item = Batch> {
		self.queue.batches.into_iter().chain(self.large.batches)
	}
}

/// Pack the working set of an index
pub fn build_queue(idx: &SyncIndex, capacity: u64) -> TransferPlan {
	build_queue_from(idx.files(), capacity)
}

/// Pack a flat list of files into batches of at most `capacity` bytes
pub fn build_queue_from(files: Vec<File>, capacity: u64) -> TransferPlan {
	let mut plan = TransferPlan::default();
	if files.is_empty() {
		debug!("no files matched for syncing");
		return plan;
	}

	let mut seen = BTreeSet::new();
	let unique: Vec<File> = files.into_iter().filter(|f| seen.insert(f.id)).collect();
	let (sized, _) = stat_all(unique);
	let (mut pending, oversized): (Vec<SizedFile>, Vec<SizedFile>) =
		sized.into_iter().partition(|(size, _)| *size <= capacity);

	if pending.is_empty() && !oversized.is_empty() {
		warn!("all files exceed the batch ceiling, using the large-file queue only");
	}

	let mut stragglers = oversized;
	while !pending.is_empty() {
		let mut batch = Batch::new(capacity);
		let (left, _, _) = batch.pack(pending);
		if batch.is_empty() {
			// a fresh batch took nothing: everything left is oversized
			stragglers.extend(left);
			break;
		}
		plan.queue.enqueue(batch);
		pending = left;
	}

	for candidate in stragglers {
		let mut batch = Batch::new(capacity);
		batch.add_large(vec![candidate]);
		plan.large.enqueue(batch);
	}

	debug!(
		"queue built: {} batches, {} large-file batches, {} files",
		plan.queue.len(),
		plan.large.len(),
		plan.file_count()
	);
	plan
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;
	use std::fs;
	use std::path::Path;
	use tempfile::TempDir;

	fn sized_file(dir: &Path, name: &str, size: usize) -> File {
		let path = dir.join(name);
		fs::write(&path, vec![1u8; size]).unwrap();
		File::discover(path, "o", Default::default()).unwrap()
	}

	fn assert_each_file_once(plan: &TransferPlan, files: &[File]) {
		let mut counts: BTreeMap<_, usize> = BTreeMap::new();
		for batch in plan.queue.iter().chain(plan.large.iter()) {
			for id in batch.files.keys() {
				*counts.entry(*id).or_default() += 1;
			}
		}
		assert_eq!(counts.len(), files.len());
		assert!(counts.values().all(|c| *c == 1));
	}

	#[test]
	fn test_queue_fifo() {
		let mut q = Queue::new();
		let a = Batch::new(1);
		let b = Batch::new(2);
		let (ida, idb) = (a.id, b.id);
		q.enqueue(a);
		q.enqueue(b);
		assert_eq!(q.dequeue().map(|b| b.id), Some(ida));
		assert_eq!(q.dequeue().map(|b| b.id), Some(idb));
		assert!(q.dequeue().is_none());
	}

	#[test]
	fn test_batch_count_bounds() {
		let tmp = TempDir::new().unwrap();
		let sizes = [30, 70, 10, 55, 45, 20, 90, 5, 60, 15];
		let files: Vec<File> =
			sizes.iter().enumerate().map(|(i, s)| sized_file(tmp.path(), &format!("f{}", i), *s)).collect();
		let total: u64 = sizes.iter().map(|s| *s as u64).sum();
		let capacity = 100;

		let plan = build_queue_from(files.clone(), capacity);
		let lower = total.div_ceil(capacity) as usize;
		assert!(plan.queue.len() >= lower);
		assert!(plan.queue.len() <= files.len());
		assert!(plan.large.is_empty());
		assert!(plan.queue.iter().all(|b| b.used() <= capacity && !b.is_empty()));
		assert_each_file_once(&plan, &files);
	}

	#[test]
	fn test_oversized_files_go_to_large_queue() {
		let tmp = TempDir::new().unwrap();
		let files = vec![
			sized_file(tmp.path(), "small", 10),
			sized_file(tmp.path(), "huge1", 500),
			sized_file(tmp.path(), "huge2", 300),
		];
		let plan = build_queue_from(files.clone(), 100);
		assert_eq!(plan.queue.len(), 1);
		assert_eq!(plan.large.len(), 2);
		assert!(plan.large.iter().all(|b| b.large && b.len() == 1));
		assert_each_file_once(&plan, &files);
	}

	#[test]
	fn test_all_oversized() {
		let tmp = TempDir::new().unwrap();
		let files = vec![sized_file(tmp.path(), "a", 200), sized_file(tmp.path(), "b", 300)];
		let plan = build_queue_from(files, 100);
		assert!(plan.queue.is_empty());
		assert_eq!(plan.large.len(), 2);
	}

	#[test]
	fn test_duplicates_and_missing_files() {
		let tmp = TempDir::new().unwrap();
		let a = sized_file(tmp.path(), "a", 10);
		let ghost = File::new("ghost", "o", tmp.path().join("ghost"));
		let plan = build_queue_from(vec![a.clone(), a.clone(), ghost], 100);
		assert_eq!(plan.file_count(), 1);
	}

	#[test]
	fn test_from_index() {
		let tmp = TempDir::new().unwrap();
		let mut idx = SyncIndex::new("o");
		for i in 0..4 {
			idx.index_new_file(&sized_file(tmp.path(), &format!("f{}", i), 40));
		}
		let plan = build_queue(&idx, 100);
		assert_eq!(plan.queue.len(), 2);
		assert_eq!(plan.file_count(), 4);

		let empty = build_queue(&SyncIndex::new("o"), 100);
		assert!(empty.is_empty());
	}
}

// vim: ts=4
