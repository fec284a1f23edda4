//! Transfer collaborator and the batch dispatcher
//!
//! Transfers replace whole files. Every upload or download is verified by
//! comparing checksums on both sides afterwards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Semaphore;

use crate::batch::Batch;
use crate::error::{Result, SyncError};
use crate::file::{calculate_checksum, File};
use crate::logging::*;
use crate::queue::TransferPlan;
use crate::types::{ChecksumAlgorithm, FileId, Method};

/// Moves whole files to and from a remote side addressed by endpoint strings
#[async_trait]
pub trait Transfer: Send + Sync {
	/// Send the file's content to `endpoint`. `Post` creates, `Put` replaces.
	async fn upload(&self, method: Method, file: &File, endpoint: &str) -> Result<()>;

	/// Fetch the content at `endpoint` into `dest`
	async fn download(&self, dest: &Path, endpoint: &str) -> Result<()>;

	async fn exists(&self, endpoint: &str) -> Result<bool>;

	/// Checksum of the content stored at `endpoint`
	async fn checksum(&self, endpoint: &str, algorithm: ChecksumAlgorithm) -> Result<String>;
}

/// Transfer into a directory on the local disk; endpoints are relative paths
#[derive(Debug, Clone)]
pub struct LocalTransfer {
	root: PathBuf,
}

impl LocalTransfer {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		LocalTransfer { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn resolve(&self, endpoint: &str) -> Result<PathBuf> {
		let rel = Path::new(endpoint.trim_start_matches('/'));
		if rel.as_os_str().is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
			return Err(SyncError::Transfer {
				file: endpoint.to_string(),
				message: "invalid endpoint".to_string(),
			});
		}
		Ok(self.root.join(rel))
	}
}

/// Copy through a temporary sibling so readers never see a partial file
async fn replace(src: &Path, dest: &Path) -> Result<()> {
	if let Some(parent) = dest.parent() {
		tokio::fs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent, e))?;
	}
	let name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
	let tmp = dest.with_file_name(format!(".{}.sfsync-tmp", name));
	tokio::fs::copy(src, &tmp).await.map_err(|e| SyncError::io(src, e))?;
	tokio::fs::rename(&tmp, dest).await.map_err(|e| SyncError::io(dest, e))
}

#[async_trait]
impl Transfer for LocalTransfer {
	async fn upload(&self, method: Method, file: &File, endpoint: &str) -> Result<()> {
		let dest = self.resolve(endpoint)?;
		if method == Method::Post && self.exists(endpoint).await? {
			return Err(SyncError::Transfer {
				file: file.name.clone(),
				message: format!("{} already exists", endpoint),
			});
		}
		replace(&file.path, &dest).await
	}

	async fn download(&self, dest: &Path, endpoint: &str) -> Result<()> {
		let src = self.resolve(endpoint)?;
		replace(&src, dest).await
	}

	async fn exists(&self, endpoint: &str) -> Result<bool> {
		let path = self.resolve(endpoint)?;
		tokio::fs::try_exists(&path).await.map_err(|e| SyncError::io(path, e))
	}

	async fn checksum(&self, endpoint: &str, algorithm: ChecksumAlgorithm) -> Result<String> {
		let path = self.resolve(endpoint)?;
		tokio::task::spawn_blocking(move || calculate_checksum(&path, algorithm))
			.await
			.map_err(|e| SyncError::Other { message: format!("checksum task failed: {}", e) })?
	}
}

/// Measured link capacity in bytes per second. Zero means unmeasured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
	pub up_rate: f64,
	pub down_rate: f64,
}

impl NetworkProfile {
	/// Bytes per second one transfer round may use (75% of the mean rate)
	pub fn budget(&self) -> u64 {
		((self.down_rate * 0.75 + self.up_rate * 0.75) / 2.0).max(0.0) as u64
	}

	/// Number of concurrent transfers for files of `avg_size` bytes: as many
	/// as the budget moves within `window_secs`, between 1 and `max_workers`
	pub fn pool_size(&self, avg_size: u64, window_secs: u64, max_workers: usize) -> usize {
		let max_workers = max_workers.max(1);
		let budget = self.budget().saturating_mul(window_secs.max(1));
		if budget == 0 {
			return max_workers;
		}
		if avg_size == 0 {
			return max_workers;
		}
		let fits = (budget / avg_size) as usize;
		fits.clamp(1, max_workers)
	}
}

/// A file that reached the other side intact
#[derive(Debug, Clone)]
pub struct SyncedFile {
	pub id: FileId,
	/// Sync timestamp of the copy that was sent
	pub time: SystemTime,
	pub checksum: String,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
	pub synced: Vec<SyncedFile>,
	pub failed: Vec<(FileId, SyncError)>,
}

impl DispatchReport {
	fn merge(&mut self, other: DispatchReport) {
		self.synced.extend(other.synced);
		self.failed.extend(other.failed);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
	Push,
	Pull,
}

/// Fans a batch out to a bounded worker pool and collects the results
pub struct Dispatcher {
	transfer: Arc<dyn Transfer>,
	root: PathBuf,
	workers: usize,
}

impl Dispatcher {
	/// `root` is the local drive root endpoints are derived from
	pub fn new(transfer: Arc<dyn Transfer>, root: impl Into<PathBuf>, workers: usize) -> Self {
		Dispatcher { transfer, root: root.into(), workers: workers.max(1) }
	}

	pub fn workers(&self) -> usize {
		self.workers
	}

	/// Upload every batch of the plan, normal queue first
	pub async fn push_plan(&self, plan: TransferPlan) -> DispatchReport {
		let mut report = DispatchReport::default();
		for batch in plan.into_batches() {
			report.merge(self.push_batch(&batch).await);
		}
		report
	}

	pub async fn push_batch(&self, batch: &Batch) -> DispatchReport {
		self.run(batch, Direction::Push).await
	}

	/// Download the remote copy of every file in the batch over the local one
	pub async fn pull_batch(&self, batch: &Batch) -> DispatchReport {
		self.run(batch, Direction::Pull).await
	}

	async fn run(&self, batch: &Batch, direction: Direction) -> DispatchReport {
		debug!("dispatching batch {} ({} files, {:?}) on {} workers", batch.id, batch.len(), direction, self.workers);
		let semaphore = Arc::new(Semaphore::new(self.workers));

		let mut ids = Vec::with_capacity(batch.len());
		let mut handles = Vec::with_capacity(batch.len());
		for file in batch.files.values() {
			ids.push(file.id);
			let file = file.clone();
			let endpoint = endpoint_for(&file, &self.root);
			let transfer = Arc::clone(&self.transfer);
			let semaphore = Arc::clone(&semaphore);
			handles.push(tokio::spawn(async move {
				let _permit = semaphore.acquire_owned().await;
				let result = match direction {
					Direction::Push => push_one(transfer.as_ref(), &file, &endpoint).await,
					Direction::Pull => pull_one(transfer.as_ref(), &file, &endpoint).await,
				};
				(file.last_sync, result)
			}));
		}

		let mut report = DispatchReport::default();
		for (id, joined) in ids.into_iter().zip(futures::future::join_all(handles).await) {
			match joined {
				Ok((time, Ok(checksum))) => report.synced.push(SyncedFile { id, time, checksum }),
				Ok((_, Err(e))) => {
					warn!("transfer of {} failed: {}", id, e);
					report.failed.push((id, e));
				}
				Err(e) => {
					error!("transfer task for {} failed: {}", id, e);
					report.failed.push((id, SyncError::Transfer { file: id.to_string(), message: e.to_string() }));
				}
			}
		}
		info!("batch {}: {} transferred, {} failed", batch.id, report.synced.len(), report.failed.len());
		report
	}
}

/// The file's endpoint, or its path relative to the drive root
pub fn endpoint_for(file: &File, root: &Path) -> String {
	if !file.endpoint.is_empty() {
		return file.endpoint.clone();
	}
	let rel = file.path.strip_prefix(root).unwrap_or(&file.path);
	rel.components()
		.filter_map(|c| match c {
			Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
			_ => None,
		})
		.collect::<Vec<_>>()
		.join("/")
}

async fn push_one(transfer: &dyn Transfer, file: &File, endpoint: &str) -> Result<String> {
	let method = if transfer.exists(endpoint).await? { Method::Put } else { Method::Post };
	let local = local_checksum(file).await?;
	transfer.upload(method, file, endpoint).await?;
	let remote = transfer.checksum(endpoint, file.algorithm).await?;
	verify(file, local, remote)
}

async fn pull_one(transfer: &dyn Transfer, file: &File, endpoint: &str) -> Result<String> {
	let remote = transfer.checksum(endpoint, file.algorithm).await?;
	transfer.download(&file.path, endpoint).await?;
	let local = local_checksum(file).await?;
	verify(file, remote, local)
}

async fn local_checksum(file: &File) -> Result<String> {
	let path = file.path.clone();
	let algorithm = file.algorithm;
	tokio::task::spawn_blocking(move || calculate_checksum(&path, algorithm))
		.await
		.map_err(|e| SyncError::Other { message: format!("checksum task failed: {}", e) })?
}

fn verify(file: &File, expected: String, actual: String) -> Result<String> {
	if expected != actual {
		return Err(SyncError::Integrity { file: file.name.clone(), expected, actual });
	}
	Ok(actual)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::TempDir;

	fn file_in(root: &Path, rel: &str, data: &[u8]) -> File {
		let path = root.join(rel);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).unwrap();
		}
		fs::write(&path, data).unwrap();
		File::discover(path, "o", ChecksumAlgorithm::default()).unwrap()
	}

	/// Stores uploads but corrupts what it reports back
	struct Lossy(LocalTransfer);

	#[async_trait]
	impl Transfer for Lossy {
		async fn upload(&self, method: Method, file: &File, endpoint: &str) -> Result<()> {
			self.0.upload(method, file, endpoint).await
		}
		async fn download(&self, dest: &Path, endpoint: &str) -> Result<()> {
			self.0.download(dest, endpoint).await
		}
		async fn exists(&self, endpoint: &str) -> Result<bool> {
			self.0.exists(endpoint).await
		}
		async fn checksum(&self, _endpoint: &str, _algorithm: ChecksumAlgorithm) -> Result<String> {
			Ok("bogus".to_string())
		}
	}

	/// Panics inside the spawned transfer task
	struct Crashing;

	#[async_trait]
	impl Transfer for Crashing {
		async fn upload(&self, _method: Method, _file: &File, _endpoint: &str) -> Result<()> {
			panic!("upload crashed")
		}
		async fn download(&self, _dest: &Path, _endpoint: &str) -> Result<()> {
			Ok(())
		}
		async fn exists(&self, _endpoint: &str) -> Result<bool> {
			Ok(false)
		}
		async fn checksum(&self, _endpoint: &str, _algorithm: ChecksumAlgorithm) -> Result<String> {
			Ok(String::new())
		}
	}

	#[test]
	fn test_pool_size() {
		let unmeasured = NetworkProfile::default();
		assert_eq!(unmeasured.pool_size(1000, 1, 4), 4);

		let p = NetworkProfile { up_rate: 4000.0, down_rate: 4000.0 };
		assert_eq!(p.budget(), 3000);
		assert_eq!(p.pool_size(1000, 1, 8), 3);
		assert_eq!(p.pool_size(1000, 1, 2), 2);
		assert_eq!(p.pool_size(1_000_000, 1, 8), 1);
		assert_eq!(p.pool_size(1000, 2, 8), 6);
	}

	#[test]
	fn test_endpoint_for() {
		let root = Path::new("/data/root");
		let mut f = File::new("b.txt", "o", "/data/root/a/b.txt");
		assert_eq!(endpoint_for(&f, root), "a/b.txt");
		f.endpoint = "https://host/v1/files/1".to_string();
		assert_eq!(endpoint_for(&f, root), "https://host/v1/files/1");
	}

	#[tokio::test]
	async fn test_local_transfer_methods() {
		let src = TempDir::new().unwrap();
		let dst = TempDir::new().unwrap();
		let t = LocalTransfer::new(dst.path());
		let f = file_in(src.path(), "x.txt", b"one");

		t.upload(Method::Post, &f, "d/x.txt").await.unwrap();
		assert_eq!(fs::read(dst.path().join("d/x.txt")).unwrap(), b"one");
		assert!(t.upload(Method::Post, &f, "d/x.txt").await.is_err());

		fs::write(&f.path, b"two").unwrap();
		t.upload(Method::Put, &f, "d/x.txt").await.unwrap();
		assert_eq!(fs::read(dst.path().join("d/x.txt")).unwrap(), b"two");

		let back = src.path().join("back.txt");
		t.download(&back, "d/x.txt").await.unwrap();
		assert_eq!(fs::read(back).unwrap(), b"two");

		assert!(t.exists("../escape").await.is_err());
		assert!(!t.exists("missing").await.unwrap());
	}

	#[tokio::test]
	async fn test_push_batch() {
		let src = TempDir::new().unwrap();
		let dst = TempDir::new().unwrap();
		let mut batch = Batch::new(1000);
		batch.add_files(vec![
			file_in(src.path(), "a.txt", b"alpha"),
			file_in(src.path(), "sub/b.txt", b"bravo"),
			file_in(src.path(), "sub/deeper/c.txt", b"charlie"),
		]);

		let d = Dispatcher::new(Arc::new(LocalTransfer::new(dst.path())), src.path(), 2);
		let report = d.push_batch(&batch).await;
		assert_eq!(report.synced.len(), 3);
		assert!(report.failed.is_empty());
		assert_eq!(fs::read(dst.path().join("sub/deeper/c.txt")).unwrap(), b"charlie");

		// second push replaces in place
		let again = d.push_batch(&batch).await;
		assert_eq!(again.synced.len(), 3);
	}

	#[tokio::test]
	async fn test_integrity_failure() {
		let src = TempDir::new().unwrap();
		let dst = TempDir::new().unwrap();
		let mut batch = Batch::new(1000);
		batch.add_files(vec![file_in(src.path(), "a.txt", b"alpha")]);

		let d = Dispatcher::new(Arc::new(Lossy(LocalTransfer::new(dst.path()))), src.path(), 1);
		let report = d.push_batch(&batch).await;
		assert!(report.synced.is_empty());
		assert!(matches!(report.failed[0].1, SyncError::Integrity { .. }));
	}

	#[tokio::test]
	async fn test_crashed_task_counts_as_failed() {
		let src = TempDir::new().unwrap();
		let mut batch = Batch::new(1000);
		let f = file_in(src.path(), "a.txt", b"alpha");
		let id = f.id;
		batch.add_files(vec![f]);

		let d = Dispatcher::new(Arc::new(Crashing), src.path(), 1);
		let report = d.push_batch(&batch).await;
		assert!(report.synced.is_empty());
		assert_eq!(report.failed.len(), 1);
		assert_eq!(report.failed[0].0, id);
		assert!(matches!(report.failed[0].1, SyncError::Transfer { .. }));
	}

	#[tokio::test]
	async fn test_pull_batch() {
		let local = TempDir::new().unwrap();
		let remote = TempDir::new().unwrap();
		let f = file_in(local.path(), "a.txt", b"old");
		fs::write(remote.path().join("a.txt"), b"newer content").unwrap();

		let mut batch = Batch::new(1000);
		batch.add_files(vec![f]);
		let d = Dispatcher::new(Arc::new(LocalTransfer::new(remote.path())), local.path(), 1);
		let report = d.pull_batch(&batch).await;
		assert_eq!(report.synced.len(), 1);
		assert_eq!(fs::read(local.path().join("a.txt")).unwrap(), b"newer content");
	}
}

// vim: ts=4
