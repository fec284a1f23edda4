//! The sync cycle: refresh the index, pack the working set into batches,
//! dispatch them and record what made it across

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::drive::SharedDrive;
use crate::error::{Result, SyncError};
use crate::file::File;
use crate::index::{compare, SyncIndex};
use crate::logging::*;
use crate::monitor::SyncRequest;
use crate::queue::{build_queue, TransferPlan};
use crate::state::StateManager;
use crate::transfer::{endpoint_for, DispatchReport, Dispatcher, LocalTransfer, NetworkProfile, Transfer};
use crate::types::FileId;

/// Outcome of one sync cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
	pub queued: usize,
	pub batches: usize,
	pub large_batches: usize,
	pub synced: usize,
	pub failed: usize,
}

pub struct Engine {
	config: Config,
	drive: SharedDrive,
	transfer: Arc<dyn Transfer>,
	network: NetworkProfile,
	state: Option<StateManager>,
}

impl Engine {
	pub fn new(config: Config, drive: SharedDrive, transfer: Arc<dyn Transfer>) -> Self {
		Engine { config, drive, transfer, network: NetworkProfile::default(), state: None }
	}

	/// Size the worker pool from a measured link
	pub fn with_network(mut self, network: NetworkProfile) -> Self {
		self.network = network;
		self
	}

	/// Save a drive snapshot after every cycle
	pub fn with_state(mut self, state: StateManager) -> Self {
		self.state = Some(state);
		self
	}

	pub fn drive(&self) -> &SharedDrive {
		&self.drive
	}

	/// Pack the files whose timestamps moved past the index
	pub async fn plan_cycle(&self) -> TransferPlan {
		let mut drive = self.drive.write().await;
		let queued = drive.refresh();
		debug!("{} files queued for transfer", queued);
		build_queue(drive.index(), self.config.batch.capacity)
	}

	/// Run one full cycle. Failed files stay in the working set and are
	/// dispatched again by the next cycle.
	pub async fn run_cycle(&self) -> Result<CycleReport> {
		let plan = self.plan_cycle().await;
		let mut report = CycleReport {
			queued: plan.file_count(),
			batches: plan.queue.len(),
			large_batches: plan.large.len(),
			..Default::default()
		};

		let root = {
			let drive = self.drive.read().await;
			drive.root_path().to_path_buf()
		};

		let dispatched = if plan.is_empty() {
			DispatchReport::default()
		} else {
			let avg = plan.queue.total_bytes().saturating_add(plan.large.total_bytes()) / plan.file_count().max(1) as u64;
			let workers =
				self.network.pool_size(avg, self.config.transfer.window_secs, self.config.transfer.max_workers);
			let dispatcher = Dispatcher::new(Arc::clone(&self.transfer), root, workers);
			dispatcher.push_plan(plan).await
		};
		report.failed = dispatched.failed.len();

		{
			let mut drive = self.drive.write().await;
			for synced in &dispatched.synced {
				if let Err(e) = drive.index_mut().mark_synced(&synced.id, synced.time) {
					// removed while the transfer was running
					debug!("not marking {}: {}", synced.id, e);
					continue;
				}
				if let Ok(file) = drive.get_file(&synced.id) {
					let mut file = file.clone();
					file.checksum = synced.checksum.clone();
					if let Some(dir_id) = file.dir_id {
						if let Err(e) = drive.update_file(&dir_id, file) {
							warn!("could not record checksum for {}: {}", synced.id, e);
						}
					}
				}
				report.synced += 1;
			}
			// marking drops synced files from the working set; whatever is
			// left failed and goes out again next cycle
			let kept = drive.index().to_update.len();
			if kept > 0 {
				debug!("{} files stay queued for the next cycle", kept);
			}

			if let Some(state) = &self.state {
				if let Err(e) = state.save(&drive).await {
					error!("failed to save drive snapshot: {}", e);
				}
			}
		}

		info!(
			"sync cycle done: {} queued, {} synced, {} failed ({} batches, {} large)",
			report.queued, report.synced, report.failed, report.batches, report.large_batches
		);
		Ok(report)
	}

	async fn cycle_logged(&self) -> bool {
		match self.run_cycle().await {
			Ok(_) => true,
			Err(e) => {
				error!("sync cycle failed: {}", e);
				false
			}
		}
	}

	/// Run cycles when the listener asks for one and, if an interval is
	/// configured, on a timer. Returns the number of cycles run.
	pub async fn run(&self, mut signals: mpsc::Receiver<SyncRequest>, mut stop: watch::Receiver<bool>) -> usize {
		let period = self.config.sync_interval_secs;
		let mut ticker = tokio::time::interval(Duration::from_secs(period.max(1)));
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		ticker.tick().await;

		let mut cycles = 0;
		let mut signals_open = true;
		loop {
			tokio::select! {
				changed = stop.changed() => {
					if changed.is_err() || *stop.borrow() {
						break;
					}
				}
				request = signals.recv(), if signals_open => match request {
					Some(request) => {
						debug!("sync requested by {} events", request.events.len());
						if self.cycle_logged().await {
							cycles += 1;
						}
					}
					None => signals_open = false,
				},
				_ = ticker.tick(), if period > 0 => {
					if self.cycle_logged().await {
						cycles += 1;
					}
				}
			}
		}
		info!("sync loop stopped after {} cycles", cycles);
		cycles
	}
}

/// Mirror a drive into `dest`. Files never synced before are indexed first,
/// and indexed files with no copy at the destination are queued as well.
pub async fn sync_disks(config: &Config, drive: &SharedDrive, dest: &Path) -> Result<CycleReport> {
	tokio::fs::create_dir_all(dest).await.map_err(|e| SyncError::io(dest, e))?;
	{
		let mut d = drive.write().await;
		let fresh = d.index_new_files();
		debug!("{} files indexed for their first sync", fresh);

		let root = d.root_path().to_path_buf();
		let missing: Vec<File> = d
			.files()
			.into_values()
			.filter(|f| !d.index().to_update.contains_key(&f.id))
			.filter(|f| !dest.join(endpoint_for(f, &root)).exists())
			.cloned()
			.collect();
		if !missing.is_empty() {
			debug!("{} indexed files missing from {}", missing.len(), dest.display());
		}
		for file in missing {
			if d.index().has_file(&file.id) {
				d.index_mut().to_update.insert(file.id, file);
			}
		}
	}
	let engine = Engine::new(config.clone(), Arc::clone(drive), Arc::new(LocalTransfer::new(dest)));
	engine.run_cycle().await
}

/// Which side of a two-replica pair is newer for each file
#[derive(Debug, Default)]
pub struct SyncPlan {
	/// Local copy is newer
	pub push: Vec<FileId>,
	/// Remote copy is newer
	pub pull: Vec<FileId>,
	pub local_only: Vec<FileId>,
	pub remote_only: Vec<FileId>,
	/// Most recent timestamp per common file
	pub merged: SyncIndex,
}

/// Most recent timestamp wins
pub fn plan(local: &SyncIndex, remote: &SyncIndex) -> SyncPlan {
	let mut out = SyncPlan { merged: compare(remote, local), ..Default::default() };
	for (id, local_time) in &local.last_sync {
		match remote.last_sync.get(id) {
			Some(remote_time) if local_time > remote_time => out.push.push(*id),
			Some(remote_time) if remote_time > local_time => out.pull.push(*id),
			Some(_) => {}
			None => out.local_only.push(*id),
		}
	}
	out.remote_only = remote.last_sync.keys().filter(|id| !local.has_file(id)).copied().collect();
	out
}


// vim: ts=4
