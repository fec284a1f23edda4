use clap::{Arg, ArgMatches, Command};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use sfsync::config::Config;
use sfsync::drive::Drive;
use sfsync::engine::{self, Engine};
use sfsync::exclusion;
use sfsync::fs::LocalFs;
use sfsync::logging::*;
use sfsync::monitor::Session;
use sfsync::queue::build_queue;
use sfsync::state::StateManager;
use sfsync::store::RedbStore;
use sfsync::transfer::LocalTransfer;

///////////////////////
// Utility functions //
///////////////////////

fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let mut config = match matches.get_one::<String>("config") {
		Some(path) => Config::load(Path::new(path))?,
		None => Config::from_env()?,
	};
	if let Some(profile) = matches.get_one::<String>("profile") {
		config.profile = profile.clone();
	}
	Ok(config)
}

fn owner_name() -> String {
	std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}

/// Restore the profile's drive if it covers `dir`, otherwise start a new
/// one. Either way the tree is brought up to date with the disk.
async fn open_drive(config: &Config, dir: &str) -> Result<Drive, Box<dyn Error>> {
	let root = std::fs::canonicalize(dir).map_err(|e| format!("{}: {}", dir, e))?;
	let state = StateManager::from_config(config);
	let owner = owner_name();

	let mut drive = match state.load().await? {
		Some(drive) if drive.root_path() == root => drive,
		Some(_) => {
			warn!("snapshot for profile {} covers another directory, starting over", config.profile);
			Drive::new(&owner, &owner, &root, &config.drive)
		}
		None => Drive::new(&owner, &owner, &root, &config.drive),
	};

	std::fs::create_dir_all(&config.state_dir)?;
	let store = RedbStore::open(&config.state_dir.join(format!("{}.redb", config.profile)))?;
	drive.set_store(Arc::new(store));

	let matcher = exclusion::from_config(config)?;
	let report = drive.discover(config.checksum, Some(&matcher))?;
	info!(
		"discovered {} new files and {} directories under {}",
		report.files_added,
		report.dirs_added,
		root.display()
	);
	Ok(drive)
}

fn dir_arg(name: &'static str) -> Arg {
	Arg::new(name).required(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	init_tracing();

	let matches = Command::new("sfsync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Drive mirroring and sync engine")
		.subcommand_required(true)
		.arg(Arg::new("profile").short('p').long("profile").value_name("PROFILE").help("Profile"))
		.arg(Arg::new("config").short('c').long("config").value_name("FILE").help("Config file"))
		.subcommand(Command::new("index").about("Index a directory and save a snapshot").arg(dir_arg("dir")))
		.subcommand(Command::new("diff").about("List files changed since the last sync").arg(dir_arg("dir")))
		.subcommand(Command::new("queue").about("Show transfer batches for pending changes").arg(dir_arg("dir")))
		.subcommand(
			Command::new("sync")
				.about("Mirror a directory into another")
				.arg(dir_arg("dir"))
				.arg(dir_arg("dest")),
		)
		.subcommand(
			Command::new("watch")
				.about("Mirror continuously, syncing on changes")
				.arg(dir_arg("dir"))
				.arg(dir_arg("dest")),
		)
		.get_matches();

	let config = load_config(&matches)?;
	let state = StateManager::from_config(&config);
	let (name, sub) = matches.subcommand().ok_or("subcommand required")?;
	let dir = sub.get_one::<String>("dir").ok_or("directory argument required")?;

	let _lock = state.lock().await?;
	let mut drive = open_drive(&config, dir).await?;

	match name {
		"index" => {
			if !drive.is_indexed() {
				drive.build_index();
			}
			let fresh = drive.index_new_files();
			drive.index_mut().reset();
			state.save(&drive).await?;
			println!("{} files indexed ({} new)", drive.index().last_sync.len(), fresh);
		}
		"diff" => {
			drive.refresh();
			for path in drive.index().file_paths() {
				println!("{}", path.display());
			}
		}
		"queue" => {
			drive.refresh();
			let plan = build_queue(drive.index(), config.batch.capacity);
			for (i, batch) in plan.queue.iter().chain(plan.large.iter()).enumerate() {
				let kind = if batch.large { " (large)" } else { "" };
				println!("batch {}{}: {} files, {} bytes", i + 1, kind, batch.len(), batch.used());
				for file in batch.files() {
					println!("  {}", file.path.display());
				}
			}
		}
		"sync" => {
			let dest = PathBuf::from(sub.get_one::<String>("dest").ok_or("destination argument required")?);
			let drive = drive.shared();
			let report = engine::sync_disks(&config, &drive, &dest).await?;
			state.save(&*drive.read().await).await?;
			println!("{} synced, {} failed", report.synced, report.failed);
		}
		"watch" => {
			let dest = PathBuf::from(sub.get_one::<String>("dest").ok_or("destination argument required")?);
			let drive = drive.shared();
			engine::sync_disks(&config, &drive, &dest).await?;

			let matcher = exclusion::from_config(&config)?;
			let (session, signals) = Session::start(
				Arc::clone(&drive),
				config.monitor.clone(),
				Arc::new(LocalFs),
				config.checksum,
				Some(matcher),
			)
			.await;
			let engine = Engine::new(config.clone(), Arc::clone(&drive), Arc::new(LocalTransfer::new(&dest)))
				.with_state(StateManager::from_config(&config));

			let (stop_tx, stop_rx) = watch::channel(false);
			let runner = tokio::spawn(async move { engine.run(signals, stop_rx).await });

			tokio::signal::ctrl_c().await?;
			info!("interrupted, shutting down");
			let stats = session.stop().await;
			let _ = stop_tx.send(true);
			let cycles = runner.await?;
			println!("{} events applied, {} sync cycles", stats.applied, cycles);
		}
		other => return Err(format!("unknown command: {}", other).into()),
	}

	Ok(())
}

// vim: ts=4
