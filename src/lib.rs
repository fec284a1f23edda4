//! # sfsync - drive mirroring and sync engine
//!
//! sfsync keeps a user's directory tree consistent between two replicas.
//! Files are tracked by ID in an in-memory tree, a per-drive sync index
//! records when each file was last synced, and files whose timestamps moved
//! past the index are packed into capacity-bounded batches for transfer.
//! A polling monitor feeds file changes into the index as they happen.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sfsync::{config::Config, drive::Drive, engine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let mut drive = Drive::new("alice", "alice", "./photos", &config.drive);
//!     drive.discover(config.checksum, None)?;
//!     let drive = drive.shared();
//!
//!     let report = engine::sync_disks(&config, &drive, "./backup".as_ref()).await?;
//!     println!("Synced {} files", report.synced);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod drive;
pub mod engine;
pub mod error;
pub mod exclusion;
pub mod file;
pub mod fs;
pub mod index;
pub mod logging;
pub mod monitor;
pub mod queue;
pub mod state;
pub mod store;
pub mod transfer;
pub mod tree;
pub mod types;

// Re-export commonly used types and functions
pub use config::Config;
pub use drive::{Drive, SharedDrive};
pub use error::{ItemKind, StateError, StoreError, SyncError};
pub use file::File;
pub use index::{build_sync_index, build_to_update, compare, SyncIndex};
pub use queue::{build_queue, Queue, TransferPlan};
pub use tree::{Directory, Tree};
pub use types::{BatchId, ChecksumAlgorithm, DirId, DriveId, FileId, Method};

// vim: ts=4
