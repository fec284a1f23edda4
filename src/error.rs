//! Error types for sfsync operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, SyncError>;

/// Kind of tree item an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
	File,
	Directory,
	Drive,
	Batch,
}

impl fmt::Display for ItemKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ItemKind::File => write!(f, "file"),
			ItemKind::Directory => write!(f, "directory"),
			ItemKind::Drive => write!(f, "drive"),
			ItemKind::Batch => write!(f, "batch"),
		}
	}
}

/// Main error type for sync operations
#[derive(Debug)]
pub enum SyncError {
	/// ID absent from the tree, index or store
	NotFound { kind: ItemKind, id: String },

	/// Resource is locked
	Protected { kind: ItemKind, id: String },

	/// Item with this ID is already present
	Duplicate { kind: ItemKind, id: String },

	/// A single file is larger than the batch ceiling
	CapacityExceeded { size: u64, capacity: u64 },

	/// Adding the item would push the drive over its total size
	DriveFull { needed: u64, available: u64 },

	/// Password did not match the resource key
	WrongPassword,

	/// Stat, read or write failure
	Io { path: PathBuf, source: io::Error },

	/// Checksum mismatch after a transfer
	Integrity { file: String, expected: String, actual: String },

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Transfer collaborator failure
	Transfer { file: String, message: String },

	/// Persistence collaborator error (nested)
	Store(StoreError),

	/// Snapshot error (nested)
	State(StateError),

	/// Generic error message
	Other { message: String },
}

impl SyncError {
	/// Wrap an I/O error together with the path it happened on
	pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
		SyncError::Io { path: path.into(), source }
	}

	pub fn not_found(kind: ItemKind, id: impl fmt::Display) -> Self {
		SyncError::NotFound { kind, id: id.to_string() }
	}

	pub fn protected(kind: ItemKind, id: impl fmt::Display) -> Self {
		SyncError::Protected { kind, id: id.to_string() }
	}

	pub fn duplicate(kind: ItemKind, id: impl fmt::Display) -> Self {
		SyncError::Duplicate { kind, id: id.to_string() }
	}

	/// True for errors a walk skips over instead of surfacing
	pub fn is_skippable(&self) -> bool {
		matches!(self, SyncError::NotFound { .. } | SyncError::Io { .. })
	}
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
			SyncError::Protected { kind, id } => write!(f, "{} {} is protected", kind, id),
			SyncError::Duplicate { kind, id } => write!(f, "{} {} already present", kind, id),
			SyncError::CapacityExceeded { size, capacity } => {
				write!(f, "File size {} exceeds batch capacity {}", size, capacity)
			}
			SyncError::DriveFull { needed, available } => {
				write!(f, "Drive full: {} bytes needed, {} available", needed, available)
			}
			SyncError::WrongPassword => write!(f, "Wrong password"),
			SyncError::Io { path, source } => {
				write!(f, "I/O error on {}: {}", path.display(), source)
			}
			SyncError::Integrity { file, expected, actual } => {
				write!(f, "Checksum mismatch for {}: expected {}, got {}", file, expected, actual)
			}
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::Transfer { file, message } => {
				write!(f, "Transfer of {} failed: {}", file, message)
			}
			SyncError::Store(e) => write!(f, "Store error: {}", e),
			SyncError::State(e) => write!(f, "State error: {}", e),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Io { source, .. } => Some(source),
			SyncError::Store(e) => Some(e),
			SyncError::State(e) => Some(e),
			_ => None,
		}
	}
}

impl From<String> for SyncError {
	fn from(e: String) -> Self {
		SyncError::Other { message: e }
	}
}

impl From<StoreError> for SyncError {
	fn from(e: StoreError) -> Self {
		SyncError::Store(e)
	}
}

impl From<StateError> for SyncError {
	fn from(e: StateError) -> Self {
		SyncError::State(e)
	}
}

impl From<serde_json::Error> for SyncError {
	fn from(e: serde_json::Error) -> Self {
		SyncError::Other { message: format!("JSON error: {}", e) }
	}
}

/// Persistence collaborator errors
#[derive(Debug)]
pub enum StoreError {
	/// Failed to open the backing database
	OpenFailed { source: Box<dyn Error + Send + Sync> },

	/// Read or write transaction failed
	TransactionFailed { source: Box<dyn Error + Send + Sync> },

	/// Stored record could not be decoded
	Corrupted { message: String },
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::OpenFailed { source } => write!(f, "Failed to open store: {}", source),
			StoreError::TransactionFailed { source } => {
				write!(f, "Store transaction failed: {}", source)
			}
			StoreError::Corrupted { message } => write!(f, "Store record corrupted: {}", message),
		}
	}
}

impl Error for StoreError {}

/// Snapshot errors
#[derive(Debug)]
pub enum StateError {
	/// Failed to load state
	LoadFailed { source: Box<dyn Error + Send + Sync> },

	/// Failed to save state
	SaveFailed { source: Box<dyn Error + Send + Sync> },

	/// State file is corrupted
	Corrupted { message: String },

	/// Another sync holds the state directory
	LockFailed { message: String },
}

impl fmt::Display for StateError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StateError::LoadFailed { source } => write!(f, "Failed to load state: {}", source),
			StateError::SaveFailed { source } => write!(f, "Failed to save state: {}", source),
			StateError::Corrupted { message } => write!(f, "State corrupted: {}", message),
			StateError::LockFailed { message } => write!(f, "Failed to acquire lock: {}", message),
		}
	}
}

impl Error for StateError {}


// vim: ts=4
