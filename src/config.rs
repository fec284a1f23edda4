//! Configuration for the sync engine
//!
//! A single `Config` value is built once and passed explicitly into the
//! constructors that need it. Nothing in the crate reads global state.
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (`.toml`, `.json` or `.json5`)
//! 3. Environment variables (SFSYNC_* prefix)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::types::ChecksumAlgorithm;

/// Default batch ceiling and drive size (1 GB)
pub const DEFAULT_CAPACITY: u64 = 1_000_000_000;

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

/// Unified configuration for sfsync
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// Directory holding drive snapshots and sync-index payloads
	pub state_dir: PathBuf,

	/// Profile name for state isolation
	pub profile: String,

	/// Checksum algorithm for newly discovered files
	pub checksum: ChecksumAlgorithm,

	/// Glob patterns to skip during discovery (e.g., "*.tmp", "node_modules/**")
	pub exclude_patterns: Vec<String>,

	/// Seconds between timer-driven sync cycles (0 = on demand only)
	pub sync_interval_secs: u64,

	pub batch: BatchConfig,

	pub monitor: MonitorConfig,

	pub drive: DriveConfig,

	pub transfer: TransferConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			state_dir: std::env::var("HOME")
				.ok()
				.map(|h| PathBuf::from(h).join(".sfsync"))
				.unwrap_or_else(|| PathBuf::from(".sfsync")),
			profile: "default".to_string(),
			checksum: ChecksumAlgorithm::default(),
			exclude_patterns: vec![],
			sync_interval_secs: 0,
			batch: BatchConfig::default(),
			monitor: MonitorConfig::default(),
			drive: DriveConfig::default(),
			transfer: TransferConfig::default(),
		}
	}
}

// ============================================================================
// NESTED CONFIGURATION STRUCTS
// ============================================================================

/// Transfer batch packing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
	/// Byte ceiling of a single batch
	pub capacity: u64,
}

impl Default for BatchConfig {
	fn default() -> Self {
		BatchConfig { capacity: DEFAULT_CAPACITY }
	}
}

/// File monitor behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
	/// Accumulate events before signalling a sync cycle
	pub buffered: bool,

	/// Number of events that trigger a cycle in buffered mode
	pub buffer_size: usize,

	/// Poll interval right after activity (milliseconds)
	pub poll_active_ms: u64,

	/// Poll interval once the path has been quiet (milliseconds)
	pub poll_idle_ms: u64,

	/// Number of unchanged polls before relaxing to the idle interval
	pub idle_after: u32,

	/// Consecutive stat failures before a path is considered deleted
	pub max_retries: u32,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		MonitorConfig {
			buffered: false,
			buffer_size: 10,
			poll_active_ms: 250,
			poll_idle_ms: 2000,
			idle_after: 10,
			max_retries: 3,
		}
	}
}

/// Drive accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriveConfig {
	/// Total drive capacity in bytes
	pub total_size: u64,
}

impl Default for DriveConfig {
	fn default() -> Self {
		DriveConfig { total_size: DEFAULT_CAPACITY }
	}
}

/// Transfer dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferConfig {
	/// Upper bound on concurrent transfers
	pub max_workers: usize,

	/// Seconds of measured bandwidth one round of transfers may occupy
	pub window_secs: u64,
}

impl Default for TransferConfig {
	fn default() -> Self {
		TransferConfig { max_workers: 4, window_secs: 1 }
	}
}

// ============================================================================
// LOADING
// ============================================================================

impl Config {
	/// Load configuration from a file, then apply environment overrides
	pub fn load(path: &Path) -> Result<Self> {
		let contents =
			std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;

		let mut config: Config = match path.extension().and_then(|e| e.to_str()) {
			Some("toml") => toml::from_str(&contents).map_err(|e| SyncError::InvalidConfig {
				message: format!("{}: {}", path.display(), e),
			})?,
			Some("json") | Some("json5") => {
				json5::from_str(&contents).map_err(|e| SyncError::InvalidConfig {
					message: format!("{}: {}", path.display(), e),
				})?
			}
			other => {
				return Err(SyncError::InvalidConfig {
					message: format!("Unsupported config format: {:?}", other),
				})
			}
		};

		config.apply_env()?;
		config.validate()?;
		Ok(config)
	}

	/// Build the default configuration with environment overrides applied
	pub fn from_env() -> Result<Self> {
		let mut config = Config::default();
		config.apply_env()?;
		config.validate()?;
		Ok(config)
	}

	/// Apply SFSYNC_* environment variables on top of the current values
	pub fn apply_env(&mut self) -> Result<()> {
		self.apply_vars(|key| std::env::var(key).ok())
	}

	fn apply_vars<F>(&mut self, get: F) -> Result<()>
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(v) = get("SFSYNC_STATE_DIR") {
			self.state_dir = PathBuf::from(v);
		}
		if let Some(v) = get("SFSYNC_PROFILE") {
			self.profile = v;
		}
		if let Some(v) = get("SFSYNC_BUFFERED_EVENTS") {
			self.monitor.buffered = parse_var("SFSYNC_BUFFERED_EVENTS", &v)?;
		}
		if let Some(v) = get("SFSYNC_EVENT_BUFFER_SIZE") {
			self.monitor.buffer_size = parse_var("SFSYNC_EVENT_BUFFER_SIZE", &v)?;
		}
		if let Some(v) = get("SFSYNC_BATCH_CAPACITY") {
			self.batch.capacity = parse_var("SFSYNC_BATCH_CAPACITY", &v)?;
		}
		Ok(())
	}

	/// Reject values the engine cannot run with
	pub fn validate(&self) -> Result<()> {
		if self.batch.capacity == 0 {
			return Err(invalid("batch capacity must be greater than 0"));
		}
		if self.drive.total_size == 0 {
			return Err(invalid("drive total size must be greater than 0"));
		}
		if self.monitor.buffered && self.monitor.buffer_size == 0 {
			return Err(invalid("event buffer size must be greater than 0 in buffered mode"));
		}
		if self.monitor.poll_active_ms == 0 {
			return Err(invalid("poll interval must be greater than 0"));
		}
		if self.monitor.poll_active_ms > self.monitor.poll_idle_ms {
			return Err(invalid("active poll interval must not exceed the idle interval"));
		}
		if self.transfer.max_workers == 0 {
			return Err(invalid("transfer workers must be greater than 0"));
		}
		Ok(())
	}
}

fn invalid(message: &str) -> SyncError {
	SyncError::InvalidConfig { message: message.to_string() }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
	value.trim().parse().map_err(|_| SyncError::InvalidConfig {
		message: format!("{}: cannot parse {:?}", key, value),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use tempfile::TempDir;

	#[test]
	fn test_config_default() {
		let config = Config::default();
		assert_eq!(config.profile, "default");
		assert_eq!(config.batch.capacity, DEFAULT_CAPACITY);
		assert!(!config.monitor.buffered);
		assert_eq!(config.monitor.max_retries, 3);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_load_toml() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("sfsync.toml");
		std::fs::write(
			&path,
			"profile = \"laptop\"\n[batch]\ncapacity = 25000\n[monitor]\nbuffered = true\nbufferSize = 5\n",
		)
		.unwrap();

		let config = Config::load(&path).unwrap();
		assert_eq!(config.profile, "laptop");
		assert_eq!(config.batch.capacity, 25000);
		assert!(config.monitor.buffered);
		assert_eq!(config.monitor.buffer_size, 5);
		// untouched sections keep their defaults
		assert_eq!(config.transfer.max_workers, 4);
	}

	#[test]
	fn test_load_json5() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("sfsync.json5");
		std::fs::write(&path, "{ excludePatterns: ['*.tmp'], drive: { totalSize: 4096 } }").unwrap();

		let config = Config::load(&path).unwrap();
		assert_eq!(config.exclude_patterns, vec!["*.tmp".to_string()]);
		assert_eq!(config.drive.total_size, 4096);
	}

	#[test]
	fn test_env_overrides() {
		let vars: HashMap<&str, &str> = [
			("SFSYNC_BUFFERED_EVENTS", "true"),
			("SFSYNC_EVENT_BUFFER_SIZE", "7"),
			("SFSYNC_BATCH_CAPACITY", "1024"),
		]
		.into_iter()
		.collect();

		let mut config = Config::default();
		config.apply_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
		assert!(config.monitor.buffered);
		assert_eq!(config.monitor.buffer_size, 7);
		assert_eq!(config.batch.capacity, 1024);
	}

	#[test]
	fn test_bad_env_value() {
		let mut config = Config::default();
		let result = config.apply_vars(|k| {
			if k == "SFSYNC_EVENT_BUFFER_SIZE" {
				Some("lots".to_string())
			} else {
				None
			}
		});
		assert!(matches!(result, Err(SyncError::InvalidConfig { .. })));
	}

	#[test]
	fn test_validate_rejects() {
		let mut config = Config::default();
		config.batch.capacity = 0;
		assert!(config.validate().is_err());

		let mut config = Config::default();
		config.monitor.buffered = true;
		config.monitor.buffer_size = 0;
		assert!(config.validate().is_err());

		let mut config = Config::default();
		config.monitor.poll_active_ms = 5000;
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_config_serialization() {
		let config = Config::default();
		let json = serde_json::to_string(&config).expect("Failed to serialize");
		let deserialized: Config = serde_json::from_str(&json).expect("Failed to deserialize");
		assert_eq!(config.profile, deserialized.profile);
		assert_eq!(config.batch.capacity, deserialized.batch.capacity);
	}
}

// vim: ts=4
