//! Glob-based exclusion of discovery entries

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

use crate::error::{Result, SyncError};

/// Pattern matcher using globset for efficient matching
///
/// Paths are matched relative to the drive root.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
	/// Compiled user patterns
	exclude_set: GlobSet,

	/// Always-excluded patterns (built-in)
	always_exclude: GlobSet,

	patterns: Vec<String>,
}

impl PatternMatcher {
	pub fn new(exclude_patterns: &[String]) -> Result<Self> {
		let always_exclude = Self::build_always_excluded()?;
		let exclude_set = Self::build_glob_set(exclude_patterns)?;
		Ok(Self { exclude_set, always_exclude, patterns: exclude_patterns.to_vec() })
	}

	fn build_always_excluded() -> Result<GlobSet> {
		let patterns = [
			".sfsync/**",      // engine state directory
			"**/*.sfsync-tmp", // in-flight transfer copies
			".Trash-*/**",     // Linux trash
			"lost+found/**",   // Linux filesystem recovery
			"**/.DS_Store",    // macOS cruft
			"**/Thumbs.db",    // Windows cruft
			"**/desktop.ini",  // Windows cruft
			"**/*.swp",        // Vim swap files
			"**/*~",           // Editor backups
		];

		Self::build_glob_set(&patterns.map(String::from))
	}

	fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
		let mut builder = GlobSetBuilder::new();

		for pattern in patterns {
			let glob = Glob::new(pattern).map_err(|e| SyncError::InvalidConfig {
				message: format!("exclude pattern {}: {}", pattern, e),
			})?;
			builder.add(glob);
		}

		builder.build().map_err(|e| SyncError::InvalidConfig {
			message: format!("failed to build pattern set: {}", e),
		})
	}

	/// Check if a root-relative path is excluded
	pub fn is_excluded(&self, path: &Path) -> bool {
		self.always_exclude.is_match(path) || self.exclude_set.is_match(path)
	}

	/// User patterns this matcher was built from
	pub fn patterns(&self) -> &[String] {
		&self.patterns
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_basic_exclusion() {
		let patterns = vec!["*.log".to_string(), "*.tmp".to_string()];
		let matcher = PatternMatcher::new(&patterns).unwrap();

		assert!(matcher.is_excluded(Path::new("test.log")));
		assert!(matcher.is_excluded(Path::new("foo/bar.tmp")));
		assert!(!matcher.is_excluded(Path::new("test.txt")));
	}

	#[test]
	fn test_directory_patterns() {
		let patterns = vec!["node_modules".to_string(), "node_modules/**".to_string()];
		let matcher = PatternMatcher::new(&patterns).unwrap();

		assert!(matcher.is_excluded(Path::new("node_modules")));
		assert!(matcher.is_excluded(Path::new("node_modules/package/file.js")));
		assert!(!matcher.is_excluded(Path::new("src/main.rs")));
	}

	#[test]
	fn test_always_excluded() {
		let matcher = PatternMatcher::new(&[]).unwrap();

		assert!(matcher.is_excluded(Path::new(".sfsync/state.json")));
		assert!(matcher.is_excluded(Path::new("photos/a.jpg.sfsync-tmp")));
		assert!(matcher.is_excluded(Path::new("docs/.DS_Store")));
		assert!(matcher.is_excluded(Path::new("notes.txt~")));
		assert!(!matcher.is_excluded(Path::new("notes.txt")));
	}

	#[test]
	fn test_invalid_pattern() {
		let result = PatternMatcher::new(&["a[".to_string()]);
		assert!(matches!(result, Err(SyncError::InvalidConfig { .. })));
	}
}

// vim: ts=4
