//! Exclusion of filesystem entries during discovery

mod patterns;

pub use patterns::PatternMatcher;

use crate::config::Config;
use crate::error::Result;

/// Build the matcher for a configuration's exclude patterns
pub fn from_config(config: &Config) -> Result<PatternMatcher> {
	PatternMatcher::new(&config.exclude_patterns)
}

// vim: ts=4
