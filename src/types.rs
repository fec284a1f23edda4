//! Shared identifier and enum types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! id_type {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(Uuid);

		impl $name {
			/// Generate a fresh random identifier
			pub fn new() -> Self {
				$name(Uuid::new_v4())
			}

			pub fn as_uuid(&self) -> &Uuid {
				&self.0
			}
		}

		impl Default for $name {
			fn default() -> Self {
				Self::new()
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($name), self.0)
			}
		}

		impl FromStr for $name {
			type Err = uuid::Error;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Ok($name(Uuid::parse_str(s)?))
			}
		}
	};
}

id_type!(
	/// Stable identifier of a tracked file
	FileId
);
id_type!(
	/// Stable identifier of a directory node
	DirId
);
id_type!(
	/// Identifier of a drive
	DriveId
);
id_type!(
	/// Identifier of a transfer batch
	BatchId
);

/// Checksum algorithm used for file integrity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumAlgorithm {
	#[default]
	Blake3,
	Sha256,
}

impl fmt::Display for ChecksumAlgorithm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
			ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
		}
	}
}

/// HTTP-style method handed to the transfer collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
	/// First upload of a file the remote has never seen
	Post,
	/// Replacement of an existing remote copy
	Put,
}


// vim: ts=4
