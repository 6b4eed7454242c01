//! Profile upload compression scheme.
//!
//! The transport collaborator compresses each profile before uploading it. This crate
//! only resolves which scheme was requested; the encoding itself lives in the sampler.
//!
//! # Accepted values
//!
//! - `gzip` (aliases `gz`, empty string): gzip-compressed upload (**default**)
//! - `none` (aliases `off`, `identity`): uncompressed upload
//!
//! Anything else falls back to `gzip` with an error log, matching the "never fail,
//! fall back to the default" rule of configuration resolution.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::error;

/// Compression applied to profiles before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// gzip, the ingestion server's native format.
    #[default]
    Gzip,
    /// No compression.
    None,
}

impl Compression {
    /// Parses a compression identifier.
    ///
    /// Accepts: "gzip", "none"
    /// Aliases: "gz", "" (gzip), "off", "identity" (none)
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "gzip" | "gz" | "" => Some(Self::Gzip),
            "none" | "off" | "identity" => Some(Self::None),
            _ => None,
        }
    }

    /// Identifier handed to the transport collaborator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::None => "none",
        }
    }

    /// Returns true if uploads are compressed.
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Gzip)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Compression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Self::from_env_str(&s).unwrap_or_else(|| {
                error!("Unknown compression '{}', falling back to gzip", s);
                Self::Gzip
            })),
            other => {
                error!("Expected a string for compression, got {:?}", other);
                Ok(Self::Gzip)
            }
        }
    }
}
