//! Report encoding requested from the sampler.
//!
//! `pprof` is the structured format the ingestion server prefers; `collapsed` is the
//! legacy folded-stack text format (`frame;frame;frame count`).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportEncoding {
    #[default]
    Pprof,
    Collapsed,
}

impl ReportEncoding {
    /// Accepts "pprof" and "collapsed" ("folded" is an alias). An empty string is the
    /// default.
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pprof" | "" => Some(Self::Pprof),
            "collapsed" | "folded" => Some(Self::Collapsed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pprof => "pprof",
            Self::Collapsed => "collapsed",
        }
    }
}

impl fmt::Display for ReportEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReportEncoding {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Self::from_env_str(&s).unwrap_or_else(|| {
                error!("Unknown report encoding '{}', falling back to pprof", s);
                Self::Pprof
            })),
            other => {
                error!("Expected a string for report encoding, got {:?}", other);
                Ok(Self::Pprof)
            }
        }
    }
}
