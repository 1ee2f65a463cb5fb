//! Schedule file: which registered tasks run, and how often.
//!
//! ```toml
//! [schedules]
//! "workq::sweep::StaleClaimSweeper" = "30s"
//! ```
//!
//! Keys are resolved against a `TaskRegistry` at startup; the intervals are
//! parsed here, so a malformed file fails before anything is spawned.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::parse_duration;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    schedules: BTreeMap<String, String>,
}

/// Parsed `(key, interval)` pairs, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub entries: Vec<(String, Duration)>,
}

impl ScheduleConfig {
    /// Parse a schedule file's contents.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ScheduleFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad schedule config: {e}")))?;
        let entries = file
            .schedules
            .into_iter()
            .map(|(key, raw)| {
                let interval = parse_duration(&key, &raw)?;
                if interval.is_zero() {
                    return Err(Error::Config(format!("{key}: interval must be non-zero")));
                }
                Ok((key, interval))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Load a schedule file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read schedule file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Add an entry unless its key is already configured.
    pub fn with_default(mut self, key: impl Into<String>, interval: Duration) -> Self {
        let key = key.into();
        if !self.entries.iter().any(|(k, _)| *k == key) {
            self.entries.push((key, interval));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
