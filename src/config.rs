use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Runtime configuration for a [`crate::raft::Log`] and its compactor.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum size in bytes of a single segment file before it is rolled.
    pub segment_size: u64,
    /// Whether `commit()` synchronously fsyncs the active segment.
    pub flush_on_commit: bool,
    /// Directory holding segment files.
    pub storage_dir: PathBuf,
    /// Fraction of a segment's entries that must be filtered out before
    /// minor compaction rewrites it.
    pub compaction_minor_threshold: f64,
    /// Interval between major compaction passes.
    #[serde(with = "duration_secs")]
    pub compaction_major_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: 64 << 20,
            flush_on_commit: true,
            storage_dir: PathBuf::from("data"),
            compaction_minor_threshold: 0.5,
            compaction_major_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Loads configuration by layering a TOML file (if present) and
    /// `RAFTLOG_`-prefixed environment variables over the defaults, in the
    /// same builder style the teacher repo uses for its own `Options`.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("RAFTLOG"));
        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
