//! Sync configuration
//!
//! [`SyncConfig`] is supplied when the engine is constructed and mutated at
//! runtime through [`SyncConfigUpdate`]. It deserializes from JSON with every
//! field optional:
//!
//! ```
//! use offsync_core::config::{ConflictStrategy, SyncConfig};
//!
//! let config: SyncConfig =
//!     serde_json::from_str(r#"{"auto_sync": true, "interval_ms": 5000}"#).unwrap();
//! assert!(config.auto_sync);
//! assert_eq!(config.interval.as_millis(), 5000);
//! assert_eq!(config.conflict_resolution, ConflictStrategy::Latest);
//! ```

use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Default time between automatic sync cycles
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default maximum number of records per upload batch
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Policy for picking a winner when both sides changed the same entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Always keep the local change
    Local,
    /// Always keep the remote change
    Remote,
    /// Later timestamp wins; exact ties go to local
    #[default]
    Latest,
    /// Surface the conflict and wait for an explicit decision
    Manual,
}

/// What the engine does with a conflict under [`ConflictStrategy::Manual`]
/// until someone resolves it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualFallback {
    /// Upload the local side as a placeholder
    #[default]
    KeepLocal,
    /// Neither upload nor apply; the local record stays pending
    Defer,
}

/// Process-wide tunables for a sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run cycles on a timer
    pub auto_sync: bool,
    /// Time between automatic cycles
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,
    /// Maximum records per upload batch (must be > 0)
    pub batch_size: usize,
    pub conflict_resolution: ConflictStrategy,
    /// Glob patterns over entity types that are never synchronized
    pub exclude_patterns: Vec<String>,
    pub manual_fallback: ManualFallback,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: false,
            interval: DEFAULT_SYNC_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            conflict_resolution: ConflictStrategy::default(),
            exclude_patterns: Vec::new(),
            manual_fallback: ManualFallback::default(),
        }
    }
}

impl SyncConfig {
    pub const fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub const fn with_conflict_resolution(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_resolution = strategy;
        self
    }

    pub const fn with_manual_fallback(mut self, fallback: ManualFallback) -> Self {
        self.manual_fallback = fallback;
        self
    }

    pub fn with_exclude_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Check invariants and compile the exclude patterns.
    pub fn validate(&self) -> SyncResult<ExcludeMatcher> {
        if self.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "interval must be greater than zero".to_string(),
            ));
        }
        ExcludeMatcher::new(&self.exclude_patterns)
    }

    /// Merge a partial update into this config and report what moved.
    pub fn apply(&mut self, update: SyncConfigUpdate) -> ConfigChange {
        let mut change = ConfigChange::default();

        if let Some(auto_sync) = update.auto_sync {
            if auto_sync != self.auto_sync {
                change.auto_sync = Some(auto_sync);
            }
            self.auto_sync = auto_sync;
        }
        if let Some(interval) = update.interval {
            change.interval_changed = interval != self.interval;
            self.interval = interval;
        }
        if let Some(batch_size) = update.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(strategy) = update.conflict_resolution {
            self.conflict_resolution = strategy;
        }
        if let Some(patterns) = update.exclude_patterns {
            self.exclude_patterns = patterns;
        }
        if let Some(fallback) = update.manual_fallback {
            self.manual_fallback = fallback;
        }

        change
    }
}

/// Partial configuration; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfigUpdate {
    pub auto_sync: Option<bool>,
    pub interval: Option<Duration>,
    pub batch_size: Option<usize>,
    pub conflict_resolution: Option<ConflictStrategy>,
    pub exclude_patterns: Option<Vec<String>>,
    pub manual_fallback: Option<ManualFallback>,
}

impl SyncConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = Some(auto_sync);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn conflict_resolution(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_resolution = Some(strategy);
        self
    }

    pub fn exclude_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn manual_fallback(mut self, fallback: ManualFallback) -> Self {
        self.manual_fallback = Some(fallback);
        self
    }
}

/// Effect of [`SyncConfig::apply`] on the timer-relevant fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChange {
    /// New `auto_sync` value if it flipped
    pub auto_sync: Option<bool>,
    pub interval_changed: bool,
}

/// Compiled exclude patterns
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    set: GlobSet,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> SyncResult<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                SyncError::InvalidConfig(format!("exclude pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("exclude patterns: {e}")))?;
        Ok(Self { set })
    }

    /// Whether the whole entity type matches any pattern
    pub fn is_excluded(&self, entity_type: &str) -> bool {
        self.set.is_match(entity_type)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
