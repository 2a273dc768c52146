//! Conflict detection and resolution
//!
//! Pure functions over two record populations: the local pending set and
//! the remote delta since the last sync. Both are keyed by
//! `(entity_type, entity_id)`.
//!
//! ```text
//! local pending ──┐                    ┌──▶ local_only  ──▶ upload
//!                 ├─▶ detect_conflicts ┼──▶ conflicts   ──▶ resolve_conflicts
//! remote delta ───┘                    └──▶ remote_only ──▶ apply locally
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConflictStrategy;
use crate::types::{ChangeRecord, EntityKey};

/// Which side of a conflict wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

/// Local and remote changes to the same entity, neither applied in the
/// other's context yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub local: ChangeRecord,
    pub remote: ChangeRecord,
}

impl Conflict {
    pub fn key(&self) -> EntityKey {
        self.local.key()
    }

    /// Record on the given side
    pub fn side(&self, side: Side) -> &ChangeRecord {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

/// A conflict plus the decision taken for it.
///
/// The loser is discarded; records are never merged field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub conflict: Conflict,
    pub resolution: Side,
    pub resolved_at: DateTime<Utc>,
    /// Placeholder decision under [`ConflictStrategy::Manual`]; awaits an
    /// explicit choice
    pub deferred: bool,
}

impl ResolvedConflict {
    pub fn winner(&self) -> &ChangeRecord {
        self.conflict.side(self.resolution)
    }

    pub fn loser(&self) -> &ChangeRecord {
        match self.resolution {
            Side::Local => &self.conflict.remote,
            Side::Remote => &self.conflict.local,
        }
    }
}

/// Partition of two record populations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictDetection {
    pub conflicts: Vec<Conflict>,
    pub local_only: Vec<ChangeRecord>,
    pub remote_only: Vec<ChangeRecord>,
}

/// Split local and remote changes into local-only, remote-only and
/// conflicting pairs.
///
/// Every remote record is used at most once. If the remote set carries
/// several records for one key, the last one is kept. Local order is
/// preserved in `conflicts` and `local_only`; `remote_only` keeps remote
/// arrival order.
pub fn detect_conflicts(local: &[ChangeRecord], remote: &[ChangeRecord]) -> ConflictDetection {
    let mut remote_by_key: HashMap<EntityKey, (usize, &ChangeRecord)> =
        HashMap::with_capacity(remote.len());
    for (position, record) in remote.iter().enumerate() {
        remote_by_key.insert(record.key(), (position, record));
    }

    let mut detection = ConflictDetection::default();
    for local_record in local {
        match remote_by_key.remove(&local_record.key()) {
            Some((_, remote_record)) => detection.conflicts.push(Conflict {
                local: local_record.clone(),
                remote: remote_record.clone(),
            }),
            None => detection.local_only.push(local_record.clone()),
        }
    }

    let mut leftovers: Vec<_> = remote_by_key.into_values().collect();
    leftovers.sort_by_key(|(position, _)| *position);
    detection.remote_only = leftovers
        .into_iter()
        .map(|(_, record)| record.clone())
        .collect();

    detection
}

/// Decide a winner for one conflict
pub fn resolve(conflict: &Conflict, strategy: ConflictStrategy) -> Side {
    match strategy {
        ConflictStrategy::Local | ConflictStrategy::Manual => Side::Local,
        ConflictStrategy::Remote => Side::Remote,
        ConflictStrategy::Latest => {
            if conflict.remote.timestamp > conflict.local.timestamp {
                Side::Remote
            } else {
                Side::Local
            }
        }
    }
}

/// Apply `strategy` to every conflict
pub fn resolve_conflicts(
    conflicts: &[Conflict],
    strategy: ConflictStrategy,
) -> Vec<ResolvedConflict> {
    let resolved_at = Utc::now();
    conflicts
        .iter()
        .map(|conflict| ResolvedConflict {
            conflict: conflict.clone(),
            resolution: resolve(conflict, strategy),
            resolved_at,
            deferred: strategy == ConflictStrategy::Manual,
        })
        .collect()
}
