//! Offsync Core Library
//!
//! Offline-first synchronization: a local change log reconciled with a
//! remote service, with conflict resolution and optional end-to-end
//! encryption of payloads.
//!
//! ## Overview
//!
//! Every local mutation becomes a [`ChangeRecord`] that stays `pending` until
//! the remote acknowledges it. A sync cycle pulls the remote delta since the
//! last checkpoint, detects conflicts per `(entity_type, entity_id)`, resolves
//! them by policy, uploads in batches and applies remote changes locally.
//!
//! ## Core Principles
//!
//! - **Local-first**: recording a change never needs the network
//! - **No silent loss**: a change leaves `pending` only when acknowledged or
//!   explicitly rejected
//! - **Opaque payloads**: the core hashes and encrypts entity data but never
//!   interprets it
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use offsync_core::{MemoryStore, Operation, SyncConfig, SyncEngine};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let remote = Arc::new(MyRemote::connect("https://sync.example").await?);
//!     let engine = SyncEngine::new(Arc::new(MemoryStore::new()), remote, SyncConfig::default())?;
//!
//!     engine
//!         .record_change("task", "42", Operation::Create, Some(json!({"title": "Plant garden"})))
//!         .await?;
//!
//!     let outcome = engine.sync().await;
//!     println!("{:?}", outcome.status());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conflict;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod store;
pub mod types;

// Re-exports
pub use config::{ConflictStrategy, ManualFallback, SyncConfig, SyncConfigUpdate};
pub use conflict::{detect_conflicts, resolve_conflicts, Conflict, ResolvedConflict, Side};
pub use crypto::{EncryptedData, EncryptionService, PasswordChange};
pub use engine::{
    CycleStatus, EngineState, SkipReason, SyncEngine, SyncFailure, SyncOutcome, SyncReport,
};
pub use error::{SyncError, SyncResult};
pub use events::{Subscription, SyncEvent, SyncEventKind};
pub use store::{
    EncryptedRemote, LocalStore, MemoryStore, PushFailure, PushResult, RedbStore, RemoteService,
};
pub use types::*;
