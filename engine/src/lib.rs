//! # Briefcase Engine
//!
//! The deterministic core of briefcase synchronization.
//!
//! A briefcase is a local copy of a shared, versioned engineering database.
//! Many briefcases edit the same iModel concurrently and converge by pushing
//! and pulling changesets through a central hub. This crate holds every piece
//! of that process that can be expressed without I/O.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or the hub transport
//! - **Deterministic**: Same changesets in the same order always produce the same content
//! - **Testable**: Pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Elements and changes
//!
//! Content is a set of [`ElementProps`] keyed by element id. Every edit is
//! captured as a [`Change`] carrying the before and after image of one
//! element, so it can be applied forward, inverted and applied in reverse.
//!
//! ### Changesets and the timeline
//!
//! A [`ChangeSet`] is an ordered list of changes pushed as one unit. Its
//! [`ChangeSetToken`] places it on the iModel's [`Timeline`]: a single linear
//! history ordered by index in which every token's parent is its predecessor.
//!
//! ### Locks and codes
//!
//! [`Lock`]s guard elements, models, schemas and the repository at
//! [`LockLevel::Shared`] or [`LockLevel::Exclusive`]. [`Code`]s are reserved
//! business keys. The hub arbitrates both with a [`LockTable`] and a
//! [`CodeRegistry`]; clients accumulate what they need in a [`ResourceRequest`].
//!
//! ### Concurrency policy
//!
//! Each open database runs under one [`ConcurrencyPolicy`]:
//! - [`ConcurrencyPolicy::Pessimistic`] - resources are acquired before saving
//! - [`ConcurrencyPolicy::Optimistic`] - edits proceed freely and conflicts are
//!   settled at merge time by a [`ConflictResolutionPolicy`]
//!
//! The [`Merger`] applies that policy per element when incoming changes meet
//! local, not-yet-pushed ones.
//!
//! ### Local transactions
//!
//! The [`TxnManager`] tracks committed but unpushed [`Txn`]s, supports
//! grouped undo/redo, and describes the changeset built at push time.
//!
//! ## Quick Start
//!
//! ```rust
//! use briefcase_engine::{ChangeSet, ChangeSetToken, Change, ElementProps, ElementTable, Timeline};
//!
//! // 1. Record a local edit
//! let mut table = ElementTable::new();
//! let element = ElementProps::new("0x20000000001", "0x10", "Generic:PhysicalObject")
//!     .with_user_label("Pump");
//! let change = table.insert(element).unwrap();
//!
//! // 2. Package it as the first changeset of the timeline
//! let changeset = ChangeSet::new("", vec![change]);
//! let token = ChangeSetToken::new(changeset.compute_id(), "", 1, "add pump");
//! let mut timeline = Timeline::new();
//! timeline.append(token.clone()).unwrap();
//!
//! // 3. Replay it on another copy
//! let mut replica = ElementTable::new();
//! replica.apply_changeset(&changeset).unwrap();
//! assert_eq!(replica.to_json().unwrap(), table.to_json().unwrap());
//! ```

pub mod briefcase;
pub mod change;
pub mod changeset;
pub mod code;
pub mod concurrency;
pub mod element;
pub mod error;
pub mod lock;
pub mod merge;
pub mod observer;
pub mod request;
pub mod schema;
pub mod table;
pub mod txn;

// Re-export main types at crate root
pub use briefcase::{BriefcaseId, BriefcaseProps, KeepBriefcase, OpenMode, ReversedPosition, SyncMode};
pub use change::{squash, ApplyOption, Change, DbOpcode};
pub use changeset::{verify_sequence, ChangeSet, ChangeSetToken, Timeline};
pub use code::{Code, CodeRegistry, CodeReservation, CodeState};
pub use concurrency::{BulkState, ConcurrencyControl};
pub use element::{ElementProps, ModelProps, RelationshipProps};
pub use error::Error;
pub use lock::{Lock, LockLevel, LockTable, LockType};
pub use merge::{
    ConcurrencyPolicy, Conflict, ConflictKind, ConflictResolution, ConflictResolutionPolicy,
    MergeOutcome, Merger,
};
pub use observer::{Observers, SubscriptionId};
pub use request::ResourceRequest;
pub use schema::{Schema, SchemaSet};
pub use table::ElementTable;
pub use txn::{Txn, TxnAction, TxnEvent, TxnManager, ValidationError};

/// Type aliases for clarity
pub type ElementId = String;
pub type ModelId = String;
pub type IModelId = String;
pub type ContextId = String;
pub type ChangeSetId = String;
pub type ChangeSetIndex = u64;
pub type CodeSpecId = String;
pub type TxnId = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;

/// Id of the repository itself, the target of the [`LockType::Db`] lock.
pub const REPOSITORY_ID: &str = "0x1";
