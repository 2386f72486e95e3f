//! Error types for the briefcase engine.

use crate::{BriefcaseId, ChangeSetId, ChangeSetIndex, ElementId, SchemaVersion, TxnId};
use thiserror::Error;

/// All possible errors from the briefcase engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Element errors
    #[error("element not found: {0}")]
    ElementNotFound(ElementId),

    #[error("element already exists: {0}")]
    ElementAlreadyExists(ElementId),

    #[error("change does not match the current state of element {0}")]
    StaleChange(ElementId),

    #[error("invalid change for element {element_id}: {reason}")]
    InvalidChange { element_id: ElementId, reason: String },

    // Schema errors
    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("schema {name} version {incoming} is older than imported version {existing}")]
    SchemaDowngrade {
        name: String,
        existing: SchemaVersion,
        incoming: SchemaVersion,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Changeset errors
    #[error("changeset out of order: expected index {expected}, got {actual}")]
    OutOfOrderChangeSet {
        expected: ChangeSetIndex,
        actual: ChangeSetIndex,
    },

    #[error("changeset at index {index} has parent '{actual}', expected '{expected}'")]
    ParentMismatch {
        index: ChangeSetIndex,
        expected: ChangeSetId,
        actual: ChangeSetId,
    },

    #[error("invalid changeset: {0}")]
    InvalidChangeSet(String),

    #[error("changeset {0} contains schema changes and cannot be reversed")]
    IrreversibleChangeSet(ChangeSetId),

    // Resource errors
    #[error("{lock} is held by briefcase {owner}")]
    LockOwnedByAnotherBriefcase { lock: String, owner: BriefcaseId },

    #[error("code {code} is reserved by briefcase {owner}")]
    CodeReservedByAnotherBriefcase { code: String, owner: BriefcaseId },

    #[error("code {0} has already been used")]
    CodeAlreadyUsed(String),

    // State errors
    #[error("no briefcase is bound to this concurrency control")]
    NoBriefcase,

    #[error("cannot save with {0} pending resource requests")]
    PendingRequests(usize),

    #[error("cannot change concurrency policy with unsaved or unpushed local changes")]
    LocalChangesPresent,

    #[error("nothing to reverse")]
    NothingToReverse,

    #[error("nothing to reinstate")]
    NothingToReinstate,

    #[error("unknown txn: {0}")]
    UnknownTxn(TxnId),

    #[error("no multi-txn operation is active")]
    NoMultiTxnOperation,

    #[error("commit aborted by fatal validation error: {0}")]
    FatalValidationError(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
