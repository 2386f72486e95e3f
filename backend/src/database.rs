//! The local database behind a briefcase file.
//!
//! A [`LocalDatabase`] owns the content of one briefcase, its unsaved edits
//! and its committed-but-unpushed changes. Calls on an open handle are
//! synchronous; only opening suspends, through a [`DatabaseOpener`].

use async_trait::async_trait;
use briefcase_engine::{
    ApplyOption, BriefcaseProps, Change, ChangeSet, ChangeSetToken, ConflictResolutionPolicy,
    ElementProps, ElementTable, MergeOutcome, OpenMode, Schema,
};
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors from a local database.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DatabaseError {
    #[error("briefcase file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("database is open read-only")]
    ReadOnly,

    #[error("database is closed")]
    Closed,

    #[error("operation not allowed with unsaved changes")]
    UnsavedChanges,

    #[error("no changeset is being created")]
    NoChangeSetInProgress,

    #[error("corrupt briefcase file {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Engine(#[from] briefcase_engine::Error),
}

impl From<std::io::Error> for DatabaseError {
    fn from(e: std::io::Error) -> Self {
        DatabaseError::Io(e.to_string())
    }
}

pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// An open briefcase file.
pub trait LocalDatabase: Send + fmt::Debug {
    fn path(&self) -> &Path;

    fn open_mode(&self) -> OpenMode;

    /// Metadata embedded in the file.
    fn props(&self) -> &BriefcaseProps;

    /// Logical content, including unsaved edits.
    fn content(&self) -> &ElementTable;

    fn element(&self, id: &str) -> Option<&ElementProps> {
        self.content().get(id)
    }

    fn insert_element(&mut self, element: ElementProps) -> DbResult<Change>;

    fn update_element(&mut self, element: ElementProps) -> DbResult<Change>;

    fn delete_element(&mut self, id: &str) -> DbResult<Change>;

    /// Import a schema as an unsaved change. Returns `true` if it changed anything.
    fn import_schema(&mut self, schema: Schema) -> DbResult<bool>;

    fn has_unsaved_changes(&self) -> bool;

    /// Net unsaved element changes.
    fn unsaved_changes(&self) -> Vec<Change>;

    /// Commit unsaved edits and persist. Returns the committed net changes.
    fn save_changes(&mut self) -> DbResult<Vec<Change>>;

    /// Throw away unsaved edits.
    fn abandon_changes(&mut self) -> DbResult<()>;

    /// Committed changes not yet pushed, one per element.
    fn unpushed_changes(&self) -> &[Change];

    /// Whether anything (changes or schemas) is waiting to be pushed.
    fn has_unpushed_changes(&self) -> bool;

    /// Apply undo/redo changes as a commit.
    fn apply_txn_changes(&mut self, changes: &[Change]) -> DbResult<()>;

    /// Apply a changeset from the timeline.
    ///
    /// `Merge` resolves conflicts with unpushed changes using `policy` and
    /// rebases them onto the changeset; `Reverse` and `Reinstate` require
    /// that nothing is unpushed. The file position follows the token.
    fn apply_changeset(
        &mut self,
        token: &ChangeSetToken,
        changeset: &ChangeSet,
        option: ApplyOption,
        policy: ConflictResolutionPolicy,
    ) -> DbResult<MergeOutcome>;

    /// Build the changeset for the next push from unpushed changes.
    fn start_create_changeset(&mut self) -> DbResult<ChangeSet>;

    /// The changeset was accepted as `token`; unpushed state is cleared.
    fn finish_create_changeset(&mut self, token: &ChangeSetToken) -> DbResult<()>;

    /// The push failed; unpushed state is kept.
    fn abandon_create_changeset(&mut self);

    /// Deterministic JSON of the logical content.
    fn dump(&self) -> DbResult<String>;

    /// Persist and release the handle. Further calls fail with `Closed`.
    fn close(&mut self) -> DbResult<()>;
}

/// Opens and creates briefcase files.
#[async_trait]
pub trait DatabaseOpener: Send + Sync {
    /// Open an existing briefcase file.
    async fn open(&self, path: &Path, mode: OpenMode) -> DbResult<Box<dyn LocalDatabase>>;

    /// Create an empty briefcase file with the given metadata.
    async fn create(&self, path: &Path, props: BriefcaseProps) -> DbResult<Box<dyn LocalDatabase>>;

    /// Read only the embedded metadata of a briefcase file.
    async fn read_props(&self, path: &Path) -> DbResult<BriefcaseProps>;

    /// Copy the saved content of `source` to a new file with `props` and no
    /// unpushed changes.
    async fn copy(&self, source: &Path, target: &Path, props: BriefcaseProps) -> DbResult<()>;
}
