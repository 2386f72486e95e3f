//! JSON briefcase files.
//!
//! The whole briefcase lives in one file: its embedded metadata, content and
//! unpushed changes. Every commit rewrites the file through a temporary
//! sibling and a rename, so a crash leaves either the old or the new state.

use crate::database::{DatabaseError, DbResult, LocalDatabase};
use briefcase_engine::{
    squash, ApplyOption, BriefcaseProps, Change, ChangeSet, ChangeSetToken,
    ConflictResolutionPolicy, ElementProps, ElementTable, Error, MergeOutcome, Merger, OpenMode,
    Schema,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk layout of a briefcase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefcaseFile {
    pub props: BriefcaseProps,
    #[serde(default)]
    pub content: ElementTable,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unpushed_changes: Vec<Change>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unpushed_schemas: Vec<Schema>,
}

impl BriefcaseFile {
    pub fn new(props: BriefcaseProps) -> Self {
        Self {
            props,
            content: ElementTable::new(),
            unpushed_changes: Vec::new(),
            unpushed_schemas: Vec::new(),
        }
    }

    pub fn read(path: &Path, bytes: &[u8]) -> DbResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| DatabaseError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write atomically through a temporary sibling.
    pub fn write(&self, path: &Path) -> DbResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| DatabaseError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// A briefcase file loaded into memory.
#[derive(Debug)]
pub struct JsonDatabase {
    path: PathBuf,
    mode: OpenMode,
    file: BriefcaseFile,
    /// Content as of the last commit; taken on the first unsaved edit
    checkpoint: Option<ElementTable>,
    unsaved: Vec<Change>,
    unsaved_schemas: Vec<Schema>,
    creating_changeset: bool,
    closed: bool,
}

impl JsonDatabase {
    pub fn new(path: impl Into<PathBuf>, mode: OpenMode, file: BriefcaseFile) -> Self {
        Self {
            path: path.into(),
            mode,
            file,
            checkpoint: None,
            unsaved: Vec::new(),
            unsaved_schemas: Vec::new(),
            creating_changeset: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed {
            return Err(DatabaseError::Closed);
        }
        Ok(())
    }

    /// User edits need a writable handle and mark the start of unsaved state.
    fn begin_edit(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        if self.mode == OpenMode::ReadOnly {
            return Err(DatabaseError::ReadOnly);
        }
        if self.checkpoint.is_none() {
            self.checkpoint = Some(self.file.content.clone());
        }
        Ok(())
    }

    fn ensure_saved(&self) -> DbResult<()> {
        self.ensure_open()?;
        if self.has_unsaved_changes() {
            return Err(DatabaseError::UnsavedChanges);
        }
        Ok(())
    }

    fn ensure_nothing_unpushed(&self) -> DbResult<()> {
        if self.has_unpushed_changes() {
            return Err(Error::LocalChangesPresent.into());
        }
        Ok(())
    }

    fn persist(&self) -> DbResult<()> {
        self.file.write(&self.path)
    }

    fn record_unpushed(&mut self, changes: &[Change]) {
        self.file.unpushed_changes = squash(self.file.unpushed_changes.iter().chain(changes.iter()));
    }

    /// Check that `token` is the next changeset after the current position.
    fn ensure_follows(&self, token: &ChangeSetToken) -> DbResult<()> {
        let props = &self.file.props;
        let expected = props.current_index() + 1;
        if token.index != expected {
            return Err(Error::OutOfOrderChangeSet {
                expected,
                actual: token.index,
            }
            .into());
        }
        if &token.parent_id != props.current_changeset_id() {
            return Err(Error::ParentMismatch {
                index: token.index,
                expected: props.current_changeset_id().clone(),
                actual: token.parent_id.clone(),
            }
            .into());
        }
        Ok(())
    }
}

impl LocalDatabase for JsonDatabase {
    fn path(&self) -> &Path {
        &self.path
    }

    fn open_mode(&self) -> OpenMode {
        self.mode
    }

    fn props(&self) -> &BriefcaseProps {
        &self.file.props
    }

    fn content(&self) -> &ElementTable {
        &self.file.content
    }

    fn insert_element(&mut self, element: ElementProps) -> DbResult<Change> {
        self.begin_edit()?;
        let change = self.file.content.insert(element)?;
        self.unsaved.push(change.clone());
        Ok(change)
    }

    fn update_element(&mut self, element: ElementProps) -> DbResult<Change> {
        self.begin_edit()?;
        let change = self.file.content.update(element)?;
        self.unsaved.push(change.clone());
        Ok(change)
    }

    fn delete_element(&mut self, id: &str) -> DbResult<Change> {
        self.begin_edit()?;
        let change = self.file.content.delete(id)?;
        self.unsaved.push(change.clone());
        Ok(change)
    }

    fn import_schema(&mut self, schema: Schema) -> DbResult<bool> {
        self.begin_edit()?;
        let changed = self.file.content.import_schema(schema.clone())?;
        if changed {
            self.unsaved_schemas.push(schema);
        }
        Ok(changed)
    }

    fn has_unsaved_changes(&self) -> bool {
        !self.unsaved.is_empty() || !self.unsaved_schemas.is_empty()
    }

    fn unsaved_changes(&self) -> Vec<Change> {
        squash(&self.unsaved)
    }

    fn save_changes(&mut self) -> DbResult<Vec<Change>> {
        self.ensure_open()?;
        let changes = squash(&self.unsaved);
        self.record_unpushed(&changes);
        self.file.unpushed_schemas.append(&mut self.unsaved_schemas);
        self.unsaved.clear();
        self.checkpoint = None;
        self.persist()?;
        Ok(changes)
    }

    fn abandon_changes(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        if let Some(content) = self.checkpoint.take() {
            self.file.content = content;
        }
        self.unsaved.clear();
        self.unsaved_schemas.clear();
        Ok(())
    }

    fn unpushed_changes(&self) -> &[Change] {
        &self.file.unpushed_changes
    }

    fn has_unpushed_changes(&self) -> bool {
        !self.file.unpushed_changes.is_empty() || !self.file.unpushed_schemas.is_empty()
    }

    fn apply_txn_changes(&mut self, changes: &[Change]) -> DbResult<()> {
        self.ensure_saved()?;
        self.file.content.apply_changes(changes)?;
        self.record_unpushed(changes);
        self.persist()
    }

    fn apply_changeset(
        &mut self,
        token: &ChangeSetToken,
        changeset: &ChangeSet,
        option: ApplyOption,
        policy: ConflictResolutionPolicy,
    ) -> DbResult<MergeOutcome> {
        self.ensure_saved()?;
        let outcome = match option {
            ApplyOption::Merge => {
                self.ensure_follows(token)?;
                let outcome = Merger::new(policy).merge(&self.file.unpushed_changes, &changeset.changes)?;
                let resolved = ChangeSet::new(changeset.parent_id.clone(), outcome.to_apply.clone())
                    .with_schemas(changeset.schemas.clone());
                self.file
                    .content
                    .apply_changeset_with(&resolved, ApplyOption::Merge, &token.id)?;
                self.file.unpushed_changes = outcome.rebased_local.clone();
                self.file.props.set_current(token.id.clone(), token.index);
                outcome
            }
            ApplyOption::Reinstate => {
                self.ensure_nothing_unpushed()?;
                self.ensure_follows(token)?;
                self.file
                    .content
                    .apply_changeset_with(changeset, ApplyOption::Reinstate, &token.id)?;
                self.file.props.set_current(token.id.clone(), token.index);
                MergeOutcome::default()
            }
            ApplyOption::Reverse => {
                self.ensure_nothing_unpushed()?;
                let current = self.file.props.current_index();
                if token.index != current {
                    return Err(Error::OutOfOrderChangeSet {
                        expected: current,
                        actual: token.index,
                    }
                    .into());
                }
                self.file
                    .content
                    .apply_changeset_with(changeset, ApplyOption::Reverse, &token.id)?;
                self.file
                    .props
                    .set_current(token.parent_id.clone(), token.index - 1);
                MergeOutcome::default()
            }
        };
        self.persist()?;
        Ok(outcome)
    }

    fn start_create_changeset(&mut self) -> DbResult<ChangeSet> {
        self.ensure_saved()?;
        if self.file.props.is_reversed() {
            return Err(Error::InvalidChangeSet(
                "cannot create a changeset while changesets are reversed".into(),
            )
            .into());
        }
        self.creating_changeset = true;
        Ok(
            ChangeSet::new(self.file.props.changeset_id.clone(), self.file.unpushed_changes.clone())
                .with_schemas(self.file.unpushed_schemas.clone()),
        )
    }

    fn finish_create_changeset(&mut self, token: &ChangeSetToken) -> DbResult<()> {
        self.ensure_open()?;
        if !self.creating_changeset {
            return Err(DatabaseError::NoChangeSetInProgress);
        }
        self.ensure_follows(token)?;
        self.creating_changeset = false;
        self.file.unpushed_changes.clear();
        self.file.unpushed_schemas.clear();
        self.file.props.set_current(token.id.clone(), token.index);
        self.persist()
    }

    fn abandon_create_changeset(&mut self) {
        self.creating_changeset = false;
    }

    fn dump(&self) -> DbResult<String> {
        Ok(self.file.content.to_json()?)
    }

    fn close(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.abandon_changes()?;
        if self.mode == OpenMode::ReadWrite {
            self.persist()?;
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use briefcase_engine::{BriefcaseId, SyncMode};

    fn props() -> BriefcaseProps {
        BriefcaseProps::seed("im", "ctx", BriefcaseId::new(2), SyncMode::PullAndPush)
    }

    fn element(id: &str, label: &str) -> ElementProps {
        ElementProps::new(id, "0x10", "Generic:PhysicalObject").with_user_label(label)
    }

    fn database(dir: &Path, mode: OpenMode) -> JsonDatabase {
        JsonDatabase::new(dir.join("bc.json"), mode, BriefcaseFile::new(props()))
    }

    #[test]
    fn save_persists_and_abandon_restores() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = database(dir.path(), OpenMode::ReadWrite);

        db.insert_element(element("0x20", "a")).unwrap();
        assert!(db.has_unsaved_changes());
        let saved = db.save_changes().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(db.unpushed_changes().len(), 1);

        db.update_element(element("0x20", "b")).unwrap();
        db.insert_element(element("0x21", "c")).unwrap();
        db.abandon_changes().unwrap();
        assert!(!db.has_unsaved_changes());
        assert_eq!(db.element("0x20").unwrap().user_label.as_deref(), Some("a"));
        assert!(db.element("0x21").is_none());

        let bytes = std::fs::read(dir.path().join("bc.json")).unwrap();
        let file = BriefcaseFile::read(dir.path(), &bytes).unwrap();
        assert_eq!(file.content.len(), 1);
        assert_eq!(file.props.briefcase_id, BriefcaseId::new(2));
    }

    #[test]
    fn read_only_refuses_edits() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = database(dir.path(), OpenMode::ReadOnly);
        assert_eq!(
            db.insert_element(element("0x20", "a")).unwrap_err(),
            DatabaseError::ReadOnly
        );
    }

    #[test]
    fn changeset_creation_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = database(dir.path(), OpenMode::ReadWrite);
        db.insert_element(element("0x20", "a")).unwrap();
        assert_eq!(
            db.start_create_changeset().unwrap_err(),
            DatabaseError::UnsavedChanges
        );
        db.save_changes().unwrap();

        let changeset = db.start_create_changeset().unwrap();
        assert_eq!(changeset.parent_id, "");
        let token = ChangeSetToken::for_push(&changeset, 0, "add", BriefcaseId::new(2));
        db.finish_create_changeset(&token).unwrap();

        assert!(!db.has_unpushed_changes());
        assert_eq!(db.props().changeset_index, 1);
        assert_eq!(db.props().changeset_id, token.id);
        assert_eq!(
            db.finish_create_changeset(&token).unwrap_err(),
            DatabaseError::NoChangeSetInProgress
        );
    }

    #[test]
    fn merge_rebases_unpushed_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = database(dir.path(), OpenMode::ReadWrite);
        db.insert_element(element("0x20", "mine")).unwrap();
        db.save_changes().unwrap();

        let incoming = ChangeSet::new("", vec![Change::insert(element("0x21", "theirs"))]);
        let token = ChangeSetToken::new(incoming.compute_id(), "", 1, "theirs");
        let outcome = db
            .apply_changeset(&token, &incoming, ApplyOption::Merge, Default::default())
            .unwrap();

        assert!(!outcome.has_conflicts());
        assert_eq!(db.content().len(), 2);
        assert_eq!(db.unpushed_changes().len(), 1);
        assert_eq!(db.props().changeset_index, 1);

        // applying the same token again is out of order
        assert!(matches!(
            db.apply_changeset(&token, &incoming, ApplyOption::Merge, Default::default()),
            Err(DatabaseError::Engine(Error::OutOfOrderChangeSet { expected: 2, actual: 1 }))
        ));
    }

    #[test]
    fn reverse_and_reinstate_track_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = database(dir.path(), OpenMode::ReadWrite);
        let cs = ChangeSet::new("", vec![Change::insert(element("0x20", "a"))]);
        let token = ChangeSetToken::new(cs.compute_id(), "", 1, "one");
        db.apply_changeset(&token, &cs, ApplyOption::Merge, Default::default())
            .unwrap();

        db.apply_changeset(&token, &cs, ApplyOption::Reverse, Default::default())
            .unwrap();
        assert!(db.props().is_reversed());
        assert_eq!(db.props().current_index(), 0);
        assert!(db.content().is_empty());
        assert!(db.start_create_changeset().is_err());

        db.apply_changeset(&token, &cs, ApplyOption::Reinstate, Default::default())
            .unwrap();
        assert!(!db.props().is_reversed());
        assert_eq!(db.content().len(), 1);
    }

    #[test]
    fn closed_handle_refuses_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = database(dir.path(), OpenMode::ReadWrite);
        db.close().unwrap();
        assert_eq!(db.save_changes().unwrap_err(), DatabaseError::Closed);
        assert_eq!(db.close().unwrap_err(), DatabaseError::Closed);
    }
}
