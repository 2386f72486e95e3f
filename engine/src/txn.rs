//! Local transactions: committed changes that have not been pushed yet.
//!
//! Txns form a strictly ordered list from the last push to the current tip.
//! Reversed txns move to a redo stack until they are reinstated or a new
//! commit discards them. Txns committed inside a multi-txn operation share a
//! group and are reversed and reinstated as one unit.
//!
//! Merging an incoming changeset collapses the local txns into a single
//! merged txn holding the rebased net changes. Undo stops there: the history
//! before a merge no longer describes the content.

use crate::{
    error::Result, squash, ApplyOption, Change, ElementId, Error, Observers, SubscriptionId, TxnId,
};
use serde::{Deserialize, Serialize};

/// What the txn manager is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxnAction {
    #[default]
    None,
    Commit,
    Abandon,
    Reverse,
    Reinstate,
    Merge,
}

/// One committed local transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Txn {
    pub id: TxnId,
    pub description: String,
    pub changes: Vec<Change>,
    /// Multi-txn operation this txn belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u64>,
    /// Created by a merge; cannot be reversed
    #[serde(default)]
    pub merged: bool,
    /// Descriptions of the txns a merged txn replaced
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_descriptions: Vec<String>,
}

impl Txn {
    fn descriptions(&self) -> Vec<&str> {
        if self.merged {
            self.merged_descriptions.iter().map(String::as_str).collect()
        } else {
            vec![self.description.as_str()]
        }
    }
}

/// A problem reported by dependency validation during a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// A fatal error aborts the enclosing commit
    pub fatal: bool,
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<ElementId>,
}

impl ValidationError {
    pub fn fatal(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            error_type: error_type.into(),
            message: message.into(),
            element_id: None,
        }
    }

    pub fn warning(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fatal: false,
            ..Self::fatal(error_type, message)
        }
    }

    pub fn for_element(mut self, element_id: impl Into<ElementId>) -> Self {
        self.element_id = Some(element_id.into());
        self
    }
}

/// Events delivered to txn observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnEvent {
    /// A save is about to commit
    BeforeCommit,
    /// A save committed the given txn
    Committed(TxnId),
    /// Unsaved changes were abandoned
    Abandoned,
    /// A changeset was applied to the content
    ChangesApplied(ApplyOption),
    /// Txns were reversed or reinstated
    UndoRedo(TxnAction),
}

/// Tracks local txns, grouping, undo/redo and validation errors.
#[derive(Debug, Default)]
pub struct TxnManager {
    txns: Vec<Txn>,
    redo: Vec<Txn>,
    next_txn_id: TxnId,
    action: TxnAction,
    multi_txn_depth: u32,
    current_group: Option<u64>,
    next_group: u64,
    validation_errors: Vec<ValidationError>,
    observers: Observers<TxnEvent>,
}

impl TxnManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: 1,
            ..Default::default()
        }
    }

    pub fn action(&self) -> TxnAction {
        self.action
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&TxnEvent) + Send + 'static) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // ---- multi-txn operations ----

    /// Start (or nest) a multi-txn operation. Returns the new depth.
    pub fn begin_multi_txn_operation(&mut self) -> u32 {
        if self.multi_txn_depth == 0 {
            self.next_group += 1;
            self.current_group = Some(self.next_group);
        }
        self.multi_txn_depth += 1;
        self.multi_txn_depth
    }

    /// End the innermost multi-txn operation. Returns the remaining depth.
    pub fn end_multi_txn_operation(&mut self) -> Result<u32> {
        if self.multi_txn_depth == 0 {
            return Err(Error::NoMultiTxnOperation);
        }
        self.multi_txn_depth -= 1;
        if self.multi_txn_depth == 0 {
            self.current_group = None;
        }
        Ok(self.multi_txn_depth)
    }

    pub fn multi_txn_depth(&self) -> u32 {
        self.multi_txn_depth
    }

    // ---- validation ----

    /// Record a validation error for the commit in progress.
    pub fn report_error(&mut self, error: ValidationError) {
        self.validation_errors.push(error);
    }

    pub fn validation_errors(&self) -> &[ValidationError] {
        &self.validation_errors
    }

    pub fn has_fatal_error(&self) -> bool {
        self.validation_errors.iter().any(|e| e.fatal)
    }

    // ---- commit ----

    /// Opens a commit. Observers may still report validation errors.
    pub fn on_commit(&mut self) {
        self.action = TxnAction::Commit;
        self.observers.notify(&TxnEvent::BeforeCommit);
    }

    /// Fail the commit in progress if a fatal validation error was reported.
    ///
    /// The errors are cleared either way; the caller rolls back on `Err`.
    pub fn check_commit(&mut self) -> Result<()> {
        let fatal = self
            .validation_errors
            .iter()
            .find(|e| e.fatal)
            .map(|e| format!("{}: {}", e.error_type, e.message));
        if let Some(message) = fatal {
            self.validation_errors.clear();
            self.action = TxnAction::None;
            return Err(Error::FatalValidationError(message));
        }
        Ok(())
    }

    /// Record a committed txn. Returns `None` if there was nothing to commit.
    pub fn on_committed(&mut self, description: impl Into<String>, changes: Vec<Change>) -> Option<TxnId> {
        self.action = TxnAction::None;
        self.validation_errors.clear();
        if changes.is_empty() {
            return None;
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.txns.push(Txn {
            id,
            description: description.into(),
            changes,
            group: self.current_group,
            merged: false,
            merged_descriptions: Vec::new(),
        });
        self.redo.clear();
        self.observers.notify(&TxnEvent::Committed(id));
        Some(id)
    }

    /// Unsaved changes were thrown away.
    pub fn on_abandoned(&mut self) {
        self.action = TxnAction::None;
        self.validation_errors.clear();
        self.observers.notify(&TxnEvent::Abandoned);
    }

    // ---- queries ----

    pub fn txns(&self) -> &[Txn] {
        &self.txns
    }

    pub fn has_local_changes(&self) -> bool {
        !self.txns.is_empty()
    }

    pub fn first_txn_id(&self) -> Option<TxnId> {
        self.txns.first().map(|t| t.id)
    }

    pub fn current_txn_id(&self) -> Option<TxnId> {
        self.txns.last().map(|t| t.id)
    }

    pub fn is_undo_possible(&self) -> bool {
        self.txns.last().map(|t| !t.merged).unwrap_or(false)
    }

    pub fn is_redo_possible(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Net change of all local txns, one per element.
    pub fn local_changes(&self) -> Vec<Change> {
        squash(self.txns.iter().flat_map(|t| t.changes.iter()))
    }

    /// Distinct descriptions of local txns up to `end` (default: the tip), in order.
    pub fn describe_changeset(&self, end: Option<TxnId>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for txn in &self.txns {
            if matches!(end, Some(end) if txn.id > end) {
                break;
            }
            for description in txn.descriptions() {
                if !description.is_empty() && !out.iter().any(|d| d == description) {
                    out.push(description.to_string());
                }
            }
        }
        out
    }

    // ---- undo / redo ----

    /// Number of txns at the tail forming the last reversible unit.
    fn unit_len(list: &[Txn]) -> usize {
        let Some(last) = list.last() else { return 0 };
        match last.group {
            Some(group) => list.iter().rev().take_while(|t| t.group == Some(group)).count(),
            None => 1,
        }
    }

    /// Reverse the last `count` units (a group counts as one).
    ///
    /// Returns the changes to apply to the content, in order.
    pub fn reverse_txns(&mut self, count: usize) -> Result<Vec<Change>> {
        if count == 0 || !self.is_undo_possible() {
            return Err(Error::NothingToReverse);
        }
        let mut changes = Vec::new();
        for _ in 0..count {
            if !self.is_undo_possible() {
                break;
            }
            let n = Self::unit_len(&self.txns);
            let unit = self.txns.split_off(self.txns.len() - n);
            for txn in unit.iter().rev() {
                changes.extend(txn.changes.iter().rev().map(Change::invert));
            }
            // last reversed unit sits on top, in commit order
            self.redo.extend(unit);
        }
        self.finish_undo_redo(TxnAction::Reverse);
        Ok(changes)
    }

    /// Reverse every reversible txn.
    pub fn reverse_all(&mut self) -> Result<Vec<Change>> {
        self.reverse_txns(usize::MAX)
    }

    /// Reverse txns until `txn_id` is the first reversed one.
    pub fn reverse_to(&mut self, txn_id: TxnId) -> Result<Vec<Change>> {
        let position = self
            .txns
            .iter()
            .position(|t| t.id == txn_id)
            .ok_or(Error::UnknownTxn(txn_id))?;
        if self.txns[position..].iter().any(|t| t.merged) {
            return Err(Error::NothingToReverse);
        }
        let mut changes = Vec::new();
        while self.txns.len() > position {
            changes.extend(self.reverse_txns(1)?);
        }
        Ok(changes)
    }

    /// Reinstate the most recently reversed unit.
    pub fn reinstate_txn(&mut self) -> Result<Vec<Change>> {
        let n = Self::unit_len(&self.redo);
        if n == 0 {
            return Err(Error::NothingToReinstate);
        }
        let unit = self.redo.split_off(self.redo.len() - n);
        let changes = unit
            .iter()
            .flat_map(|t| t.changes.iter().cloned())
            .collect();
        self.txns.extend(unit);
        self.finish_undo_redo(TxnAction::Reinstate);
        Ok(changes)
    }

    fn finish_undo_redo(&mut self, action: TxnAction) {
        self.action = TxnAction::None;
        self.observers.notify(&TxnEvent::UndoRedo(action));
    }

    // ---- changesets ----

    /// A changeset was applied to the content.
    pub fn on_changes_applied(&mut self, option: ApplyOption) {
        self.observers.notify(&TxnEvent::ChangesApplied(option));
    }

    /// Replace local history with the rebased net changes of a merge.
    pub fn on_merged(&mut self, rebased: Vec<Change>) {
        self.action = TxnAction::Merge;
        let descriptions = self.describe_changeset(None);
        self.txns.clear();
        self.redo.clear();
        if !rebased.is_empty() {
            let id = self.next_txn_id;
            self.next_txn_id += 1;
            self.txns.push(Txn {
                id,
                description: descriptions.join("; "),
                changes: rebased,
                group: None,
                merged: true,
                merged_descriptions: descriptions,
            });
        }
        self.action = TxnAction::None;
    }

    /// Local history became a pushed changeset.
    pub fn on_pushed(&mut self) {
        self.txns.clear();
        self.redo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElementProps, ElementTable};
    use std::sync::{Arc, Mutex};

    fn element(id: &str, label: &str) -> ElementProps {
        ElementProps::new(id, "0x10", "Generic:PhysicalObject").with_user_label(label)
    }

    fn commit(txns: &mut TxnManager, table: &mut ElementTable, id: &str, label: &str, desc: &str) -> TxnId {
        let change = if table.contains(id) {
            table.update(element(id, label)).unwrap()
        } else {
            table.insert(element(id, label)).unwrap()
        };
        txns.on_commit();
        txns.check_commit().unwrap();
        txns.on_committed(desc, vec![change]).unwrap()
    }

    #[test]
    fn commits_are_ordered() {
        let mut txns = TxnManager::new();
        let mut table = ElementTable::new();
        let a = commit(&mut txns, &mut table, "0x20", "a", "first");
        let b = commit(&mut txns, &mut table, "0x21", "b", "second");
        assert!(a < b);
        assert_eq!(txns.first_txn_id(), Some(a));
        assert_eq!(txns.current_txn_id(), Some(b));
        assert!(txns.has_local_changes());
    }

    #[test]
    fn empty_commit_creates_no_txn() {
        let mut txns = TxnManager::new();
        txns.on_commit();
        assert_eq!(txns.on_committed("nothing", vec![]), None);
        assert!(!txns.has_local_changes());
    }

    #[test]
    fn fatal_validation_error_aborts_commit() {
        let mut txns = TxnManager::new();
        txns.on_commit();
        txns.report_error(ValidationError::warning("Style", "odd label"));
        assert!(!txns.has_fatal_error());
        txns.report_error(ValidationError::fatal("Dependency", "cycle").for_element("0x20"));
        assert!(txns.has_fatal_error());

        let err = txns.check_commit().unwrap_err();
        assert_eq!(err, Error::FatalValidationError("Dependency: cycle".into()));
        assert!(txns.validation_errors().is_empty());
    }

    #[test]
    fn describe_changeset_deduplicates() {
        let mut txns = TxnManager::new();
        let mut table = ElementTable::new();
        commit(&mut txns, &mut table, "0x20", "a", "add pump");
        let second = commit(&mut txns, &mut table, "0x21", "b", "add valve");
        commit(&mut txns, &mut table, "0x22", "c", "add pump");
        commit(&mut txns, &mut table, "0x23", "d", "add pipe");

        assert_eq!(
            txns.describe_changeset(None),
            vec!["add pump", "add valve", "add pipe"]
        );
        assert_eq!(txns.describe_changeset(Some(second)), vec!["add pump", "add valve"]);
    }

    #[test]
    fn reverse_then_reinstate_restores_content() {
        let mut txns = TxnManager::new();
        let mut table = ElementTable::new();
        commit(&mut txns, &mut table, "0x20", "a", "one");
        commit(&mut txns, &mut table, "0x20", "b", "two");
        let saved = table.to_json().unwrap();

        let undo = txns.reverse_txns(1).unwrap();
        table.apply_changes(&undo).unwrap();
        assert_eq!(table.get("0x20").unwrap().user_label.as_deref(), Some("a"));
        assert!(txns.is_redo_possible());

        let redo = txns.reinstate_txn().unwrap();
        table.apply_changes(&redo).unwrap();
        assert_eq!(table.to_json().unwrap(), saved);
        assert!(!txns.is_redo_possible());
    }

    #[test]
    fn groups_reverse_atomically() {
        let mut txns = TxnManager::new();
        let mut table = ElementTable::new();
        commit(&mut txns, &mut table, "0x20", "a", "before group");
        let before_group = table.to_json().unwrap();

        assert_eq!(txns.begin_multi_txn_operation(), 1);
        commit(&mut txns, &mut table, "0x21", "b", "g1");
        assert_eq!(txns.begin_multi_txn_operation(), 2);
        commit(&mut txns, &mut table, "0x22", "c", "g2");
        assert_eq!(txns.end_multi_txn_operation().unwrap(), 1);
        commit(&mut txns, &mut table, "0x21", "b2", "g3");
        assert_eq!(txns.end_multi_txn_operation().unwrap(), 0);
        assert!(txns.end_multi_txn_operation().is_err());
        let after_group = table.to_json().unwrap();

        let undo = txns.reverse_txns(1).unwrap();
        table.apply_changes(&undo).unwrap();
        assert_eq!(table.to_json().unwrap(), before_group);
        assert_eq!(txns.txns().len(), 1);

        let redo = txns.reinstate_txn().unwrap();
        table.apply_changes(&redo).unwrap();
        assert_eq!(table.to_json().unwrap(), after_group);
        assert_eq!(txns.txns().len(), 4);
    }

    #[test]
    fn new_commit_discards_redo() {
        let mut txns = TxnManager::new();
        let mut table = ElementTable::new();
        commit(&mut txns, &mut table, "0x20", "a", "one");
        let undo = txns.reverse_txns(1).unwrap();
        table.apply_changes(&undo).unwrap();
        commit(&mut txns, &mut table, "0x21", "b", "two");
        assert_eq!(txns.reinstate_txn().unwrap_err(), Error::NothingToReinstate);
    }

    #[test]
    fn reverse_to_and_bounds() {
        let mut txns = TxnManager::new();
        let mut table = ElementTable::new();
        assert_eq!(txns.reverse_txns(1).unwrap_err(), Error::NothingToReverse);

        let first = commit(&mut txns, &mut table, "0x20", "a", "one");
        commit(&mut txns, &mut table, "0x21", "b", "two");
        commit(&mut txns, &mut table, "0x22", "c", "three");

        let undo = txns.reverse_to(first).unwrap();
        table.apply_changes(&undo).unwrap();
        assert!(table.is_empty());
        assert!(!txns.has_local_changes());
        assert_eq!(txns.reverse_to(99).unwrap_err(), Error::UnknownTxn(99));
    }

    #[test]
    fn merge_collapses_history_and_blocks_undo() {
        let mut txns = TxnManager::new();
        let mut table = ElementTable::new();
        commit(&mut txns, &mut table, "0x20", "a", "one");
        commit(&mut txns, &mut table, "0x21", "b", "two");

        let rebased = txns.local_changes();
        txns.on_merged(rebased.clone());
        assert_eq!(txns.txns().len(), 1);
        assert_eq!(txns.local_changes(), rebased);
        assert!(!txns.is_undo_possible());
        assert_eq!(txns.reverse_txns(1).unwrap_err(), Error::NothingToReverse);
        assert_eq!(txns.describe_changeset(None), vec!["one", "two"]);

        // later commits stay reversible
        commit(&mut txns, &mut table, "0x22", "c", "three");
        assert!(txns.reverse_txns(5).is_ok());
        assert_eq!(txns.txns().len(), 1);

        txns.on_pushed();
        assert!(!txns.has_local_changes());
    }

    #[test]
    fn observers_see_lifecycle_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut txns = TxnManager::new();
        let mut table = ElementTable::new();
        let l = log.clone();
        let id = txns.subscribe(move |e| l.lock().unwrap().push(e.clone()));

        let txn = commit(&mut txns, &mut table, "0x20", "a", "one");
        txns.reverse_txns(1).unwrap();
        txns.on_changes_applied(ApplyOption::Merge);
        assert!(txns.unsubscribe(id));
        txns.on_abandoned();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                TxnEvent::BeforeCommit,
                TxnEvent::Committed(txn),
                TxnEvent::UndoRedo(TxnAction::Reverse),
                TxnEvent::ChangesApplied(ApplyOption::Merge),
            ]
        );
    }
}
