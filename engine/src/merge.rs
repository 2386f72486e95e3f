//! Merging incoming changesets with local, not-yet-pushed changes.
//!
//! # Algorithm
//!
//! 1. Squash local txns into one net change per element
//! 2. For each incoming change, look up the local change to the same element
//! 3. No local change: apply the incoming change as is
//! 4. Otherwise classify the conflict and consult the [`ConflictResolutionPolicy`]
//! 5. Produce the changes to apply locally and the rebased local changes,
//!    which now describe the step from the new tip to the local state
//!
//! Resolution is decided per element, so one merge may accept some incoming
//! changes and reject others.

use crate::{error::Result, squash, Change, DbOpcode, ElementId, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What to do with an incoming change that conflicts with a local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Keep the local change
    RejectIncomingChange,
    /// Take the remote change, discarding the local one
    AcceptIncomingChange,
}

/// Resolution per kind of conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionPolicy {
    /// Local update meets incoming update
    pub update_vs_update: ConflictResolution,
    /// Local update meets incoming delete
    pub update_vs_delete: ConflictResolution,
    /// Local delete meets incoming update
    pub delete_vs_update: ConflictResolution,
}

impl Default for ConflictResolutionPolicy {
    fn default() -> Self {
        Self {
            update_vs_update: ConflictResolution::RejectIncomingChange,
            update_vs_delete: ConflictResolution::AcceptIncomingChange,
            delete_vs_update: ConflictResolution::RejectIncomingChange,
        }
    }
}

impl ConflictResolutionPolicy {
    pub fn resolution(&self, kind: ConflictKind) -> ConflictResolution {
        match kind {
            ConflictKind::UpdateVsUpdate => self.update_vs_update,
            ConflictKind::UpdateVsDelete => self.update_vs_delete,
            ConflictKind::DeleteVsUpdate => self.delete_vs_update,
        }
    }
}

/// Concurrency policy of one open database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConcurrencyPolicy {
    /// Locks and codes are acquired before changes are saved
    Pessimistic,
    /// Changes are saved freely; conflicts are resolved when merging
    Optimistic(ConflictResolutionPolicy),
}

impl ConcurrencyPolicy {
    pub fn optimistic() -> Self {
        ConcurrencyPolicy::Optimistic(ConflictResolutionPolicy::default())
    }

    pub fn is_pessimistic(&self) -> bool {
        matches!(self, ConcurrencyPolicy::Pessimistic)
    }

    /// The resolution policy used when merging.
    ///
    /// Pessimistic briefcases never see conflicts because locks prevent the
    /// colliding edit; if one does occur the documented defaults apply.
    pub fn conflict_policy(&self) -> ConflictResolutionPolicy {
        match self {
            ConcurrencyPolicy::Pessimistic => ConflictResolutionPolicy::default(),
            ConcurrencyPolicy::Optimistic(policy) => *policy,
        }
    }
}

/// Kind of conflict between a local and an incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    UpdateVsUpdate,
    UpdateVsDelete,
    DeleteVsUpdate,
}

/// A detected conflict and how it was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub element_id: ElementId,
    pub kind: ConflictKind,
    pub resolution: ConflictResolution,
    /// The local net change
    pub local: Change,
    /// The incoming change
    pub incoming: Change,
}

/// Result of merging one changeset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// Changes to apply to the local content, verified against it
    pub to_apply: Vec<Change>,
    /// Local net changes rebased onto the incoming changeset
    pub rebased_local: Vec<Change>,
    /// Incoming changes that were rejected
    pub rejected: Vec<ElementId>,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Applies a conflict resolution policy to one merge.
pub struct Merger {
    policy: ConflictResolutionPolicy,
}

impl Merger {
    pub fn new(policy: ConflictResolutionPolicy) -> Self {
        Self { policy }
    }

    /// Merge incoming changes with local pending changes.
    pub fn merge(&self, local: &[Change], incoming: &[Change]) -> Result<MergeOutcome> {
        let local = squash(local);
        let mut pending: HashMap<&str, &Change> =
            local.iter().map(|c| (c.element_id.as_str(), c)).collect();
        let mut rebased: HashMap<ElementId, Option<Change>> = HashMap::new();
        let mut outcome = MergeOutcome::default();

        for theirs in squash(incoming) {
            let Some(mine) = pending.remove(theirs.element_id.as_str()) else {
                outcome.to_apply.push(theirs);
                continue;
            };

            let Some(kind) = classify(mine, &theirs)? else {
                // Both sides deleted the element; nothing left to do locally.
                rebased.insert(mine.element_id.clone(), None);
                continue;
            };
            let resolution = self.policy.resolution(kind);

            match resolution {
                ConflictResolution::RejectIncomingChange => {
                    outcome.rejected.push(theirs.element_id.clone());
                    rebased.insert(mine.element_id.clone(), rebase_onto(mine, &theirs));
                }
                ConflictResolution::AcceptIncomingChange => {
                    // Move the local row straight to the incoming after image.
                    if let Some(change) = rebase_onto(&theirs, mine) {
                        outcome.to_apply.push(change);
                    }
                    rebased.insert(mine.element_id.clone(), None);
                }
            }

            outcome.conflicts.push(Conflict {
                element_id: theirs.element_id.clone(),
                kind,
                resolution,
                local: mine.clone(),
                incoming: theirs,
            });
        }

        outcome.rebased_local = local
            .iter()
            .filter_map(|c| match rebased.remove(&c.element_id) {
                Some(replacement) => replacement,
                None => Some(c.clone()),
            })
            .collect();

        Ok(outcome)
    }
}

/// Classify the conflict between a local and an incoming change to one element.
///
/// Returns `None` when both sides deleted it. Two inserts of the same id are
/// treated as concurrent updates.
fn classify(local: &Change, incoming: &Change) -> Result<Option<ConflictKind>> {
    use DbOpcode::*;
    let kind = match (local.opcode, incoming.opcode) {
        (Delete, Delete) => return Ok(None),
        (Update, Update) | (Insert, Insert) => ConflictKind::UpdateVsUpdate,
        (Update, Delete) => ConflictKind::UpdateVsDelete,
        (Delete, Update) => ConflictKind::DeleteVsUpdate,
        (l, i) => {
            return Err(Error::InvalidChange {
                element_id: local.element_id.clone(),
                reason: format!("local {:?} cannot meet incoming {:?}", l, i),
            })
        }
    };
    Ok(Some(kind))
}

/// The change that takes `onto`'s after image to `change`'s after image.
fn rebase_onto(change: &Change, onto: &Change) -> Option<Change> {
    let before = onto.after.clone();
    let after = change.after.clone();
    match (before, after) {
        (None, None) => None,
        (Some(b), Some(a)) if a == b => None,
        (None, Some(a)) => Some(Change::insert(a)),
        (Some(b), None) => Some(Change::delete(b)),
        (Some(b), Some(a)) => Some(Change::update(b, a)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElementProps, ElementTable};

    fn element(id: &str, label: &str) -> ElementProps {
        ElementProps::new(id, "0x10", "Generic:PhysicalObject").with_user_label(label)
    }

    fn label(table: &ElementTable, id: &str) -> Option<String> {
        table.get(id).and_then(|e| e.user_label.clone())
    }

    /// Base content has element 0x20 labelled "X".
    fn base() -> ElementTable {
        let mut t = ElementTable::new();
        t.insert(element("0x20", "X")).unwrap();
        t
    }

    #[test]
    fn default_policy_matches_documented_triple() {
        let policy = ConflictResolutionPolicy::default();
        assert_eq!(policy.update_vs_update, ConflictResolution::RejectIncomingChange);
        assert_eq!(policy.update_vs_delete, ConflictResolution::AcceptIncomingChange);
        assert_eq!(policy.delete_vs_update, ConflictResolution::RejectIncomingChange);
    }

    #[test]
    fn non_conflicting_changes_apply() {
        let mut local_table = base();
        let local = vec![local_table.insert(element("0x30", "mine")).unwrap()];
        let incoming = vec![Change::insert(element("0x31", "theirs"))];

        let outcome = Merger::new(Default::default()).merge(&local, &incoming).unwrap();
        assert!(!outcome.has_conflicts());
        assert_eq!(outcome.to_apply, incoming);
        assert_eq!(outcome.rebased_local, local);

        local_table.apply_changes(&outcome.to_apply).unwrap();
        assert_eq!(local_table.len(), 3);
    }

    #[test]
    fn update_vs_update_reject_keeps_local() {
        let mut local_table = base();
        let local = vec![local_table.update(element("0x20", "X->A")).unwrap()];
        let incoming = vec![Change::update(element("0x20", "X"), element("0x20", "X->B"))];

        let outcome = Merger::new(Default::default()).merge(&local, &incoming).unwrap();
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::UpdateVsUpdate);
        assert_eq!(outcome.rejected, vec!["0x20".to_string()]);
        assert!(outcome.to_apply.is_empty());

        local_table.apply_changes(&outcome.to_apply).unwrap();
        assert_eq!(label(&local_table, "0x20").as_deref(), Some("X->A"));

        // The rebased change now leads from the incoming state to ours.
        assert_eq!(
            outcome.rebased_local,
            vec![Change::update(element("0x20", "X->B"), element("0x20", "X->A"))]
        );

        // Replaying incoming then rebased on a clean copy converges.
        let mut remote = base();
        remote.apply_changes(&incoming).unwrap();
        remote.apply_changes(&outcome.rebased_local).unwrap();
        assert_eq!(remote.to_json().unwrap(), local_table.to_json().unwrap());
    }

    #[test]
    fn update_vs_update_accept_takes_remote() {
        let mut local_table = base();
        let local = vec![local_table.update(element("0x20", "X->A")).unwrap()];
        let incoming = vec![Change::update(element("0x20", "X"), element("0x20", "X->B"))];
        let policy = ConflictResolutionPolicy {
            update_vs_update: ConflictResolution::AcceptIncomingChange,
            ..Default::default()
        };

        let outcome = Merger::new(policy).merge(&local, &incoming).unwrap();
        local_table.apply_changes(&outcome.to_apply).unwrap();
        assert_eq!(label(&local_table, "0x20").as_deref(), Some("X->B"));
        assert!(outcome.rebased_local.is_empty());
    }

    #[test]
    fn update_vs_delete_accepts_delete_by_default() {
        let mut local_table = base();
        let local = vec![local_table.update(element("0x20", "X->A")).unwrap()];
        let incoming = vec![Change::delete(element("0x20", "X"))];

        let outcome = Merger::new(Default::default()).merge(&local, &incoming).unwrap();
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::UpdateVsDelete);
        local_table.apply_changes(&outcome.to_apply).unwrap();
        assert!(!local_table.contains("0x20"));
        assert!(outcome.rebased_local.is_empty());
    }

    #[test]
    fn update_vs_delete_reject_reinserts() {
        let mut local_table = base();
        let local = vec![local_table.update(element("0x20", "X->A")).unwrap()];
        let incoming = vec![Change::delete(element("0x20", "X"))];
        let policy = ConflictResolutionPolicy {
            update_vs_delete: ConflictResolution::RejectIncomingChange,
            ..Default::default()
        };

        let outcome = Merger::new(policy).merge(&local, &incoming).unwrap();
        local_table.apply_changes(&outcome.to_apply).unwrap();
        assert_eq!(label(&local_table, "0x20").as_deref(), Some("X->A"));
        assert_eq!(
            outcome.rebased_local,
            vec![Change::insert(element("0x20", "X->A"))]
        );
    }

    #[test]
    fn delete_vs_update_rejects_by_default() {
        let mut local_table = base();
        let local = vec![local_table.delete("0x20").unwrap()];
        let incoming = vec![Change::update(element("0x20", "X"), element("0x20", "X->B"))];

        let outcome = Merger::new(Default::default()).merge(&local, &incoming).unwrap();
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::DeleteVsUpdate);
        local_table.apply_changes(&outcome.to_apply).unwrap();
        assert!(!local_table.contains("0x20"));
        assert_eq!(
            outcome.rebased_local,
            vec![Change::delete(element("0x20", "X->B"))]
        );
    }

    #[test]
    fn delete_vs_update_accept_restores_element() {
        let mut local_table = base();
        let local = vec![local_table.delete("0x20").unwrap()];
        let incoming = vec![Change::update(element("0x20", "X"), element("0x20", "X->B"))];
        let policy = ConflictResolutionPolicy {
            delete_vs_update: ConflictResolution::AcceptIncomingChange,
            ..Default::default()
        };

        let outcome = Merger::new(policy).merge(&local, &incoming).unwrap();
        local_table.apply_changes(&outcome.to_apply).unwrap();
        assert_eq!(label(&local_table, "0x20").as_deref(), Some("X->B"));
    }

    #[test]
    fn delete_vs_delete_is_not_a_conflict() {
        let mut local_table = base();
        let local = vec![local_table.delete("0x20").unwrap()];
        let incoming = vec![Change::delete(element("0x20", "X"))];

        let outcome = Merger::new(Default::default()).merge(&local, &incoming).unwrap();
        assert!(!outcome.has_conflicts());
        assert!(outcome.to_apply.is_empty());
        assert!(outcome.rebased_local.is_empty());
        local_table.apply_changes(&outcome.to_apply).unwrap();
    }

    #[test]
    fn resolution_is_per_element() {
        let mut local_table = base();
        local_table.insert(element("0x21", "Y")).unwrap();
        let mut remote = local_table.clone();

        let local = vec![
            local_table.update(element("0x20", "X->A")).unwrap(),
            local_table.update(element("0x21", "Y->A")).unwrap(),
        ];
        let incoming = vec![
            remote.update(element("0x20", "X->B")).unwrap(),
            remote.delete("0x21").unwrap(),
        ];

        let outcome = Merger::new(Default::default()).merge(&local, &incoming).unwrap();
        assert_eq!(outcome.conflicts.len(), 2);
        local_table.apply_changes(&outcome.to_apply).unwrap();
        // update-vs-update rejected incoming, update-vs-delete accepted it
        assert_eq!(label(&local_table, "0x20").as_deref(), Some("X->A"));
        assert!(!local_table.contains("0x21"));
    }

    #[test]
    fn impossible_combination_is_an_error() {
        let local = vec![Change::insert(element("0x20", "new"))];
        let incoming = vec![Change::delete(element("0x20", "X"))];
        assert!(Merger::new(Default::default()).merge(&local, &incoming).is_err());
    }
}
