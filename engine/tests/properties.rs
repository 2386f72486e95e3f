//! Property tests for replay, locking and undo/redo.

use briefcase_engine::{
    BriefcaseId, Change, ChangeSet, ChangeSetToken, ConflictResolutionPolicy, ElementProps,
    ElementTable, Lock, LockLevel, LockTable, LockType, Merger, Timeline, TxnManager,
};
use proptest::prelude::*;

/// One scripted edit: (element slot, label). Label 0 on an existing element deletes it.
type Edit = (u8, u8);

fn arb_edits() -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec((0u8..6, 0u8..4), 1..40)
}

fn element_id(slot: u8) -> String {
    format!("0x2{:02x}", slot)
}

fn element(slot: u8, label: u8) -> ElementProps {
    ElementProps::new(element_id(slot), "0x10", "Generic:PhysicalObject")
        .with_user_label(format!("label-{}", label))
}

/// Apply one edit to a table, returning the change it made.
fn edit(table: &mut ElementTable, (slot, label): Edit) -> Change {
    let id = element_id(slot);
    if !table.contains(&id) {
        table.insert(element(slot, label)).unwrap()
    } else if label == 0 {
        table.delete(&id).unwrap()
    } else {
        table.update(element(slot, label)).unwrap()
    }
}

/// Split edits into changesets of `chunk` edits, squashed per element.
fn build_timeline(edits: &[Edit], chunk: usize) -> (ElementTable, Vec<ChangeSet>, Timeline) {
    let mut source = ElementTable::new();
    let mut changesets = Vec::new();
    let mut timeline = Timeline::new();
    for batch in edits.chunks(chunk) {
        let changes: Vec<Change> = batch.iter().map(|e| edit(&mut source, *e)).collect();
        let net = briefcase_engine::squash(&changes);
        let changeset = ChangeSet::new(timeline.tip_id(), net);
        let token = ChangeSetToken::for_push(
            &changeset,
            timeline.tip_index(),
            "batch",
            BriefcaseId::FIRST_VALID,
        );
        timeline.append(token).unwrap();
        changesets.push(changeset);
    }
    (source, changesets, timeline)
}

proptest! {
    #[test]
    fn prop_replay_is_deterministic(edits in arb_edits(), chunk in 1usize..6) {
        let (source, changesets, timeline) = build_timeline(&edits, chunk);
        prop_assert_eq!(timeline.len(), changesets.len());

        let mut a = ElementTable::new();
        let mut b = ElementTable::new();
        for changeset in &changesets {
            a.apply_changeset(changeset).unwrap();
            b.apply_changeset(changeset).unwrap();
        }

        prop_assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
        prop_assert_eq!(a.to_json().unwrap(), source.to_json().unwrap());
    }

    #[test]
    fn prop_reverse_all_returns_to_seed(edits in arb_edits(), chunk in 1usize..6) {
        let (_, changesets, _) = build_timeline(&edits, chunk);
        let mut table = ElementTable::new();
        for changeset in &changesets {
            table.apply_changeset(changeset).unwrap();
        }
        for changeset in changesets.iter().rev() {
            table
                .apply_changeset_with(changeset, briefcase_engine::ApplyOption::Reverse, "")
                .unwrap();
        }
        prop_assert!(table.is_empty());
    }

    #[test]
    fn prop_exclusive_lock_has_single_holder(
        requests in prop::collection::vec((2u32..6, 0u8..3, prop::bool::ANY), 1..60)
    ) {
        let mut table = LockTable::new();
        for (bid, object, exclusive) in requests {
            let level = if exclusive { LockLevel::Exclusive } else { LockLevel::Shared };
            let lock = Lock::element(format!("0x{}", object), level);
            let _ = table.acquire(BriefcaseId::new(bid), &lock);

            for object in 0u8..3 {
                let id = format!("0x{}", object);
                let levels: Vec<LockLevel> = (2u32..6)
                    .map(|b| table.level_held(BriefcaseId::new(b), LockType::Element, &id))
                    .filter(|l| *l != LockLevel::None)
                    .collect();
                if levels.contains(&LockLevel::Exclusive) {
                    prop_assert_eq!(levels.len(), 1);
                }
            }
        }
    }

    #[test]
    fn prop_reverse_then_reinstate_is_identity(
        edits in arb_edits(),
        group_from in 0usize..40,
    ) {
        let mut table = ElementTable::new();
        let mut txns = TxnManager::new();
        for (i, e) in edits.iter().enumerate() {
            if i == group_from {
                txns.begin_multi_txn_operation();
            }
            let change = edit(&mut table, *e);
            txns.on_commit();
            txns.on_committed(format!("edit {}", i), vec![change]);
        }
        if txns.multi_txn_depth() > 0 {
            txns.end_multi_txn_operation().unwrap();
        }
        let committed = table.to_json().unwrap();

        let undo = txns.reverse_txns(1).unwrap();
        table.apply_changes(&undo).unwrap();
        let redo = txns.reinstate_txn().unwrap();
        table.apply_changes(&redo).unwrap();

        prop_assert_eq!(table.to_json().unwrap(), committed);
    }

    #[test]
    fn prop_local_update_survives_default_merge(local in 1u8..4, incoming in 1u8..4) {
        let mut base = ElementTable::new();
        base.insert(element(0, 0)).unwrap();

        let mut mine = base.clone();
        let local_change = mine.update(element(0, local)).unwrap();
        let mut theirs = base.clone();
        let incoming_change = theirs.update(element(0, incoming)).unwrap();

        let outcome = Merger::new(ConflictResolutionPolicy::default())
            .merge(&[local_change], &[incoming_change])
            .unwrap();
        mine.apply_changes(&outcome.to_apply).unwrap();

        prop_assert_eq!(mine.get(&element_id(0)), Some(&element(0, local)));
    }
}
