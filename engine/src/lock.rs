//! Locks over elements, models, schemas and the repository.
//!
//! Any number of briefcases may hold a `Shared` lock on the same object, but
//! an `Exclusive` lock excludes every other holder. The [`LockTable`] is the
//! hub-side arbiter of that rule.

use crate::{error::Result, BriefcaseId, Error, REPOSITORY_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Level a lock is held at. Ordered: `None < Shared < Exclusive`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum LockLevel {
    #[default]
    None,
    Shared,
    Exclusive,
}

/// Kind of object a lock guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LockType {
    /// The whole repository
    Db,
    Model,
    Element,
    /// All schemas of the iModel
    Schemas,
    /// All code specs of the iModel
    CodeSpecs,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Db => write!(f, "Db"),
            LockType::Model => write!(f, "Model"),
            LockType::Element => write!(f, "Element"),
            LockType::Schemas => write!(f, "Schemas"),
            LockType::CodeSpecs => write!(f, "CodeSpecs"),
        }
    }
}

/// A lock on one object at one level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub lock_type: LockType,
    pub object_id: String,
    pub level: LockLevel,
}

impl Lock {
    pub fn new(lock_type: LockType, object_id: impl Into<String>, level: LockLevel) -> Self {
        Self {
            lock_type,
            object_id: object_id.into(),
            level,
        }
    }

    pub fn element(id: impl Into<String>, level: LockLevel) -> Self {
        Self::new(LockType::Element, id, level)
    }

    pub fn model(id: impl Into<String>, level: LockLevel) -> Self {
        Self::new(LockType::Model, id, level)
    }

    pub fn repository(level: LockLevel) -> Self {
        Self::new(LockType::Db, REPOSITORY_ID, level)
    }

    /// The exclusive lock required before importing schemas.
    pub fn schemas() -> Self {
        Self::new(LockType::Schemas, REPOSITORY_ID, LockLevel::Exclusive)
    }

    /// The exclusive lock required before editing code specs.
    pub fn code_specs() -> Self {
        Self::new(LockType::CodeSpecs, REPOSITORY_ID, LockLevel::Exclusive)
    }

    /// Whether this lock targets the same object as another.
    pub fn same_object(&self, other: &Lock) -> bool {
        self.lock_type == other.lock_type && self.object_id == other.object_id
    }

    /// Whether holding `self` satisfies a need for `other`.
    pub fn covers(&self, other: &Lock) -> bool {
        self.same_object(other) && self.level >= other.level
    }

    fn key(&self) -> (LockType, String) {
        (self.lock_type, self.object_id.clone())
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} lock on {} {}", self.level, self.lock_type, self.object_id)
    }
}

/// Hub-side table of lock holders for one iModel.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    holders: BTreeMap<(LockType, String), BTreeMap<BriefcaseId, LockLevel>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level at which a briefcase holds a lock on an object.
    pub fn level_held(&self, briefcase_id: BriefcaseId, lock_type: LockType, object_id: &str) -> LockLevel {
        self.holders
            .get(&(lock_type, object_id.to_string()))
            .and_then(|h| h.get(&briefcase_id))
            .copied()
            .unwrap_or(LockLevel::None)
    }

    /// Acquire (or upgrade to) a lock for a briefcase.
    ///
    /// A request at or below the level already held succeeds without change.
    pub fn acquire(&mut self, briefcase_id: BriefcaseId, lock: &Lock) -> Result<()> {
        if lock.level == LockLevel::None {
            return Ok(());
        }
        let holders = self.holders.entry(lock.key()).or_default();

        let conflicting = holders.iter().find(|(owner, level)| {
            **owner != briefcase_id
                && (lock.level == LockLevel::Exclusive || **level == LockLevel::Exclusive)
        });
        if let Some((owner, _)) = conflicting {
            return Err(Error::LockOwnedByAnotherBriefcase {
                lock: lock.to_string(),
                owner: *owner,
            });
        }

        let held = holders.entry(briefcase_id).or_insert(LockLevel::None);
        *held = (*held).max(lock.level);
        Ok(())
    }

    /// Acquire a batch, granting what is compatible.
    ///
    /// Returns each denied lock with the briefcase that blocks it.
    pub fn acquire_all(&mut self, briefcase_id: BriefcaseId, locks: &[Lock]) -> Vec<(Lock, BriefcaseId)> {
        let mut denied = Vec::new();
        for lock in locks {
            if let Err(Error::LockOwnedByAnotherBriefcase { owner, .. }) = self.acquire(briefcase_id, lock) {
                denied.push((lock.clone(), owner));
            }
        }
        denied
    }

    /// All locks held by a briefcase, in deterministic order.
    pub fn held_by(&self, briefcase_id: BriefcaseId) -> Vec<Lock> {
        self.holders
            .iter()
            .filter_map(|((lock_type, object_id), holders)| {
                holders
                    .get(&briefcase_id)
                    .map(|level| Lock::new(*lock_type, object_id.clone(), *level))
            })
            .collect()
    }

    /// Release every lock a briefcase holds. Returns how many were released.
    pub fn release_all(&mut self, briefcase_id: BriefcaseId) -> usize {
        let mut released = 0;
        for holders in self.holders.values_mut() {
            if holders.remove(&briefcase_id).is_some() {
                released += 1;
            }
        }
        self.holders.retain(|_, h| !h.is_empty());
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: BriefcaseId = BriefcaseId(2);
    const B: BriefcaseId = BriefcaseId(3);

    #[test]
    fn level_ordering() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Exclusive);
    }

    #[test]
    fn shared_locks_coexist() {
        let mut table = LockTable::new();
        table.acquire(A, &Lock::model("0x10", LockLevel::Shared)).unwrap();
        table.acquire(B, &Lock::model("0x10", LockLevel::Shared)).unwrap();
        assert_eq!(table.level_held(A, LockType::Model, "0x10"), LockLevel::Shared);
        assert_eq!(table.level_held(B, LockType::Model, "0x10"), LockLevel::Shared);
    }

    #[test]
    fn exclusive_excludes_everyone_else() {
        let mut table = LockTable::new();
        table.acquire(A, &Lock::element("0x20", LockLevel::Exclusive)).unwrap();

        let err = table.acquire(B, &Lock::element("0x20", LockLevel::Shared)).unwrap_err();
        assert!(matches!(err, Error::LockOwnedByAnotherBriefcase { owner, .. } if owner == A));
        assert!(table.acquire(B, &Lock::element("0x20", LockLevel::Exclusive)).is_err());

        table.release_all(A);
        table.acquire(B, &Lock::element("0x20", LockLevel::Exclusive)).unwrap();
    }

    #[test]
    fn upgrade_requires_sole_holder() {
        let mut table = LockTable::new();
        table.acquire(A, &Lock::model("0x10", LockLevel::Shared)).unwrap();
        table.acquire(A, &Lock::model("0x10", LockLevel::Exclusive)).unwrap();
        assert_eq!(table.level_held(A, LockType::Model, "0x10"), LockLevel::Exclusive);

        let mut table = LockTable::new();
        table.acquire(A, &Lock::model("0x10", LockLevel::Shared)).unwrap();
        table.acquire(B, &Lock::model("0x10", LockLevel::Shared)).unwrap();
        assert!(table.acquire(A, &Lock::model("0x10", LockLevel::Exclusive)).is_err());
    }

    #[test]
    fn lower_request_does_not_downgrade() {
        let mut table = LockTable::new();
        table.acquire(A, &Lock::element("0x20", LockLevel::Exclusive)).unwrap();
        table.acquire(A, &Lock::element("0x20", LockLevel::Shared)).unwrap();
        assert_eq!(table.level_held(A, LockType::Element, "0x20"), LockLevel::Exclusive);
    }

    #[test]
    fn acquire_all_grants_compatible_subset() {
        let mut table = LockTable::new();
        table.acquire(A, &Lock::element("0x20", LockLevel::Exclusive)).unwrap();

        let denied = table.acquire_all(
            B,
            &[
                Lock::element("0x20", LockLevel::Exclusive),
                Lock::element("0x21", LockLevel::Exclusive),
            ],
        );
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].1, A);
        assert_eq!(table.held_by(B), vec![Lock::element("0x21", LockLevel::Exclusive)]);
    }

    #[test]
    fn covers_respects_level() {
        let held = Lock::element("0x20", LockLevel::Exclusive);
        assert!(held.covers(&Lock::element("0x20", LockLevel::Shared)));
        assert!(!Lock::element("0x20", LockLevel::Shared).covers(&held));
        assert!(!held.covers(&Lock::model("0x20", LockLevel::Shared)));
    }
}
