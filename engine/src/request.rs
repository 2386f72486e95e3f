//! Resource requests: the locks and codes a set of changes needs.

use crate::{Code, Lock, LockLevel};
use serde::{Deserialize, Serialize};

/// Locks and codes to acquire from the hub.
///
/// Locks are kept one per object at the highest level requested; codes are
/// kept once each and empty codes are never added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    pub locks: Vec<Lock>,
    pub codes: Vec<Code>,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty() && self.codes.is_empty()
    }

    /// Number of distinct resources requested.
    pub fn len(&self) -> usize {
        self.locks.len() + self.codes.len()
    }

    pub fn add_lock(&mut self, lock: Lock) {
        if lock.level == LockLevel::None {
            return;
        }
        match self.locks.iter_mut().find(|l| l.same_object(&lock)) {
            Some(existing) => existing.level = existing.level.max(lock.level),
            None => self.locks.push(lock),
        }
    }

    pub fn add_code(&mut self, code: Code) {
        if !code.is_empty() && !self.codes.contains(&code) {
            self.codes.push(code);
        }
    }

    /// Builder-style method to add a lock.
    pub fn with_lock(mut self, lock: Lock) -> Self {
        self.add_lock(lock);
        self
    }

    /// Builder-style method to add a code.
    pub fn with_code(mut self, code: Code) -> Self {
        self.add_code(code);
        self
    }

    /// Fold another request into this one.
    pub fn merge(&mut self, other: ResourceRequest) {
        for lock in other.locks {
            self.add_lock(lock);
        }
        for code in other.codes {
            self.add_code(code);
        }
    }

    /// Take everything out, leaving this request empty.
    pub fn extract(&mut self) -> ResourceRequest {
        std::mem::take(self)
    }

    /// Drop locks already covered by `held_locks` and codes in `held_codes`.
    pub fn remove_held(&mut self, held_locks: &[Lock], held_codes: &[Code]) {
        self.locks
            .retain(|lock| !held_locks.iter().any(|held| held.covers(lock)));
        self.codes.retain(|code| !held_codes.contains(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_collapse_to_highest_level() {
        let mut req = ResourceRequest::new();
        req.add_lock(Lock::element("0x20", LockLevel::Shared));
        req.add_lock(Lock::element("0x20", LockLevel::Exclusive));
        req.add_lock(Lock::element("0x20", LockLevel::Shared));
        req.add_lock(Lock::element("0x21", LockLevel::None));
        assert_eq!(req.locks, vec![Lock::element("0x20", LockLevel::Exclusive)]);
    }

    #[test]
    fn codes_are_deduplicated_and_empty_skipped() {
        let code = Code::new("0x1d", "0x1", "Pump-1");
        let req = ResourceRequest::new()
            .with_code(code.clone())
            .with_code(code.clone())
            .with_code(Code::empty());
        assert_eq!(req.codes, vec![code]);
        assert_eq!(req.len(), 1);
    }

    #[test]
    fn extract_empties_the_buffer() {
        let mut req = ResourceRequest::new().with_lock(Lock::model("0x10", LockLevel::Shared));
        let taken = req.extract();
        assert!(req.is_empty());
        assert_eq!(taken.locks.len(), 1);
    }

    #[test]
    fn remove_held_filters_covered_resources() {
        let code = Code::new("0x1d", "0x1", "Pump-1");
        let mut req = ResourceRequest::new()
            .with_lock(Lock::model("0x10", LockLevel::Shared))
            .with_lock(Lock::element("0x20", LockLevel::Exclusive))
            .with_code(code.clone());

        req.remove_held(
            &[
                Lock::model("0x10", LockLevel::Exclusive),
                Lock::element("0x20", LockLevel::Shared),
            ],
            &[code],
        );

        assert_eq!(req.locks, vec![Lock::element("0x20", LockLevel::Exclusive)]);
        assert!(req.codes.is_empty());
    }
}
