//! ConcurrencyControl - client-side bookkeeping of locks and codes.
//!
//! Every mutation computes the locks and codes it needs and records them in a
//! pending [`ResourceRequest`]. What happens next depends on the policy:
//!
//! - Pessimistic: no bulk operation. Resources already held are filtered out
//!   as each mutation is recorded, and a save is refused while anything is
//!   still pending.
//! - Optimistic: a bulk operation is running. Usage is recorded without being
//!   enforced and reconciled with the hub at push time. The bulk operation is
//!   restarted after every commit, merge and undo/redo.
//!
//! Schema and code-spec locks bypass the buffer: they are always requested
//! immediately by the caller.

use crate::{
    error::Result, BriefcaseId, Code, ConcurrencyPolicy, ConflictResolutionPolicy, DbOpcode,
    ElementProps, Error, Lock, LockLevel, ModelProps, RelationshipProps, ResourceRequest,
};
use serde::{Deserialize, Serialize};

/// Whether resource usage is currently being captured in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BulkState {
    #[default]
    NotInBulk,
    InBulk,
}

/// Per-database lock and code bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyControl {
    policy: Option<ConcurrencyPolicy>,
    bulk: BulkState,
    pending: ResourceRequest,
    held_locks: Vec<Lock>,
    held_codes: Vec<Code>,
    briefcase_id: Option<BriefcaseId>,
}

impl ConcurrencyControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to an open briefcase. Requests can only be built while bound.
    pub fn bind(&mut self, briefcase_id: BriefcaseId) {
        self.briefcase_id = Some(briefcase_id);
    }

    /// Forget the briefcase along with everything pending or held.
    pub fn unbind(&mut self) {
        self.briefcase_id = None;
        self.pending = ResourceRequest::new();
        self.held_locks.clear();
        self.held_codes.clear();
        self.bulk = BulkState::NotInBulk;
    }

    pub fn briefcase_id(&self) -> Result<BriefcaseId> {
        self.briefcase_id.ok_or(Error::NoBriefcase)
    }

    pub fn policy(&self) -> Option<&ConcurrencyPolicy> {
        self.policy.as_ref()
    }

    pub fn is_pessimistic(&self) -> bool {
        self.policy.as_ref().map(|p| p.is_pessimistic()).unwrap_or(false)
    }

    /// Policy consulted when merging incoming changes.
    pub fn conflict_policy(&self) -> ConflictResolutionPolicy {
        self.policy
            .as_ref()
            .map(|p| p.conflict_policy())
            .unwrap_or_default()
    }

    pub fn bulk_state(&self) -> BulkState {
        self.bulk
    }

    /// Switch policy. Refused while there are unpushed local changes.
    pub fn set_policy(&mut self, policy: ConcurrencyPolicy, has_local_changes: bool) -> Result<()> {
        if has_local_changes && self.policy.as_ref() != Some(&policy) {
            return Err(Error::LocalChangesPresent);
        }
        self.policy = Some(policy);
        self.bulk = BulkState::NotInBulk;
        self.restart_bulk();
        Ok(())
    }

    fn restart_bulk(&mut self) {
        if matches!(self.policy, Some(ConcurrencyPolicy::Optimistic(_))) {
            self.bulk = BulkState::InBulk;
        }
    }

    fn record(&mut self, mut request: ResourceRequest) {
        if self.bulk == BulkState::NotInBulk {
            request.remove_held(&self.held_locks, &self.held_codes);
        }
        self.pending.merge(request);
    }

    /// Resources needed to insert, update or delete an element.
    ///
    /// `previous_code` is the code the element had before an update; a new
    /// code is only reserved when it changed.
    pub fn build_request_for_element(
        &mut self,
        element: &ElementProps,
        opcode: DbOpcode,
        previous_code: Option<&Code>,
    ) -> Result<ResourceRequest> {
        self.briefcase_id()?;
        let mut request = ResourceRequest::new();
        match opcode {
            DbOpcode::Insert => {
                request.add_lock(Lock::model(&element.model_id, LockLevel::Shared));
                request.add_code(element.code.clone());
            }
            DbOpcode::Update => {
                request.add_lock(Lock::element(&element.id, LockLevel::Exclusive));
                request.add_lock(Lock::model(&element.model_id, LockLevel::Shared));
                if previous_code != Some(&element.code) {
                    request.add_code(element.code.clone());
                }
            }
            DbOpcode::Delete => {
                request.add_lock(Lock::element(&element.id, LockLevel::Exclusive));
                request.add_lock(Lock::model(&element.model_id, LockLevel::Shared));
            }
        }
        self.record(request.clone());
        Ok(request)
    }

    /// Resources needed to insert, update or delete a model.
    pub fn build_request_for_model(
        &mut self,
        model: &ModelProps,
        opcode: DbOpcode,
    ) -> Result<ResourceRequest> {
        self.briefcase_id()?;
        let lock = match opcode {
            DbOpcode::Insert => Lock::repository(LockLevel::Shared),
            DbOpcode::Update | DbOpcode::Delete => Lock::model(&model.id, LockLevel::Exclusive),
        };
        let request = ResourceRequest::new().with_lock(lock);
        self.record(request.clone());
        Ok(request)
    }

    /// Resources needed to change a relationship between two elements.
    ///
    /// `source_model` and `target_model` are the models of its endpoints.
    pub fn build_request_for_relationship(
        &mut self,
        _relationship: &RelationshipProps,
        _opcode: DbOpcode,
        source_model: &str,
        target_model: &str,
    ) -> Result<ResourceRequest> {
        self.briefcase_id()?;
        let request = ResourceRequest::new()
            .with_lock(Lock::model(source_model, LockLevel::Shared))
            .with_lock(Lock::model(target_model, LockLevel::Shared));
        self.record(request.clone());
        Ok(request)
    }

    pub fn pending_request(&self) -> &ResourceRequest {
        &self.pending
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Take the pending request, minus anything already held.
    pub fn extract_pending(&mut self) -> ResourceRequest {
        let mut request = self.pending.extract();
        request.remove_held(&self.held_locks, &self.held_codes);
        request
    }

    /// Put back resources that could not be obtained.
    pub fn restore_pending(&mut self, request: ResourceRequest) {
        self.pending.merge(request);
    }

    /// Gate a save. Pessimistic saves need an empty pending buffer.
    pub fn on_save_changes(&self) -> Result<()> {
        if self.is_pessimistic() && !self.pending.is_empty() {
            return Err(Error::PendingRequests(self.pending.len()));
        }
        Ok(())
    }

    pub fn on_committed(&mut self) {
        self.restart_bulk();
    }

    pub fn on_merged(&mut self) {
        self.restart_bulk();
    }

    pub fn on_undo_redo(&mut self) {
        self.restart_bulk();
    }

    /// Unsaved changes were abandoned; so were the resources they needed.
    pub fn on_abandon(&mut self) {
        if self.is_pessimistic() {
            self.pending = ResourceRequest::new();
        }
    }

    /// Record resources the hub granted.
    pub fn mark_held(&mut self, locks: &[Lock], codes: &[Code]) {
        for lock in locks {
            match self.held_locks.iter_mut().find(|l| l.same_object(lock)) {
                Some(held) => held.level = held.level.max(lock.level),
                None => self.held_locks.push(lock.clone()),
            }
        }
        for code in codes {
            if !self.held_codes.contains(code) {
                self.held_codes.push(code.clone());
            }
        }
        self.pending.remove_held(&self.held_locks, &self.held_codes);
    }

    pub fn held_locks(&self) -> &[Lock] {
        &self.held_locks
    }

    pub fn held_codes(&self) -> &[Code] {
        &self.held_codes
    }

    /// A push released every lock and consumed every reserved code.
    pub fn on_pushed(&mut self) {
        self.held_locks.clear();
        self.held_codes.clear();
        self.pending = ResourceRequest::new();
        self.restart_bulk();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(policy: ConcurrencyPolicy) -> ConcurrencyControl {
        let mut cc = ConcurrencyControl::new();
        cc.bind(BriefcaseId::new(2));
        cc.set_policy(policy, false).unwrap();
        cc
    }

    fn pump() -> ElementProps {
        ElementProps::new("0x20", "0x10", "Generic:PhysicalObject")
            .with_code(Code::new("0x1d", "0x10", "Pump-1"))
    }

    #[test]
    fn unbound_requests_fail() {
        let mut cc = ConcurrencyControl::new();
        assert_eq!(
            cc.build_request_for_element(&pump(), DbOpcode::Insert, None)
                .unwrap_err(),
            Error::NoBriefcase
        );
    }

    #[test]
    fn insert_needs_shared_model_lock_and_code() {
        let mut cc = bound(ConcurrencyPolicy::Pessimistic);
        let req = cc
            .build_request_for_element(&pump(), DbOpcode::Insert, None)
            .unwrap();
        assert_eq!(req.locks, vec![Lock::model("0x10", LockLevel::Shared)]);
        assert_eq!(req.codes, vec![Code::new("0x1d", "0x10", "Pump-1")]);
        assert_eq!(cc.pending_request(), &req);
    }

    #[test]
    fn update_and_delete_need_exclusive_element_lock() {
        let mut cc = bound(ConcurrencyPolicy::Pessimistic);
        let element = pump();
        let update = cc
            .build_request_for_element(&element, DbOpcode::Update, Some(&element.code))
            .unwrap();
        assert!(update
            .locks
            .contains(&Lock::element("0x20", LockLevel::Exclusive)));
        assert!(update.codes.is_empty());

        let delete = cc
            .build_request_for_element(&element, DbOpcode::Delete, None)
            .unwrap();
        assert!(delete
            .locks
            .contains(&Lock::element("0x20", LockLevel::Exclusive)));
    }

    #[test]
    fn model_and_relationship_requests() {
        let mut cc = bound(ConcurrencyPolicy::Pessimistic);
        let model = ModelProps::new("0x10", "0x10", "Generic:PhysicalModel");
        let insert = cc.build_request_for_model(&model, DbOpcode::Insert).unwrap();
        assert_eq!(insert.locks, vec![Lock::repository(LockLevel::Shared)]);
        let delete = cc.build_request_for_model(&model, DbOpcode::Delete).unwrap();
        assert_eq!(delete.locks, vec![Lock::model("0x10", LockLevel::Exclusive)]);

        let rel = RelationshipProps::new("Generic:Connects", "0x20", "0x30");
        let req = cc
            .build_request_for_relationship(&rel, DbOpcode::Insert, "0x10", "0x11")
            .unwrap();
        assert_eq!(req.locks.len(), 2);
    }

    #[test]
    fn pessimistic_save_refused_until_resources_held() {
        let mut cc = bound(ConcurrencyPolicy::Pessimistic);
        assert_eq!(cc.bulk_state(), BulkState::NotInBulk);
        cc.build_request_for_element(&pump(), DbOpcode::Insert, None)
            .unwrap();
        assert_eq!(cc.on_save_changes().unwrap_err(), Error::PendingRequests(2));

        let request = cc.extract_pending();
        cc.mark_held(&request.locks, &request.codes);
        assert!(cc.on_save_changes().is_ok());

        // held resources are not requested again
        cc.build_request_for_element(&pump(), DbOpcode::Insert, None)
            .unwrap();
        assert!(!cc.has_pending_requests());
    }

    #[test]
    fn optimistic_records_without_enforcing() {
        let mut cc = bound(ConcurrencyPolicy::optimistic());
        assert_eq!(cc.bulk_state(), BulkState::InBulk);
        cc.build_request_for_element(&pump(), DbOpcode::Insert, None)
            .unwrap();
        assert!(cc.on_save_changes().is_ok());
        cc.on_committed();
        assert_eq!(cc.bulk_state(), BulkState::InBulk);
        assert!(cc.has_pending_requests());

        cc.on_pushed();
        assert!(!cc.has_pending_requests());
        assert!(cc.held_locks().is_empty());
    }

    #[test]
    fn policy_switch_refused_with_local_changes() {
        let mut cc = bound(ConcurrencyPolicy::optimistic());
        assert_eq!(
            cc.set_policy(ConcurrencyPolicy::Pessimistic, true)
                .unwrap_err(),
            Error::LocalChangesPresent
        );
        assert!(cc.set_policy(ConcurrencyPolicy::optimistic(), true).is_ok());
        assert!(cc.set_policy(ConcurrencyPolicy::Pessimistic, false).is_ok());
        assert_eq!(cc.bulk_state(), BulkState::NotInBulk);
        cc.on_undo_redo();
        assert_eq!(cc.bulk_state(), BulkState::NotInBulk);
    }

    #[test]
    fn mark_held_upgrades_and_clears_pending() {
        let mut cc = bound(ConcurrencyPolicy::Pessimistic);
        cc.mark_held(&[Lock::model("0x10", LockLevel::Shared)], &[]);
        cc.mark_held(&[Lock::model("0x10", LockLevel::Exclusive)], &[]);
        assert_eq!(cc.held_locks(), &[Lock::model("0x10", LockLevel::Exclusive)]);

        cc.unbind();
        assert!(cc.held_locks().is_empty());
        assert_eq!(cc.briefcase_id().unwrap_err(), Error::NoBriefcase);
    }
}
