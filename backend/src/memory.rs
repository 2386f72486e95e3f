//! In-process hub.
//!
//! Holds every iModel's timeline, lock table and code registry in memory.
//! Each iModel is guarded by its own async mutex, which makes a push a
//! critical section per iModel: only the pusher at the current tip wins.
//!
//! Faults can be injected for tests: queued push failures are returned by
//! the next uploads, lock releases can be made to fail, and downloads can be
//! slowed down.

use crate::hub::{
    AuthorizedContext, ChangeSetPosition, ChangeSetQuery, DeniedLocks, HubClient, HubError,
    IModelInfo, IModelVersion,
};
use async_trait::async_trait;
use briefcase_engine::{
    BriefcaseId, ChangeSet, ChangeSetId, ChangeSetToken, Code, CodeRegistry, IModelId, Lock,
    LockTable, Timeline,
};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Hub-side state of one iModel.
#[derive(Debug)]
struct IModelState {
    info: IModelInfo,
    timeline: Timeline,
    changesets: HashMap<ChangeSetId, ChangeSet>,
    locks: LockTable,
    codes: CodeRegistry,
    briefcases: BTreeSet<BriefcaseId>,
    next_briefcase_id: u32,
    named_versions: BTreeMap<String, ChangeSetId>,
}

impl IModelState {
    fn new(info: IModelInfo) -> Self {
        Self {
            info,
            timeline: Timeline::new(),
            changesets: HashMap::new(),
            locks: LockTable::new(),
            codes: CodeRegistry::new(),
            briefcases: BTreeSet::new(),
            next_briefcase_id: BriefcaseId::FIRST_VALID.value(),
            named_versions: BTreeMap::new(),
        }
    }

    fn position_of(&self, changeset_id: &str) -> Result<ChangeSetPosition, HubError> {
        self.timeline
            .index_of(changeset_id)
            .map(|index| ChangeSetPosition::new(changeset_id, index))
            .ok_or_else(|| HubError::NotFound(format!("changeset {}", changeset_id)))
    }

    fn ensure_checked_out(&self, briefcase_id: BriefcaseId) -> Result<(), HubError> {
        if !self.briefcases.contains(&briefcase_id) {
            return Err(HubError::NotFound(format!("briefcase {}", briefcase_id)));
        }
        Ok(())
    }
}

/// A hub that lives in the current process.
#[derive(Debug, Default)]
pub struct InMemoryHub {
    imodels: DashMap<IModelId, Arc<AsyncMutex<IModelState>>>,
    push_failures: Mutex<VecDeque<HubError>>,
    release_failures: Mutex<VecDeque<HubError>>,
    download_delay: Mutex<Option<Duration>>,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
    briefcases_acquired: AtomicUsize,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new hub wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next upload fail with `error` instead of reaching the timeline.
    pub fn inject_push_failure(&self, error: HubError) {
        if let Ok(mut failures) = self.push_failures.lock() {
            failures.push_back(error);
        }
    }

    /// Make the next lock release fail with `error`, leaving the locks held.
    pub fn inject_release_failure(&self, error: HubError) {
        if let Ok(mut failures) = self.release_failures.lock() {
            failures.push_back(error);
        }
    }

    /// Delay every changeset download.
    pub fn set_download_delay(&self, delay: Option<Duration>) {
        if let Ok(mut current) = self.download_delay.lock() {
            *current = delay;
        }
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn briefcases_acquired(&self) -> usize {
        self.briefcases_acquired.load(Ordering::SeqCst)
    }

    /// Tip of an iModel's timeline.
    pub async fn tip(&self, imodel_id: &str) -> Option<ChangeSetPosition> {
        let state = self.state(imodel_id).ok()?;
        let state = state.lock().await;
        Some(ChangeSetPosition::new(
            state.timeline.tip_id(),
            state.timeline.tip_index(),
        ))
    }

    fn state(&self, imodel_id: &str) -> Result<Arc<AsyncMutex<IModelState>>, HubError> {
        self.imodels
            .get(imodel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HubError::NotFound(format!("iModel {}", imodel_id)))
    }

    fn take_push_failure(&self) -> Option<HubError> {
        self.push_failures.lock().ok().and_then(|mut f| f.pop_front())
    }

    fn current_download_delay(&self) -> Option<Duration> {
        self.download_delay.lock().ok().and_then(|d| *d)
    }
}

#[async_trait]
impl HubClient for InMemoryHub {
    async fn get_imodel(
        &self,
        ctx: &AuthorizedContext,
        context_id: &str,
        imodel_id: &str,
    ) -> Result<IModelInfo, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let state = state.lock().await;
        if state.info.context_id != context_id {
            return Err(HubError::NotFound(format!(
                "iModel {} in context {}",
                imodel_id, context_id
            )));
        }
        Ok(state.info.clone())
    }

    async fn create_imodel(
        &self,
        ctx: &AuthorizedContext,
        context_id: &str,
        name: &str,
        description: &str,
    ) -> Result<IModelInfo, HubError> {
        ctx.validate()?;
        let info = IModelInfo {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
        };
        self.imodels.insert(
            info.id.clone(),
            Arc::new(AsyncMutex::new(IModelState::new(info.clone()))),
        );
        tracing::info!(imodel_id = %info.id, name, "Created iModel");
        Ok(info)
    }

    async fn acquire_briefcase(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
    ) -> Result<BriefcaseId, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let mut state = state.lock().await;
        let id = BriefcaseId::new(state.next_briefcase_id);
        state.next_briefcase_id += 1;
        state.briefcases.insert(id);
        self.briefcases_acquired.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(imodel_id, briefcase_id = %id, "Acquired briefcase");
        Ok(id)
    }

    async fn release_briefcase(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<(), HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let mut state = state.lock().await;
        state.ensure_checked_out(briefcase_id)?;
        state.briefcases.remove(&briefcase_id);
        state.locks.release_all(briefcase_id);
        state.codes.release(briefcase_id);
        tracing::debug!(imodel_id, briefcase_id = %briefcase_id, "Released briefcase");
        Ok(())
    }

    async fn get_changesets(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        query: ChangeSetQuery,
    ) -> Result<Vec<ChangeSetToken>, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let state = state.lock().await;
        Ok(state
            .timeline
            .iter()
            .filter(|t| query.matches(t.index))
            .cloned()
            .collect())
    }

    async fn download_changeset(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        token: &ChangeSetToken,
    ) -> Result<ChangeSet, HubError> {
        ctx.validate()?;
        if let Some(delay) = self.current_download_delay() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state(imodel_id)?;
        let state = state.lock().await;
        let changeset = state
            .changesets
            .get(&token.id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("changeset {}", token.id)))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(changeset)
    }

    async fn upload_changeset(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        token: ChangeSetToken,
        changeset: ChangeSet,
    ) -> Result<ChangeSetToken, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let mut state = state.lock().await;
        state.ensure_checked_out(token.briefcase_id)?;

        if let Some(failure) = self.take_push_failure() {
            tracing::debug!(imodel_id, error = %failure, "Injected push failure");
            return Err(failure);
        }
        if state.changesets.contains_key(&token.id) {
            return Err(HubError::ChangeSetAlreadyExists(token.id));
        }
        if token.parent_id != state.timeline.tip_id() || token.index != state.timeline.tip_index() + 1 {
            return Err(HubError::PullIsRequired);
        }
        if changeset.compute_id() != token.id {
            return Err(HubError::Network(format!(
                "changeset content does not match id {}",
                token.id
            )));
        }

        let mut accepted = token;
        accepted.push_date = Some(Utc::now().timestamp_millis().max(0) as u64);
        state
            .timeline
            .append(accepted.clone())
            .map_err(|_| HubError::PullIsRequired)?;
        state.changesets.insert(accepted.id.clone(), changeset);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            imodel_id,
            changeset_id = %accepted.id,
            index = accepted.index,
            briefcase_id = %accepted.briefcase_id,
            "Accepted changeset"
        );
        Ok(accepted)
    }

    async fn resolve_version(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        version: &IModelVersion,
    ) -> Result<ChangeSetPosition, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let state = state.lock().await;
        match version {
            IModelVersion::First => Ok(ChangeSetPosition::seed()),
            IModelVersion::Latest => Ok(ChangeSetPosition::new(
                state.timeline.tip_id(),
                state.timeline.tip_index(),
            )),
            IModelVersion::AsOfChangeSet(id) => state.position_of(id),
            IModelVersion::Named(name) => {
                let id = state
                    .named_versions
                    .get(name)
                    .ok_or_else(|| HubError::NotFound(format!("named version {}", name)))?;
                state.position_of(id)
            }
        }
    }

    async fn create_named_version(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        name: &str,
        changeset_id: &str,
    ) -> Result<(), HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let mut state = state.lock().await;
        state.position_of(changeset_id)?;
        state
            .named_versions
            .insert(name.to_string(), changeset_id.to_string());
        Ok(())
    }

    async fn query_locks(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<Vec<Lock>, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let state = state.lock().await;
        Ok(state.locks.held_by(briefcase_id))
    }

    async fn acquire_locks(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        locks: &[Lock],
    ) -> Result<DeniedLocks, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let mut state = state.lock().await;
        state.ensure_checked_out(briefcase_id)?;
        Ok(state.locks.acquire_all(briefcase_id, locks))
    }

    async fn release_locks(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<(), HubError> {
        ctx.validate()?;
        if let Some(error) = self.release_failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(error);
        }
        let state = self.state(imodel_id)?;
        let mut state = state.lock().await;
        state.locks.release_all(briefcase_id);
        Ok(())
    }

    async fn query_codes(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<Vec<Code>, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let state = state.lock().await;
        Ok(state.codes.reserved_by(briefcase_id))
    }

    async fn reserve_codes(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        codes: &[Code],
    ) -> Result<Vec<Code>, HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let mut state = state.lock().await;
        state.ensure_checked_out(briefcase_id)?;
        Ok(state.codes.reserve_all(briefcase_id, codes))
    }

    async fn mark_codes_used(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        codes: &[Code],
    ) -> Result<(), HubError> {
        ctx.validate()?;
        let state = self.state(imodel_id)?;
        let mut state = state.lock().await;
        state.codes.mark_used(briefcase_id, codes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use briefcase_engine::{Change, ElementProps, LockLevel};

    fn ctx() -> AuthorizedContext {
        AuthorizedContext::for_token("token")
    }

    fn changeset(parent: &str, id: &str) -> ChangeSet {
        ChangeSet::new(
            parent,
            vec![Change::insert(ElementProps::new(id, "0x10", "Generic:PhysicalObject"))],
        )
    }

    #[tokio::test]
    async fn push_requires_current_tip() {
        let hub = InMemoryHub::new();
        let info = hub.create_imodel(&ctx(), "ctx", "plant", "").await.unwrap();
        let bid = hub.acquire_briefcase(&ctx(), &info.id).await.unwrap();
        assert_eq!(bid, BriefcaseId::FIRST_VALID);

        let cs1 = changeset("", "0x20");
        let t1 = ChangeSetToken::for_push(&cs1, 0, "one", bid);
        let accepted = hub
            .upload_changeset(&ctx(), &info.id, t1.clone(), cs1.clone())
            .await
            .unwrap();
        assert!(accepted.push_date.is_some());

        // a second changeset built on the seed is behind the tip
        let stale = changeset("", "0x21");
        let stale_token = ChangeSetToken::for_push(&stale, 0, "stale", bid);
        assert_eq!(
            hub.upload_changeset(&ctx(), &info.id, stale_token, stale)
                .await
                .unwrap_err(),
            HubError::PullIsRequired
        );
        assert_eq!(
            hub.upload_changeset(&ctx(), &info.id, t1, cs1)
                .await
                .unwrap_err(),
            HubError::ChangeSetAlreadyExists(accepted.id.clone())
        );

        let tip = hub.tip(&info.id).await.unwrap();
        assert_eq!(tip, ChangeSetPosition::new(accepted.id, 1));
    }

    #[tokio::test]
    async fn injected_failures_come_first() {
        let hub = InMemoryHub::new();
        let info = hub.create_imodel(&ctx(), "ctx", "plant", "").await.unwrap();
        let bid = hub.acquire_briefcase(&ctx(), &info.id).await.unwrap();
        hub.inject_push_failure(HubError::AnotherUserPushing);

        let cs = changeset("", "0x20");
        let token = ChangeSetToken::for_push(&cs, 0, "one", bid);
        assert_eq!(
            hub.upload_changeset(&ctx(), &info.id, token.clone(), cs.clone())
                .await
                .unwrap_err(),
            HubError::AnotherUserPushing
        );
        assert!(hub.upload_changeset(&ctx(), &info.id, token, cs).await.is_ok());
        assert_eq!(hub.upload_count(), 1);
    }

    #[tokio::test]
    async fn versions_resolve() {
        let hub = InMemoryHub::new();
        let info = hub.create_imodel(&ctx(), "ctx", "plant", "").await.unwrap();
        let bid = hub.acquire_briefcase(&ctx(), &info.id).await.unwrap();
        let cs = changeset("", "0x20");
        let token = ChangeSetToken::for_push(&cs, 0, "one", bid);
        hub.upload_changeset(&ctx(), &info.id, token.clone(), cs)
            .await
            .unwrap();
        hub.create_named_version(&ctx(), &info.id, "v1", &token.id)
            .await
            .unwrap();

        let first = hub
            .resolve_version(&ctx(), &info.id, &IModelVersion::First)
            .await
            .unwrap();
        assert_eq!(first.index, 0);
        let named = hub
            .resolve_version(&ctx(), &info.id, &IModelVersion::Named("v1".into()))
            .await
            .unwrap();
        assert_eq!(named.index, 1);
        assert!(matches!(
            hub.resolve_version(&ctx(), &info.id, &IModelVersion::AsOfChangeSet("zz".into()))
                .await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn locks_and_codes_are_arbitrated() {
        let hub = InMemoryHub::new();
        let info = hub.create_imodel(&ctx(), "ctx", "plant", "").await.unwrap();
        let a = hub.acquire_briefcase(&ctx(), &info.id).await.unwrap();
        let b = hub.acquire_briefcase(&ctx(), &info.id).await.unwrap();

        let lock = Lock::element("0x20", LockLevel::Exclusive);
        assert!(hub
            .acquire_locks(&ctx(), &info.id, a, &[lock.clone()])
            .await
            .unwrap()
            .is_empty());
        let denied = hub
            .acquire_locks(&ctx(), &info.id, b, &[lock.clone()])
            .await
            .unwrap();
        assert_eq!(denied, vec![(lock.clone(), a)]);

        let code = Code::new("0x1d", "0x1", "Pump-1");
        assert!(hub.reserve_codes(&ctx(), &info.id, a, &[code.clone()]).await.unwrap().is_empty());
        assert_eq!(
            hub.reserve_codes(&ctx(), &info.id, b, &[code.clone()]).await.unwrap(),
            vec![code.clone()]
        );

        hub.release_briefcase(&ctx(), &info.id, a).await.unwrap();
        assert!(hub
            .acquire_locks(&ctx(), &info.id, b, &[lock])
            .await
            .unwrap()
            .is_empty());
        assert!(hub.reserve_codes(&ctx(), &info.id, b, &[code]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_imodel_and_bad_credentials() {
        let hub = InMemoryHub::new();
        assert!(matches!(
            hub.get_imodel(&ctx(), "ctx", "missing").await,
            Err(HubError::NotFound(_))
        ));
        let info = hub.create_imodel(&ctx(), "ctx", "plant", "").await.unwrap();
        assert!(matches!(
            hub.get_imodel(&ctx(), "other", &info.id).await,
            Err(HubError::NotFound(_))
        ));
        let anonymous = AuthorizedContext::for_token("");
        assert!(matches!(
            hub.get_imodel(&anonymous, "ctx", &info.id).await,
            Err(HubError::Unauthorized(_))
        ));
    }
}
