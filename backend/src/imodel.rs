//! The IModelDb facade.
//!
//! An [`IModelDb`] is what callers edit. It wraps one [`BriefcaseEntry`] and
//! keeps the session state that lives only while the briefcase is open: the
//! [`TxnManager`] and the [`ConcurrencyControl`]. Every edit goes to the
//! local database first and then records the locks and codes it needs.
//!
//! Lock order is session, then database. Resource requests hold the session
//! across hub calls so no edit can slip in between a query and a submission.

use crate::briefcase::BriefcaseEntry;
use crate::error::{BackendError, BackendResult, RequestError};
use crate::hub::{AuthorizedContext, HubClient, HubError};
use briefcase_engine::{
    ApplyOption, BriefcaseId, BulkState, Change, ChangeSet, ChangeSetToken, Code,
    ConcurrencyControl, ConcurrencyPolicy, DbOpcode, ElementProps, Lock, MergeOutcome,
    ModelProps, Observers, RelationshipProps, ResourceRequest, Schema, SubscriptionId, SyncMode,
    TxnEvent, TxnId, TxnManager, ValidationError,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Lifecycle events of an open iModel.
#[derive(Debug, Clone, PartialEq)]
pub enum IModelEvent {
    /// The database is about to close
    BeforeClose,
    /// A save committed the given txn
    Saved(TxnId),
    /// A changeset was merged, reversed or reinstated
    ChangeSetApplied {
        token: ChangeSetToken,
        option: ApplyOption,
    },
    /// Local changes were accepted by the hub as this changeset
    Pushed(ChangeSetToken),
}

/// Dependency validation run on the net changes of every save.
pub type Validator = Box<dyn Fn(&[Change]) -> Vec<ValidationError> + Send + Sync>;

/// State owned by one open session.
#[derive(Debug)]
struct Session {
    txns: TxnManager,
    concurrency: ConcurrencyControl,
}

/// Locks and codes the hub would not grant.
type Denied = (Vec<Code>, Vec<(Lock, BriefcaseId)>);

/// An open iModel.
pub struct IModelDb {
    briefcase: Arc<BriefcaseEntry>,
    hub: Arc<dyn HubClient>,
    session: AsyncMutex<Session>,
    events: Mutex<Observers<IModelEvent>>,
    validators: Mutex<Vec<Validator>>,
}

impl std::fmt::Debug for IModelDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IModelDb")
            .field("briefcase", &self.briefcase)
            .finish_non_exhaustive()
    }
}

impl IModelDb {
    /// Start a session on an open briefcase.
    ///
    /// Only pull/push briefcases are bound to their briefcase id; the others
    /// cannot build resource requests.
    pub fn new(
        briefcase: Arc<BriefcaseEntry>,
        hub: Arc<dyn HubClient>,
        policy: ConcurrencyPolicy,
    ) -> BackendResult<Self> {
        let mut concurrency = ConcurrencyControl::new();
        if briefcase.sync_mode() == SyncMode::PullAndPush {
            concurrency.bind(briefcase.briefcase_id());
        }
        concurrency.set_policy(policy, false)?;
        Ok(Self {
            briefcase,
            hub,
            session: AsyncMutex::new(Session {
                txns: TxnManager::new(),
                concurrency,
            }),
            events: Mutex::new(Observers::new()),
            validators: Mutex::new(Vec::new()),
        })
    }

    pub fn briefcase(&self) -> &Arc<BriefcaseEntry> {
        &self.briefcase
    }

    pub fn imodel_id(&self) -> &str {
        self.briefcase.imodel_id()
    }

    pub fn briefcase_id(&self) -> BriefcaseId {
        self.briefcase.briefcase_id()
    }

    pub fn pathname(&self) -> &Path {
        self.briefcase.pathname()
    }

    pub fn is_open(&self) -> bool {
        self.briefcase.is_open()
    }

    // ---- events ----

    pub fn subscribe(&self, callback: impl FnMut(&IModelEvent) + Send + 'static) -> SubscriptionId {
        self.with_events(|events| events.subscribe(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.with_events(|events| events.unsubscribe(id))
    }

    /// Observe the txn lifecycle of this session.
    pub async fn subscribe_txns(
        &self,
        callback: impl FnMut(&TxnEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.session.lock().await.txns.subscribe(callback)
    }

    pub async fn unsubscribe_txns(&self, id: SubscriptionId) -> bool {
        self.session.lock().await.txns.unsubscribe(id)
    }

    fn with_events<R>(&self, f: impl FnOnce(&mut Observers<IModelEvent>) -> R) -> R {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut events)
    }

    fn notify(&self, event: IModelEvent) {
        self.with_events(|events| events.notify(&event));
    }

    /// Register a dependency validator. Fatal errors it reports abort the save.
    pub fn add_validator(
        &self,
        validator: impl Fn(&[Change]) -> Vec<ValidationError> + Send + Sync + 'static,
    ) {
        let mut validators = self
            .validators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        validators.push(Box::new(validator));
    }

    fn validate(&self, changes: &[Change]) -> Vec<ValidationError> {
        let validators = self
            .validators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        validators.iter().flat_map(|v| v(changes)).collect()
    }

    // ---- content ----

    pub async fn element(&self, id: &str) -> BackendResult<Option<ElementProps>> {
        Ok(self.briefcase.db().await?.element(id).cloned())
    }

    pub async fn element_count(&self) -> BackendResult<usize> {
        Ok(self.briefcase.db().await?.content().len())
    }

    /// Deterministic JSON of the content, for comparing replicas.
    pub async fn dump(&self) -> BackendResult<String> {
        Ok(self.briefcase.db().await?.dump()?)
    }

    pub async fn insert_element(&self, element: ElementProps) -> BackendResult<Change> {
        let mut session = self.session.lock().await;
        session.concurrency.briefcase_id()?;
        let mut db = self.briefcase.db().await?;
        let change = db.insert_element(element.clone())?;
        session
            .concurrency
            .build_request_for_element(&element, DbOpcode::Insert, None)?;
        Ok(change)
    }

    pub async fn update_element(&self, element: ElementProps) -> BackendResult<Change> {
        let mut session = self.session.lock().await;
        session.concurrency.briefcase_id()?;
        let mut db = self.briefcase.db().await?;
        let previous_code = db.element(&element.id).map(|e| e.code.clone());
        let change = db.update_element(element.clone())?;
        session.concurrency.build_request_for_element(
            &element,
            DbOpcode::Update,
            previous_code.as_ref(),
        )?;
        Ok(change)
    }

    pub async fn delete_element(&self, id: &str) -> BackendResult<Change> {
        let mut session = self.session.lock().await;
        session.concurrency.briefcase_id()?;
        let mut db = self.briefcase.db().await?;
        let change = db.delete_element(id)?;
        if let Some(before) = &change.before {
            session
                .concurrency
                .build_request_for_element(before, DbOpcode::Delete, None)?;
        }
        Ok(change)
    }

    /// Record the resources a model change needs.
    pub async fn build_request_for_model(
        &self,
        model: &ModelProps,
        opcode: DbOpcode,
    ) -> BackendResult<ResourceRequest> {
        let mut session = self.session.lock().await;
        Ok(session.concurrency.build_request_for_model(model, opcode)?)
    }

    /// Record the resources a relationship change needs.
    ///
    /// Both endpoints must exist so their models can be locked.
    pub async fn build_request_for_relationship(
        &self,
        relationship: &RelationshipProps,
        opcode: DbOpcode,
    ) -> BackendResult<ResourceRequest> {
        let mut session = self.session.lock().await;
        let db = self.briefcase.db().await?;
        let model_of = |id: &str| {
            db.element(id)
                .map(|e| e.model_id.clone())
                .ok_or_else(|| BackendError::NotFound(format!("element {}", id)))
        };
        let source_model = model_of(&relationship.source_id)?;
        let target_model = model_of(&relationship.target_id)?;
        Ok(session.concurrency.build_request_for_relationship(
            relationship,
            opcode,
            &source_model,
            &target_model,
        )?)
    }

    // ---- saving ----

    pub async fn has_unsaved_changes(&self) -> BackendResult<bool> {
        Ok(self.briefcase.db().await?.has_unsaved_changes())
    }

    pub async fn has_unpushed_changes(&self) -> BackendResult<bool> {
        Ok(self.briefcase.db().await?.has_unpushed_changes())
    }

    /// Commit unsaved changes as one txn.
    ///
    /// Refused under the pessimistic policy while resources are pending. A
    /// fatal validation error rolls the changes back. Returns `None` when
    /// there were no element changes to commit.
    pub async fn save_changes(&self, description: &str) -> BackendResult<Option<TxnId>> {
        let mut session = self.session.lock().await;
        let session = &mut *session;
        session.concurrency.on_save_changes()?;
        let mut db = self.briefcase.db().await?;

        session.txns.on_commit();
        for error in self.validate(&db.unsaved_changes()) {
            session.txns.report_error(error);
        }
        if let Err(e) = session.txns.check_commit() {
            db.abandon_changes()?;
            session.concurrency.on_abandon();
            tracing::warn!(imodel_id = %self.imodel_id(), error = %e, "Save rolled back");
            return Err(e.into());
        }

        let changes = db.save_changes()?;
        let txn_id = session.txns.on_committed(description, changes);
        session.concurrency.on_committed();
        drop(db);

        if let Some(id) = txn_id {
            tracing::debug!(imodel_id = %self.imodel_id(), txn_id = id, description, "Saved changes");
            self.notify(IModelEvent::Saved(id));
        }
        Ok(txn_id)
    }

    /// Throw away unsaved changes.
    pub async fn abandon_changes(&self) -> BackendResult<()> {
        let mut session = self.session.lock().await;
        let mut db = self.briefcase.db().await?;
        db.abandon_changes()?;
        session.txns.on_abandoned();
        session.concurrency.on_abandon();
        Ok(())
    }

    /// Report a validation problem for the commit in progress.
    pub async fn report_error(&self, error: ValidationError) {
        self.session.lock().await.txns.report_error(error);
    }

    pub async fn has_fatal_error(&self) -> bool {
        self.session.lock().await.txns.has_fatal_error()
    }

    // ---- txns ----

    pub async fn has_local_changes(&self) -> bool {
        self.session.lock().await.txns.has_local_changes()
    }

    pub async fn first_txn_id(&self) -> Option<TxnId> {
        self.session.lock().await.txns.first_txn_id()
    }

    pub async fn current_txn_id(&self) -> Option<TxnId> {
        self.session.lock().await.txns.current_txn_id()
    }

    pub async fn is_undo_possible(&self) -> bool {
        self.session.lock().await.txns.is_undo_possible()
    }

    pub async fn is_redo_possible(&self) -> bool {
        self.session.lock().await.txns.is_redo_possible()
    }

    /// Distinct descriptions of local txns up to `end`.
    pub async fn describe_changeset(&self, end: Option<TxnId>) -> Vec<String> {
        self.session.lock().await.txns.describe_changeset(end)
    }

    pub async fn begin_multi_txn_operation(&self) -> u32 {
        self.session.lock().await.txns.begin_multi_txn_operation()
    }

    pub async fn end_multi_txn_operation(&self) -> BackendResult<u32> {
        Ok(self.session.lock().await.txns.end_multi_txn_operation()?)
    }

    /// Undo the last `count` txns; a multi-txn group counts as one.
    pub async fn reverse_txns(&self, count: usize) -> BackendResult<()> {
        self.undo_redo(|txns| txns.reverse_txns(count)).await
    }

    pub async fn reverse_all(&self) -> BackendResult<()> {
        self.undo_redo(|txns| txns.reverse_all()).await
    }

    /// Undo every txn from `txn_id` on.
    pub async fn cancel_to(&self, txn_id: TxnId) -> BackendResult<()> {
        self.undo_redo(|txns| txns.reverse_to(txn_id)).await
    }

    pub async fn reinstate_txn(&self) -> BackendResult<()> {
        self.undo_redo(|txns| txns.reinstate_txn()).await
    }

    async fn undo_redo(
        &self,
        step: impl FnOnce(&mut TxnManager) -> briefcase_engine::error::Result<Vec<Change>>,
    ) -> BackendResult<()> {
        let mut session = self.session.lock().await;
        let mut db = self.briefcase.db().await?;
        if db.has_unsaved_changes() {
            return Err(BackendError::state("save or abandon changes before undo/redo"));
        }
        let changes = step(&mut session.txns)?;
        db.apply_txn_changes(&changes)?;
        session.concurrency.on_undo_redo();
        Ok(())
    }

    // ---- concurrency ----

    pub async fn concurrency_policy(&self) -> Option<ConcurrencyPolicy> {
        self.session.lock().await.concurrency.policy().copied()
    }

    /// Switch policy. Refused while anything is unsaved or unpushed.
    pub async fn set_concurrency_policy(&self, policy: ConcurrencyPolicy) -> BackendResult<()> {
        let mut session = self.session.lock().await;
        let db = self.briefcase.db().await?;
        let has_local_changes = session.txns.has_local_changes()
            || db.has_unsaved_changes()
            || db.has_unpushed_changes();
        session.concurrency.set_policy(policy, has_local_changes)?;
        Ok(())
    }

    pub async fn bulk_state(&self) -> BulkState {
        self.session.lock().await.concurrency.bulk_state()
    }

    pub async fn pending_request(&self) -> ResourceRequest {
        self.session.lock().await.concurrency.pending_request().clone()
    }

    pub async fn held_locks(&self) -> Vec<Lock> {
        self.session.lock().await.concurrency.held_locks().to_vec()
    }

    pub async fn held_codes(&self) -> Vec<Code> {
        self.session.lock().await.concurrency.held_codes().to_vec()
    }

    /// Submit `request`, or everything pending, to the hub.
    ///
    /// Resources this briefcase already holds are filtered out first. If any
    /// code is unavailable the result is a [`RequestError`] listing the
    /// unavailable codes and locks; if only locks are, it is
    /// [`HubError::LockOwnedByAnotherBriefcase`]. Unavailable resources go
    /// back into the pending buffer.
    pub async fn request_resources(
        &self,
        ctx: &AuthorizedContext,
        request: Option<ResourceRequest>,
    ) -> BackendResult<()> {
        ctx.validate()?;
        let generation = self.briefcase.generation();
        let mut session = self.session.lock().await;
        let briefcase_id = session.concurrency.briefcase_id()?;
        let request = match request {
            Some(request) => request,
            None => session.concurrency.extract_pending(),
        };
        if request.is_empty() {
            return Ok(());
        }

        let (denied_codes, denied_locks) = match self
            .submit(ctx, generation, briefcase_id, &mut session.concurrency, &request)
            .await
        {
            Ok(denied) => denied,
            Err(e) => {
                session.concurrency.restore_pending(request);
                return Err(e);
            }
        };
        if denied_codes.is_empty() && denied_locks.is_empty() {
            return Ok(());
        }

        let mut unavailable = ResourceRequest::new();
        for code in &denied_codes {
            unavailable.add_code(code.clone());
        }
        for (lock, _) in &denied_locks {
            unavailable.add_lock(lock.clone());
        }
        session.concurrency.restore_pending(unavailable);
        tracing::info!(
            imodel_id = %self.imodel_id(),
            briefcase_id = %briefcase_id,
            codes = denied_codes.len(),
            locks = denied_locks.len(),
            "Resource request denied"
        );

        if !denied_codes.is_empty() {
            return Err(RequestError {
                unavailable_codes: denied_codes,
                unavailable_locks: denied_locks.into_iter().map(|(lock, _)| lock).collect(),
            }
            .into());
        }
        match denied_locks.into_iter().next() {
            Some((lock, owner)) => Err(BackendError::Hub(HubError::LockOwnedByAnotherBriefcase {
                lock: lock.to_string(),
                owner,
            })),
            None => Ok(()),
        }
    }

    /// Query what is held, then ask for the rest. Returns what was denied.
    async fn submit(
        &self,
        ctx: &AuthorizedContext,
        generation: u64,
        briefcase_id: BriefcaseId,
        concurrency: &mut ConcurrencyControl,
        request: &ResourceRequest,
    ) -> BackendResult<Denied> {
        let imodel_id = self.imodel_id();
        let held_locks = self.hub.query_locks(ctx, imodel_id, briefcase_id).await?;
        let held_codes = self.hub.query_codes(ctx, imodel_id, briefcase_id).await?;
        self.briefcase.ensure_current(generation)?;
        concurrency.mark_held(&held_locks, &held_codes);

        let mut request = request.clone();
        request.remove_held(&held_locks, &held_codes);
        if request.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        tracing::debug!(
            imodel_id,
            briefcase_id = %briefcase_id,
            locks = request.locks.len(),
            codes = request.codes.len(),
            "Submitting resource request"
        );

        let denied_codes = if request.codes.is_empty() {
            Vec::new()
        } else {
            self.hub
                .reserve_codes(ctx, imodel_id, briefcase_id, &request.codes)
                .await?
        };
        let denied_locks = if request.locks.is_empty() {
            Vec::new()
        } else {
            self.hub
                .acquire_locks(ctx, imodel_id, briefcase_id, &request.locks)
                .await?
        };
        self.briefcase.ensure_current(generation)?;

        let granted_codes: Vec<Code> = request
            .codes
            .iter()
            .filter(|code| !denied_codes.contains(code))
            .cloned()
            .collect();
        let granted_locks: Vec<Lock> = request
            .locks
            .iter()
            .filter(|lock| !denied_locks.iter().any(|(denied, _)| denied == *lock))
            .cloned()
            .collect();
        concurrency.mark_held(&granted_locks, &granted_codes);
        Ok((denied_codes, denied_locks))
    }

    /// Acquire locks right away, bypassing the pending buffer.
    async fn acquire_now(&self, ctx: &AuthorizedContext, locks: Vec<Lock>) -> BackendResult<()> {
        ctx.validate()?;
        let generation = self.briefcase.generation();
        let mut session = self.session.lock().await;
        let briefcase_id = session.concurrency.briefcase_id()?;
        let denied = self
            .hub
            .acquire_locks(ctx, self.imodel_id(), briefcase_id, &locks)
            .await?;
        self.briefcase.ensure_current(generation)?;
        if let Some((lock, owner)) = denied.into_iter().next() {
            return Err(BackendError::Hub(HubError::LockOwnedByAnotherBriefcase {
                lock: lock.to_string(),
                owner,
            }));
        }
        session.concurrency.mark_held(&locks, &[]);
        Ok(())
    }

    /// Take the exclusive schema lock now, whatever the policy.
    pub async fn lock_schema(&self, ctx: &AuthorizedContext) -> BackendResult<()> {
        self.acquire_now(ctx, vec![Lock::schemas()]).await
    }

    /// Take the exclusive code-spec lock now, whatever the policy.
    pub async fn lock_code_specs(&self, ctx: &AuthorizedContext) -> BackendResult<()> {
        self.acquire_now(ctx, vec![Lock::code_specs()]).await
    }

    /// Reserve codes now.
    pub async fn reserve_codes(&self, ctx: &AuthorizedContext, codes: Vec<Code>) -> BackendResult<()> {
        let mut request = ResourceRequest::new();
        for code in codes {
            request.add_code(code);
        }
        self.request_resources(ctx, Some(request)).await
    }

    /// Import schemas as unsaved changes, after taking the schema lock.
    ///
    /// Returns how many schemas changed anything.
    pub async fn import_schemas(
        &self,
        ctx: &AuthorizedContext,
        schemas: Vec<Schema>,
    ) -> BackendResult<usize> {
        self.lock_schema(ctx).await?;
        let _session = self.session.lock().await;
        let mut db = self.briefcase.db().await?;
        let mut changed = 0;
        for schema in schemas {
            if db.import_schema(schema)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    // ---- used by the manager ----

    /// Refuse timeline moves while edits are unsaved or changesets reversed.
    pub(crate) async fn ensure_can_pull(&self) -> BackendResult<()> {
        let db = self.briefcase.db().await?;
        if db.has_unsaved_changes() {
            return Err(BackendError::state("save or abandon changes before pulling"));
        }
        if db.props().is_reversed() {
            return Err(BackendError::state(
                "reinstate reversed changesets before pulling or pushing",
            ));
        }
        Ok(())
    }

    /// Refuse reversal while anything local exists.
    pub(crate) async fn ensure_no_local_changes(&self) -> BackendResult<()> {
        let db = self.briefcase.db().await?;
        if db.has_unsaved_changes() || db.has_unpushed_changes() {
            return Err(BackendError::state(
                "push or abandon local changes before reversing or reinstating",
            ));
        }
        Ok(())
    }

    /// Apply one changeset from the timeline.
    pub(crate) async fn apply_changeset(
        &self,
        token: &ChangeSetToken,
        changeset: &ChangeSet,
        option: ApplyOption,
    ) -> BackendResult<MergeOutcome> {
        let mut session = self.session.lock().await;
        let mut db = self.briefcase.db().await?;
        let policy = session.concurrency.conflict_policy();
        let outcome = db.apply_changeset(token, changeset, option, policy)?;
        if option == ApplyOption::Merge {
            session.txns.on_merged(outcome.rebased_local.clone());
            session.concurrency.on_merged();
        }
        session.txns.on_changes_applied(option);
        drop(db);
        drop(session);

        if outcome.has_conflicts() {
            tracing::info!(
                imodel_id = %self.imodel_id(),
                changeset_id = %token.id,
                conflicts = outcome.conflicts.len(),
                rejected = outcome.rejected.len(),
                "Resolved merge conflicts"
            );
        }
        self.notify(IModelEvent::ChangeSetApplied {
            token: token.clone(),
            option,
        });
        Ok(outcome)
    }

    /// Default push description from local txns.
    pub(crate) async fn push_description(&self, description: Option<&str>) -> String {
        match description {
            Some(description) => description.to_string(),
            None => self.describe_changeset(None).await.join("; "),
        }
    }

    pub(crate) async fn start_changeset(&self) -> BackendResult<ChangeSet> {
        Ok(self.briefcase.db().await?.start_create_changeset()?)
    }

    pub(crate) async fn abandon_changeset(&self) {
        if let Ok(mut db) = self.briefcase.db().await {
            db.abandon_create_changeset();
        }
    }

    /// The hub accepted the changeset. Returns the codes to mark used.
    pub(crate) async fn finish_changeset(&self, token: &ChangeSetToken) -> BackendResult<Vec<Code>> {
        let mut session = self.session.lock().await;
        let mut db = self.briefcase.db().await?;
        db.finish_create_changeset(token)?;
        drop(db);
        let codes = session.concurrency.held_codes().to_vec();
        session.txns.on_pushed();
        session.concurrency.on_pushed();
        drop(session);
        self.notify(IModelEvent::Pushed(token.clone()));
        Ok(codes)
    }

    /// Close the session and the briefcase handle.
    pub(crate) async fn close_session(&self) -> BackendResult<()> {
        self.notify(IModelEvent::BeforeClose);
        let mut session = self.session.lock().await;
        session.concurrency.unbind();
        drop(session);
        self.briefcase.close().await
    }
}
