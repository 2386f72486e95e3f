//! Briefcase manager.
//!
//! The [`BriefcaseManager`] maps (iModel, version) requests to open
//! [`IModelDb`]s. It owns the registry of open briefcases, keyed by file
//! path, and orchestrates every exchange with the hub: acquiring briefcase
//! ids, downloading and applying changesets, pushing local changes and
//! releasing resources.
//!
//! Concurrent opens of the same iModel and version are coalesced into one
//! background task. Callers wait on a shared handle to it; a caller whose
//! timeout elapses gets [`OpenOutcome::Pending`] while the task runs on.
//! Opens of different versions can still meet at one file, so each briefcase
//! file is opened, registered and closed under its own lock and is never
//! held by more than one [`LocalDatabase`] handle.

use crate::config::{fixed_version_dir, Config, BRIEFCASE_FILE_NAME};
use crate::database::{DatabaseError, DatabaseOpener, LocalDatabase};
use crate::error::{BackendError, BackendResult};
use crate::hub::{AuthorizedContext, ChangeSetPosition, ChangeSetQuery, HubClient, IModelVersion};
use crate::imodel::IModelDb;
use crate::briefcase::BriefcaseEntry;
use briefcase_engine::{
    verify_sequence, ApplyOption, BriefcaseId, BriefcaseProps, ChangeSet, ChangeSetIndex,
    ChangeSetToken, Code, Error, KeepBriefcase, OpenMode, SyncMode,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

type SharedOpen = Shared<BoxFuture<'static, BackendResult<Arc<IModelDb>>>>;

/// How to open a briefcase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenParams {
    pub open_mode: OpenMode,
    pub sync_mode: SyncMode,
    /// Give up waiting after this long and report [`OpenOutcome::Pending`]
    pub timeout: Option<Duration>,
}

impl OpenParams {
    /// A writable briefcase that pulls and pushes.
    pub fn pull_and_push() -> Self {
        Self {
            open_mode: OpenMode::ReadWrite,
            sync_mode: SyncMode::PullAndPush,
            timeout: None,
        }
    }

    /// A read-only copy pinned to one version.
    pub fn fixed_version() -> Self {
        Self {
            open_mode: OpenMode::ReadOnly,
            sync_mode: SyncMode::FixedVersion,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Key under which concurrent opens are coalesced.
    fn coalesce_key(&self, imodel_id: &str, version: &IModelVersion) -> String {
        format!(
            "{}:{:?}:{:?}:{}",
            imodel_id,
            self.sync_mode,
            self.open_mode,
            version.key()
        )
    }
}

impl Default for OpenParams {
    fn default() -> Self {
        Self::pull_and_push()
    }
}

/// Result of an open.
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    Opened(Arc<IModelDb>),
    /// The open is still running; retry later
    Pending,
}

impl OpenOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, OpenOutcome::Pending)
    }

    pub fn into_db(self) -> Option<Arc<IModelDb>> {
        match self {
            OpenOutcome::Opened(db) => Some(db),
            OpenOutcome::Pending => None,
        }
    }
}

/// Process-wide registry of open briefcases.
pub struct BriefcaseManager {
    hub: Arc<dyn HubClient>,
    opener: Arc<dyn DatabaseOpener>,
    config: Config,
    /// Open briefcases keyed by file path
    registry: DashMap<String, Arc<IModelDb>>,
    /// Opens in progress keyed by iModel, modes and version
    in_flight: DashMap<String, SharedOpen>,
    /// Held while a briefcase file is opened, registered or closed
    path_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for BriefcaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BriefcaseManager")
            .field("config", &self.config)
            .field("open", &self.registry.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl BriefcaseManager {
    pub fn new(hub: Arc<dyn HubClient>, opener: Arc<dyn DatabaseOpener>, config: Config) -> Self {
        Self {
            hub,
            opener,
            config,
            registry: DashMap::new(),
            in_flight: DashMap::new(),
            path_locks: DashMap::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a new manager wrapped in Arc for sharing.
    pub fn new_shared(
        hub: Arc<dyn HubClient>,
        opener: Arc<dyn DatabaseOpener>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self::new(hub, opener, config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &Arc<dyn HubClient> {
        &self.hub
    }

    /// The open briefcase at `path`, if any.
    pub fn find(&self, path: &Path) -> Option<Arc<IModelDb>> {
        self.registry
            .get(&path.display().to_string())
            .map(|entry| entry.value().clone())
    }

    pub fn open_count(&self) -> usize {
        self.registry.len()
    }

    fn ensure_running(&self) -> BackendResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BackendError::Superseded("briefcase manager shut down".into()));
        }
        Ok(())
    }

    // ---- open ----

    /// Open an iModel at `version`.
    ///
    /// A cached briefcase at or behind the version is reused and pulled
    /// forward; otherwise a new one is acquired. Concurrent calls for the
    /// same iModel and version share one operation and resolve to the same
    /// [`IModelDb`].
    pub async fn open(
        self: &Arc<Self>,
        ctx: &AuthorizedContext,
        context_id: &str,
        imodel_id: &str,
        params: OpenParams,
        version: IModelVersion,
    ) -> BackendResult<OpenOutcome> {
        self.ensure_running()?;
        ctx.validate()?;
        match (params.sync_mode, params.open_mode) {
            (SyncMode::PullAndPush, OpenMode::ReadOnly) => {
                return Err(BackendError::state("a pull/push briefcase must be opened read-write"))
            }
            (SyncMode::None, _) => {
                return Err(BackendError::state("snapshots are opened with open_snapshot"))
            }
            _ => {}
        }

        let key = params.coalesce_key(imodel_id, &version);
        let shared = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(key = %key, "Joining open in flight");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let manager = Arc::clone(self);
                let ctx = ctx.clone();
                let context_id = context_id.to_string();
                let imodel_id = imodel_id.to_string();
                let task_key = key.clone();
                let task = tokio::spawn(async move {
                    let result = manager
                        .do_open(&ctx, &context_id, &imodel_id, params, &version)
                        .await;
                    manager.in_flight.remove(&task_key);
                    result
                });
                let shared = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(BackendError::state(format!("open task failed: {}", e))),
                    }
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());
                shared
            }
        };

        match params.timeout.or(self.config.open_timeout) {
            Some(timeout) => match tokio::time::timeout(timeout, shared).await {
                Ok(result) => result.map(OpenOutcome::Opened),
                Err(_) => {
                    tracing::info!(key = %key, ?timeout, "Open still in flight");
                    Ok(OpenOutcome::Pending)
                }
            },
            None => shared.await.map(OpenOutcome::Opened),
        }
    }

    async fn do_open(
        &self,
        ctx: &AuthorizedContext,
        context_id: &str,
        imodel_id: &str,
        params: OpenParams,
        version: &IModelVersion,
    ) -> BackendResult<Arc<IModelDb>> {
        let info = self.hub.get_imodel(ctx, context_id, imodel_id).await?;
        let target = self.hub.resolve_version(ctx, imodel_id, version).await?;
        self.ensure_running()?;
        tracing::info!(
            imodel_id,
            name = %info.name,
            changeset_index = target.index,
            sync_mode = ?params.sync_mode,
            "Opening briefcase"
        );

        if params.sync_mode == SyncMode::FixedVersion {
            let path = self
                .config
                .briefcase_path(imodel_id, &fixed_version_dir(&target.id));
            let lock = self.path_lock(&path);
            let _reserved = lock.lock().await;
            if let Some(existing) = self.find(&path) {
                return Ok(existing);
            }
            let db = self
                .open_fixed_version(ctx, context_id, imodel_id, &path, &target, params.open_mode)
                .await?;
            self.ensure_running()?;
            return self.register(db, params.sync_mode);
        }
        self.open_pull_and_push(ctx, context_id, imodel_id, &target).await
    }

    /// Reuse the first numbered briefcase at or behind `target`, or acquire
    /// a new one. Each candidate file is examined under its path lock so at
    /// most one handle is ever opened on it.
    async fn open_pull_and_push(
        &self,
        ctx: &AuthorizedContext,
        context_id: &str,
        imodel_id: &str,
        target: &ChangeSetPosition,
    ) -> BackendResult<Arc<IModelDb>> {
        for path in self.cached_paths(imodel_id).await {
            let lock = self.path_lock(&path);
            let _reserved = lock.lock().await;
            if let Some(existing) = self.find(&path) {
                let entry = existing.briefcase();
                if !Self::reusable(&entry.props(), target.index) {
                    continue;
                }
                if entry.current_index() < target.index {
                    let version = IModelVersion::AsOfChangeSet(target.id.clone());
                    self.pull(ctx, &existing, entry.generation(), &version).await?;
                }
                return Ok(existing);
            }
            match self.opener.read_props(&path).await {
                Ok(props) if Self::reusable(&props, target.index) => {
                    tracing::debug!(path = %path.display(), "Reusing cached briefcase");
                    let mut db = self.opener.open(&path, OpenMode::ReadWrite).await?;
                    self.catch_up(ctx, &mut db, target).await?;
                    self.ensure_running()?;
                    return self.register(db, SyncMode::PullAndPush);
                }
                _ => continue,
            }
        }

        let briefcase_id = self.hub.acquire_briefcase(ctx, imodel_id).await?;
        self.ensure_running()?;
        let path = self
            .config
            .briefcase_path(imodel_id, &briefcase_id.to_string());
        tracing::info!(imodel_id, briefcase_id = %briefcase_id, "Acquired briefcase");
        let lock = self.path_lock(&path);
        let _reserved = lock.lock().await;
        let props = BriefcaseProps::seed(imodel_id, context_id, briefcase_id, SyncMode::PullAndPush);
        let mut db = self.opener.create(&path, props).await?;
        self.catch_up(ctx, &mut db, target).await?;
        self.ensure_running()?;
        self.register(db, SyncMode::PullAndPush)
    }

    /// A pull/push briefcase at or behind `target_index` and not reversed.
    fn reusable(props: &BriefcaseProps, target_index: ChangeSetIndex) -> bool {
        props.sync_mode == SyncMode::PullAndPush
            && !props.is_reversed()
            && props.changeset_index <= target_index
    }

    /// Serializes opening, registering and closing of one briefcase file.
    fn path_lock(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        self.path_locks
            .entry(path.display().to_string())
            .or_default()
            .clone()
    }

    async fn open_fixed_version(
        &self,
        ctx: &AuthorizedContext,
        context_id: &str,
        imodel_id: &str,
        path: &Path,
        target: &ChangeSetPosition,
        open_mode: OpenMode,
    ) -> BackendResult<Box<dyn LocalDatabase>> {
        match self.opener.open(path, open_mode).await {
            Ok(db) => return Ok(db),
            Err(DatabaseError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let props = BriefcaseProps::seed(
            imodel_id,
            context_id,
            BriefcaseId::STANDALONE,
            SyncMode::FixedVersion,
        );
        let mut db = self.opener.create(path, props).await?;
        self.catch_up(ctx, &mut db, target).await?;
        db.close()?;
        Ok(self.opener.open(path, open_mode).await?)
    }

    /// Briefcase files in the numbered directories of an iModel, lowest id first.
    async fn cached_paths(&self, imodel_id: &str) -> Vec<PathBuf> {
        let dir = self.config.imodel_dir(imodel_id);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        while let Ok(Some(item)) = entries.next_entry().await {
            if let Ok(id) = item.file_name().to_string_lossy().parse::<u32>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| dir.join(id.to_string()).join(BRIEFCASE_FILE_NAME))
            .collect()
    }

    /// Bring a database that is not registered yet forward to `target`.
    async fn catch_up(
        &self,
        ctx: &AuthorizedContext,
        db: &mut Box<dyn LocalDatabase>,
        target: &ChangeSetPosition,
    ) -> BackendResult<()> {
        let props = db.props().clone();
        let policy = self.config.default_policy.conflict_policy();
        let changesets = self
            .download_changesets(
                ctx,
                &props.imodel_id,
                props.current_changeset_id(),
                props.current_index(),
                target.index,
            )
            .await?;
        self.ensure_running()?;
        for (token, changeset) in &changesets {
            db.apply_changeset(token, changeset, ApplyOption::Merge, policy)?;
        }
        Ok(())
    }

    fn register(
        &self,
        db: Box<dyn LocalDatabase>,
        sync_mode: SyncMode,
    ) -> BackendResult<Arc<IModelDb>> {
        let entry = Arc::new(BriefcaseEntry::new(db, sync_mode));
        let imodel = Arc::new(IModelDb::new(
            entry.clone(),
            self.hub.clone(),
            self.config.default_policy,
        )?);
        match self.registry.entry(entry.key()) {
            Entry::Occupied(existing) => {
                // never write through a second handle on the same file
                tracing::warn!(path = %entry.pathname().display(), "Briefcase already open, discarding new handle");
                return Ok(existing.get().clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(imodel.clone());
            }
        }
        tracing::info!(
            imodel_id = %entry.imodel_id(),
            briefcase_id = %entry.briefcase_id(),
            path = %entry.pathname().display(),
            changeset_index = entry.current_index(),
            "Briefcase open"
        );
        Ok(imodel)
    }

    /// Register a new iModel with the hub and open it.
    pub async fn create(
        self: &Arc<Self>,
        ctx: &AuthorizedContext,
        context_id: &str,
        name: &str,
        description: &str,
    ) -> BackendResult<Arc<IModelDb>> {
        self.ensure_running()?;
        let info = self
            .hub
            .create_imodel(ctx, context_id, name, description)
            .await?;
        let outcome = self
            .open(
                ctx,
                context_id,
                &info.id,
                OpenParams::pull_and_push(),
                IModelVersion::Latest,
            )
            .await?;
        outcome
            .into_db()
            .ok_or_else(|| BackendError::state(format!("open of new iModel {} timed out", info.id)))
    }

    // ---- snapshots ----

    /// Write the saved content of `source` to a standalone file at `path`.
    pub async fn create_snapshot(&self, source: &IModelDb, path: &Path) -> BackendResult<()> {
        let props = source.briefcase().props();
        let changeset_id = props.current_changeset_id().clone();
        let changeset_index = props.current_index();
        let snapshot = BriefcaseProps {
            briefcase_id: BriefcaseId::STANDALONE,
            changeset_id,
            changeset_index,
            sync_mode: SyncMode::None,
            reversed: None,
            ..props
        };
        self.opener.copy(source.pathname(), path, snapshot).await?;
        tracing::info!(path = %path.display(), "Created snapshot");
        Ok(())
    }

    /// Open a snapshot file read-only. It never talks to the hub.
    pub async fn open_snapshot(&self, path: &Path) -> BackendResult<Arc<IModelDb>> {
        self.ensure_running()?;
        let lock = self.path_lock(path);
        let _reserved = lock.lock().await;
        if let Some(existing) = self.find(path) {
            return Ok(existing);
        }
        let db = self.opener.open(path, OpenMode::ReadOnly).await?;
        self.register(db, SyncMode::None)
    }

    // ---- changesets ----

    /// Tokens and content of the changesets in `after_index < index <= up_to`.
    async fn download_changesets(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        after_id: &str,
        after_index: ChangeSetIndex,
        up_to: ChangeSetIndex,
    ) -> BackendResult<Vec<(ChangeSetToken, ChangeSet)>> {
        if up_to <= after_index {
            return Ok(Vec::new());
        }
        let tokens = self
            .hub
            .get_changesets(ctx, imodel_id, ChangeSetQuery::between(after_index, up_to))
            .await?;
        verify_sequence(after_id, after_index, &tokens)?;
        if tokens.last().map(|t| t.index) != Some(up_to) {
            return Err(BackendError::NotFound(format!(
                "changesets {}..={} of iModel {}",
                after_index + 1,
                up_to,
                imodel_id
            )));
        }
        tracing::debug!(imodel_id, count = tokens.len(), after_index, up_to, "Downloading changesets");
        try_join_all(
            tokens
                .into_iter()
                .map(|token| self.fetch_changeset(ctx, imodel_id, token)),
        )
        .await
    }

    /// One changeset, from the local cache when it holds a valid copy.
    async fn fetch_changeset(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        token: ChangeSetToken,
    ) -> BackendResult<(ChangeSetToken, ChangeSet)> {
        let path = self.config.changeset_path(imodel_id, &token.id);
        let token = token.with_pathname(path.display().to_string());
        if let Ok(json) = tokio::fs::read_to_string(&path).await {
            match ChangeSet::from_json(&json) {
                Ok(changeset) if changeset.compute_id() == token.id => return Ok((token, changeset)),
                _ => tracing::warn!(path = %path.display(), "Discarding invalid cached changeset"),
            }
        }

        let changeset = self.hub.download_changeset(ctx, imodel_id, &token).await?;
        if changeset.compute_id() != token.id {
            return Err(Error::InvalidChangeSet(format!(
                "content of changeset {} does not match its id",
                token.id
            ))
            .into());
        }
        self.cache_changeset(&path, &changeset).await;
        Ok((token, changeset))
    }

    /// Best effort: a changeset that fails to cache is downloaded again later.
    async fn cache_changeset(&self, path: &Path, changeset: &ChangeSet) {
        let result: BackendResult<()> = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(path, changeset.to_json()?).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Could not cache changeset");
        }
    }

    fn ensure_pull_and_push(db: &IModelDb) -> BackendResult<()> {
        let entry = db.briefcase();
        if entry.sync_mode() != SyncMode::PullAndPush || entry.open_mode() != OpenMode::ReadWrite {
            return Err(BackendError::state(format!(
                "briefcase {} is not a read-write pull/push briefcase",
                entry.pathname().display()
            )));
        }
        Ok(())
    }

    /// Merge the changesets between the current position and `version`.
    ///
    /// Changesets are applied one at a time in ascending order. A failure
    /// leaves the briefcase at the last changeset that applied.
    pub async fn pull_and_merge_changes(
        &self,
        ctx: &AuthorizedContext,
        db: &IModelDb,
        version: IModelVersion,
    ) -> BackendResult<ChangeSetPosition> {
        ctx.validate()?;
        Self::ensure_pull_and_push(db)?;
        let generation = db.briefcase().generation();
        self.pull(ctx, db, generation, &version).await
    }

    async fn pull(
        &self,
        ctx: &AuthorizedContext,
        db: &IModelDb,
        generation: u64,
        version: &IModelVersion,
    ) -> BackendResult<ChangeSetPosition> {
        let entry = db.briefcase();
        db.ensure_can_pull().await?;
        let target = self.hub.resolve_version(ctx, db.imodel_id(), version).await?;
        entry.ensure_current(generation)?;

        let current = entry.current_index();
        if target.index < current {
            return Err(BackendError::state(format!(
                "cannot pull back from changeset {} to {}",
                current, target.index
            )));
        }
        let changesets = self
            .download_changesets(
                ctx,
                db.imodel_id(),
                &entry.current_changeset_id(),
                current,
                target.index,
            )
            .await?;
        entry.ensure_current(generation)?;

        for (token, changeset) in &changesets {
            db.apply_changeset(token, changeset, ApplyOption::Merge).await?;
            tracing::debug!(
                imodel_id = %db.imodel_id(),
                changeset_id = %token.id,
                index = token.index,
                "Merged changeset"
            );
        }
        if !changesets.is_empty() {
            tracing::info!(
                imodel_id = %db.imodel_id(),
                count = changesets.len(),
                index = target.index,
                "Pulled changesets"
            );
        }
        Ok(target)
    }

    /// Push committed local changes as one changeset.
    ///
    /// Returns `None` when there is nothing to push. Transient conflicts
    /// ("someone pushed first") are retried by pulling and pushing again,
    /// up to the configured number of retries.
    pub async fn push_changes(
        &self,
        ctx: &AuthorizedContext,
        db: &IModelDb,
        description: Option<&str>,
    ) -> BackendResult<Option<ChangeSetToken>> {
        ctx.validate()?;
        Self::ensure_pull_and_push(db)?;
        if db.has_unsaved_changes().await? {
            return Err(BackendError::state("save changes before pushing"));
        }
        if db.briefcase().props().is_reversed() {
            return Err(BackendError::state("reinstate reversed changesets before pushing"));
        }
        if !db.has_unpushed_changes().await? {
            tracing::debug!(imodel_id = %db.imodel_id(), "Nothing to push");
            return Ok(None);
        }

        let generation = db.briefcase().generation();
        let description = db.push_description(description).await;
        let mut last_error = None;
        for attempt in 0..=self.config.push_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
                db.briefcase().ensure_current(generation)?;
            }
            match self.try_push(ctx, db, generation, &description).await {
                Ok(token) => return Ok(token),
                Err(e) if e.hub_error().map(|h| h.is_push_retryable()).unwrap_or(false) => {
                    tracing::warn!(
                        imodel_id = %db.imodel_id(),
                        attempt,
                        error = %e,
                        "Push conflict, pulling before retry"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| BackendError::state("push retries exhausted")))
    }

    async fn try_push(
        &self,
        ctx: &AuthorizedContext,
        db: &IModelDb,
        generation: u64,
        description: &str,
    ) -> BackendResult<Option<ChangeSetToken>> {
        let entry = db.briefcase();
        let imodel_id = db.imodel_id();
        self.pull(ctx, db, generation, &IModelVersion::Latest).await?;
        if !db.has_unpushed_changes().await? {
            // incoming changes superseded everything local
            return Ok(None);
        }
        db.request_resources(ctx, None).await?;

        let changeset = db.start_changeset().await?;
        let token = ChangeSetToken::for_push(
            &changeset,
            entry.current_index(),
            description,
            entry.briefcase_id(),
        );
        tracing::debug!(imodel_id, changeset_id = %token.id, index = token.index, "Uploading changeset");
        let pushed = match self
            .hub
            .upload_changeset(ctx, imodel_id, token, changeset.clone())
            .await
        {
            Ok(pushed) => pushed,
            Err(e) => {
                db.abandon_changeset().await;
                return Err(e.into());
            }
        };
        let path = self.config.changeset_path(imodel_id, &pushed.id);
        self.cache_changeset(&path, &changeset).await;
        let pushed = pushed.with_pathname(path.display().to_string());

        let codes = db.finish_changeset(&pushed).await?;
        self.release_after_push(ctx, imodel_id, entry.briefcase_id(), &codes)
            .await;
        tracing::info!(
            imodel_id,
            changeset_id = %pushed.id,
            index = pushed.index,
            briefcase_id = %entry.briefcase_id(),
            "Pushed changeset"
        );
        Ok(Some(pushed))
    }

    /// Best effort: the hub has already accepted the changeset, so a failure
    /// here is logged and the locks stay held until the next push.
    async fn release_after_push(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        codes: &[Code],
    ) {
        if !codes.is_empty() {
            if let Err(e) = self
                .hub
                .mark_codes_used(ctx, imodel_id, briefcase_id, codes)
                .await
            {
                tracing::warn!(imodel_id, %briefcase_id, error = %e, "Could not mark pushed codes used");
            }
        }
        if let Err(e) = self.hub.release_locks(ctx, imodel_id, briefcase_id).await {
            tracing::warn!(imodel_id, %briefcase_id, error = %e, "Could not release locks after push");
        }
    }

    /// Undo pushed changesets back to `version`, newest first.
    pub async fn reverse_changes(
        &self,
        ctx: &AuthorizedContext,
        db: &IModelDb,
        version: IModelVersion,
    ) -> BackendResult<ChangeSetPosition> {
        ctx.validate()?;
        Self::ensure_pull_and_push(db)?;
        db.ensure_no_local_changes().await?;
        let entry = db.briefcase();
        let generation = entry.generation();
        let target = self.hub.resolve_version(ctx, db.imodel_id(), &version).await?;
        entry.ensure_current(generation)?;

        let current = entry.current_index();
        if target.index > current {
            return Err(BackendError::state(format!(
                "cannot reverse forward from changeset {} to {}",
                current, target.index
            )));
        }
        if target.index == current {
            return Err(Error::NothingToReverse.into());
        }
        let changesets = self
            .download_changesets(ctx, db.imodel_id(), &target.id, target.index, current)
            .await?;
        entry.ensure_current(generation)?;

        for (token, changeset) in changesets.iter().rev() {
            db.apply_changeset(token, changeset, ApplyOption::Reverse).await?;
        }
        tracing::info!(imodel_id = %db.imodel_id(), from = current, to = target.index, "Reversed changesets");
        Ok(target)
    }

    /// Re-apply reversed changesets up to `version`, or all of them.
    pub async fn reinstate_changes(
        &self,
        ctx: &AuthorizedContext,
        db: &IModelDb,
        version: Option<IModelVersion>,
    ) -> BackendResult<ChangeSetPosition> {
        ctx.validate()?;
        Self::ensure_pull_and_push(db)?;
        db.ensure_no_local_changes().await?;
        let entry = db.briefcase();
        let generation = entry.generation();
        let props = entry.props();
        if !props.is_reversed() {
            return Err(Error::NothingToReinstate.into());
        }

        let tip = ChangeSetPosition::new(props.changeset_id.clone(), props.changeset_index);
        let target = match version {
            Some(version) => {
                let target = self.hub.resolve_version(ctx, db.imodel_id(), &version).await?;
                entry.ensure_current(generation)?;
                target
            }
            None => tip.clone(),
        };
        let current = props.current_index();
        if target.index > tip.index {
            return Err(BackendError::state(format!(
                "cannot reinstate past changeset {} to {}",
                tip.index, target.index
            )));
        }
        if target.index <= current {
            return Err(Error::NothingToReinstate.into());
        }

        let changesets = self
            .download_changesets(
                ctx,
                db.imodel_id(),
                props.current_changeset_id(),
                current,
                target.index,
            )
            .await?;
        entry.ensure_current(generation)?;
        for (token, changeset) in &changesets {
            db.apply_changeset(token, changeset, ApplyOption::Reinstate).await?;
        }
        tracing::info!(imodel_id = %db.imodel_id(), from = current, to = target.index, "Reinstated changesets");
        Ok(target)
    }

    // ---- close ----

    /// Close an open briefcase.
    ///
    /// With [`KeepBriefcase::No`] the briefcase id goes back to the hub and
    /// the file is deleted.
    pub async fn close(
        &self,
        ctx: &AuthorizedContext,
        db: &IModelDb,
        keep: KeepBriefcase,
    ) -> BackendResult<()> {
        let entry = db.briefcase();
        if keep == KeepBriefcase::No && entry.sync_mode() == SyncMode::PullAndPush {
            ctx.validate()?;
        }
        {
            let lock = self.path_lock(entry.pathname());
            let _reserved = lock.lock().await;
            db.close_session().await?;
            self.registry.remove(&entry.key());
        }
        tracing::info!(
            imodel_id = %entry.imodel_id(),
            path = %entry.pathname().display(),
            ?keep,
            "Closed briefcase"
        );

        if keep == KeepBriefcase::No {
            if entry.sync_mode() == SyncMode::PullAndPush {
                self.hub
                    .release_briefcase(ctx, entry.imodel_id(), entry.briefcase_id())
                    .await?;
            }
            if let Some(dir) = entry.pathname().parent() {
                if entry.sync_mode() == SyncMode::None {
                    tokio::fs::remove_file(entry.pathname()).await?;
                } else {
                    tokio::fs::remove_dir_all(dir).await?;
                }
            }
        }
        Ok(())
    }

    /// Close every open briefcase, keeping them for later, and refuse new work.
    pub async fn shutdown(&self) -> BackendResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        let open: Vec<Arc<IModelDb>> = self.registry.iter().map(|e| e.value().clone()).collect();
        for db in open {
            let lock = self.path_lock(db.pathname());
            let _reserved = lock.lock().await;
            db.close_session().await?;
            self.registry.remove(&db.briefcase().key());
        }
        tracing::info!("Briefcase manager shut down");
        Ok(())
    }
}
