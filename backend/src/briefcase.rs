//! Briefcase entries.
//!
//! A [`BriefcaseEntry`] binds one briefcase file on disk to its identity on
//! the hub and owns the single live [`LocalDatabase`] handle for that file.

use crate::database::LocalDatabase;
use crate::error::{BackendError, BackendResult};
use briefcase_engine::{
    BriefcaseId, BriefcaseProps, ChangeSetId, ChangeSetIndex, ContextId, IModelId, Observers,
    OpenMode, SubscriptionId, SyncMode,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{MappedMutexGuard, Mutex as AsyncMutex, MutexGuard};

/// Lifecycle events of a briefcase entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BriefcaseEvent {
    /// The database handle is about to be released
    BeforeClose,
    /// The database handle was released
    Closed,
}

/// A local copy of an iModel bound to one file.
pub struct BriefcaseEntry {
    imodel_id: IModelId,
    context_id: ContextId,
    briefcase_id: BriefcaseId,
    open_mode: OpenMode,
    sync_mode: SyncMode,
    pathname: PathBuf,
    /// Changeset the entry was opened for
    target_changeset_id: ChangeSetId,
    /// Bumped on close; suspended work compares it to detect supersession
    generation: AtomicU64,
    open: AtomicBool,
    /// Copy of the file's metadata, refreshed after every database call
    props: Mutex<BriefcaseProps>,
    db: AsyncMutex<Option<Box<dyn LocalDatabase>>>,
    events: Mutex<Observers<BriefcaseEvent>>,
}

impl std::fmt::Debug for BriefcaseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BriefcaseEntry")
            .field("imodel_id", &self.imodel_id)
            .field("briefcase_id", &self.briefcase_id)
            .field("open_mode", &self.open_mode)
            .field("sync_mode", &self.sync_mode)
            .field("pathname", &self.pathname)
            .field("open", &self.is_open())
            .finish()
    }
}

impl BriefcaseEntry {
    /// Bind an open database handle.
    pub fn new(db: Box<dyn LocalDatabase>, sync_mode: SyncMode) -> Self {
        let props = db.props().clone();
        Self {
            imodel_id: props.imodel_id.clone(),
            context_id: props.context_id.clone(),
            briefcase_id: props.briefcase_id,
            open_mode: db.open_mode(),
            sync_mode,
            pathname: db.path().to_path_buf(),
            target_changeset_id: props.current_changeset_id().clone(),
            generation: AtomicU64::new(0),
            open: AtomicBool::new(true),
            props: Mutex::new(props),
            db: AsyncMutex::new(Some(db)),
            events: Mutex::new(Observers::new()),
        }
    }

    pub fn imodel_id(&self) -> &str {
        &self.imodel_id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn briefcase_id(&self) -> BriefcaseId {
        self.briefcase_id
    }

    pub fn open_mode(&self) -> OpenMode {
        self.open_mode
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn pathname(&self) -> &Path {
        &self.pathname
    }

    /// Registry key of this entry.
    pub fn key(&self) -> String {
        self.pathname.display().to_string()
    }

    pub fn target_changeset_id(&self) -> &str {
        &self.target_changeset_id
    }

    /// Metadata as of the last database call.
    pub fn props(&self) -> BriefcaseProps {
        self.props
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn current_changeset_id(&self) -> ChangeSetId {
        self.props().current_changeset_id().clone()
    }

    pub fn current_index(&self) -> ChangeSetIndex {
        self.props().current_index()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Fail if the entry was closed since `generation` was observed.
    pub fn ensure_current(&self, generation: u64) -> BackendResult<()> {
        if !self.is_open() || self.generation() != generation {
            return Err(BackendError::Superseded(format!(
                "briefcase {} was closed",
                self.pathname.display()
            )));
        }
        Ok(())
    }

    /// Lock the database handle. Fails once the entry is closed.
    pub async fn db(&self) -> BackendResult<DbGuard<'_>> {
        let guard = self.db.lock().await;
        match MutexGuard::try_map(guard, |db| db.as_deref_mut()) {
            Ok(db) => Ok(DbGuard { entry: self, db }),
            Err(_) => Err(BackendError::state(format!(
                "briefcase {} is not open",
                self.pathname.display()
            ))),
        }
    }

    pub fn subscribe(&self, callback: impl FnMut(&BriefcaseEvent) + Send + 'static) -> SubscriptionId {
        self.with_events(|events| events.subscribe(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.with_events(|events| events.unsubscribe(id))
    }

    fn with_events<R>(&self, f: impl FnOnce(&mut Observers<BriefcaseEvent>) -> R) -> R {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut events)
    }

    fn refresh_props(&self, props: &BriefcaseProps) {
        let mut cached = self.props.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = props.clone();
    }

    /// Release the database handle. Closing twice is a no-op.
    pub async fn close(&self) -> BackendResult<()> {
        let mut guard = self.db.lock().await;
        let Some(mut db) = guard.take() else {
            return Ok(());
        };
        self.with_events(|events| events.notify(&BriefcaseEvent::BeforeClose));
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        let result = db.close();
        self.refresh_props(db.props());
        drop(guard);
        self.with_events(|events| events.notify(&BriefcaseEvent::Closed));
        tracing::debug!(path = %self.pathname.display(), "Closed briefcase");
        result.map_err(BackendError::from)
    }
}

/// Exclusive access to an entry's open database.
///
/// Dropping the guard refreshes the entry's cached metadata.
pub struct DbGuard<'a> {
    entry: &'a BriefcaseEntry,
    db: MappedMutexGuard<'a, dyn LocalDatabase>,
}

impl std::ops::Deref for DbGuard<'_> {
    type Target = dyn LocalDatabase;

    fn deref(&self) -> &Self::Target {
        &*self.db
    }
}

impl std::ops::DerefMut for DbGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.db
    }
}

impl Drop for DbGuard<'_> {
    fn drop(&mut self) {
        self.entry.refresh_props(self.db.props());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BriefcaseFile, JsonDatabase};
    use briefcase_engine::ElementProps;
    use std::sync::Arc;

    fn entry(dir: &Path) -> BriefcaseEntry {
        let props = BriefcaseProps::seed("im", "ctx", BriefcaseId::new(2), SyncMode::PullAndPush);
        let db = JsonDatabase::new(dir.join("bc.json"), OpenMode::ReadWrite, BriefcaseFile::new(props));
        BriefcaseEntry::new(Box::new(db), SyncMode::PullAndPush)
    }

    #[tokio::test]
    async fn close_supersedes_and_notifies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        entry.subscribe(move |e| log.lock().unwrap().push(*e));

        let generation = entry.generation();
        assert!(entry.ensure_current(generation).is_ok());
        entry.close().await.unwrap();
        entry.close().await.unwrap();

        assert!(matches!(
            entry.ensure_current(generation),
            Err(BackendError::Superseded(_))
        ));
        assert!(matches!(entry.db().await, Err(BackendError::State(_))));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![BriefcaseEvent::BeforeClose, BriefcaseEvent::Closed]
        );
    }

    #[tokio::test]
    async fn guard_refreshes_props() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry(dir.path());
        {
            let mut db = entry.db().await.unwrap();
            db.insert_element(ElementProps::new("0x20", "0x10", "Generic:PhysicalObject"))
                .unwrap();
            db.save_changes().unwrap();
        }
        assert_eq!(entry.current_index(), 0);
        assert_eq!(entry.key(), dir.path().join("bc.json").display().to_string());
        assert!(entry.is_open());
    }
}
