//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use briefcase_backend::{
    AuthorizedContext, BriefcaseManager, Config, HubClient, IModelDb, IModelVersion, InMemoryHub,
    JsonOpener, OpenParams,
};
use briefcase_engine::ElementProps;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const CONTEXT: &str = "project-1";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "briefcase_backend=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn ctx() -> AuthorizedContext {
    AuthorizedContext::for_token("test-token")
}

pub fn config(dir: &Path) -> Config {
    Config::new(dir).with_retry_delay(Duration::from_millis(5))
}

pub fn manager(hub: &Arc<InMemoryHub>, dir: &Path) -> Arc<BriefcaseManager> {
    manager_with(hub, config(dir), JsonOpener::new())
}

pub fn manager_with(
    hub: &Arc<InMemoryHub>,
    config: Config,
    opener: JsonOpener,
) -> Arc<BriefcaseManager> {
    let hub: Arc<dyn HubClient> = hub.clone();
    BriefcaseManager::new_shared(hub, Arc::new(opener), config)
}

/// Register an iModel on the hub without opening it.
pub async fn create_imodel(hub: &Arc<InMemoryHub>) -> String {
    hub.create_imodel(&ctx(), CONTEXT, "plant", "test plant")
        .await
        .unwrap()
        .id
}

pub async fn open_latest(manager: &Arc<BriefcaseManager>, imodel_id: &str) -> Arc<IModelDb> {
    open_at(manager, imodel_id, OpenParams::pull_and_push(), IModelVersion::Latest).await
}

pub async fn open_at(
    manager: &Arc<BriefcaseManager>,
    imodel_id: &str,
    params: OpenParams,
    version: IModelVersion,
) -> Arc<IModelDb> {
    manager
        .open(&ctx(), CONTEXT, imodel_id, params, version)
        .await
        .unwrap()
        .into_db()
        .expect("open should not time out")
}

pub fn pump(id: &str, label: &str) -> ElementProps {
    ElementProps::new(id, "0x10", "Generic:PhysicalObject").with_user_label(label)
}

pub async fn label_of(db: &IModelDb, id: &str) -> Option<String> {
    db.element(id).await.unwrap().and_then(|e| e.user_label)
}
