//! The hub: the central service that orders changesets and arbitrates
//! locks and codes.
//!
//! The manager only talks to the hub through [`HubClient`]. Every call takes
//! an [`AuthorizedContext`]; 409-class responses surface as typed
//! [`HubError`] variants.

use async_trait::async_trait;
use briefcase_engine::{
    BriefcaseId, ChangeSet, ChangeSetId, ChangeSetIndex, ChangeSetToken, Code, ContextId, IModelId,
    Lock,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors reported by the hub.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("pull is required before pushing")]
    PullIsRequired,

    #[error("iModel database is temporarily locked")]
    DatabaseTemporarilyLocked,

    #[error("another user is pushing")]
    AnotherUserPushing,

    #[error("{lock} is owned by briefcase {owner}")]
    LockOwnedByAnotherBriefcase { lock: String, owner: BriefcaseId },

    #[error("code {code} is reserved by briefcase {owner}")]
    CodeReservedByAnotherBriefcase { code: String, owner: BriefcaseId },

    #[error("changeset {0} already exists")]
    ChangeSetAlreadyExists(ChangeSetId),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),
}

impl HubError {
    /// Someone else pushed first; pulling and pushing again may succeed.
    pub fn is_push_retryable(&self) -> bool {
        matches!(
            self,
            HubError::PullIsRequired
                | HubError::DatabaseTemporarilyLocked
                | HubError::AnotherUserPushing
        )
    }
}

/// Credentials and correlation id for one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedContext {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Correlates every hub call made on behalf of one request
    pub activity_id: Uuid,
}

impl AuthorizedContext {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
            activity_id: Uuid::new_v4(),
        }
    }

    /// A context valid for the next hour.
    pub fn for_token(access_token: impl Into<String>) -> Self {
        Self::new(access_token, Utc::now() + Duration::hours(1))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Reject empty or expired credentials.
    pub fn validate(&self) -> Result<(), HubError> {
        if self.access_token.trim().is_empty() {
            return Err(HubError::Unauthorized("empty access token".into()));
        }
        if self.is_expired() {
            return Err(HubError::Unauthorized(format!(
                "access token expired at {}",
                self.expires_at
            )));
        }
        Ok(())
    }
}

/// Hub-side description of an iModel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IModelInfo {
    pub id: IModelId,
    pub context_id: ContextId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A version of an iModel to open or move to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum IModelVersion {
    /// The empty seed, before any changeset
    First,
    /// The tip of the timeline
    #[default]
    Latest,
    /// After the changeset with this id
    AsOfChangeSet(ChangeSetId),
    /// A named version
    Named(String),
}

impl IModelVersion {
    /// Stable key used to coalesce opens of the same version.
    pub fn key(&self) -> String {
        match self {
            IModelVersion::First => "first".to_string(),
            IModelVersion::Latest => "latest".to_string(),
            IModelVersion::AsOfChangeSet(id) => format!("cs:{}", id),
            IModelVersion::Named(name) => format!("named:{}", name),
        }
    }
}

/// A position on the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetPosition {
    pub id: ChangeSetId,
    pub index: ChangeSetIndex,
}

impl ChangeSetPosition {
    pub fn new(id: impl Into<ChangeSetId>, index: ChangeSetIndex) -> Self {
        Self {
            id: id.into(),
            index,
        }
    }

    /// The empty seed.
    pub fn seed() -> Self {
        Self::default()
    }
}

/// Index range filter for changeset queries: `after < index <= up_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSetQuery {
    pub after_index: ChangeSetIndex,
    pub up_to_index: Option<ChangeSetIndex>,
}

impl ChangeSetQuery {
    /// Every changeset of the iModel.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn after(index: ChangeSetIndex) -> Self {
        Self {
            after_index: index,
            up_to_index: None,
        }
    }

    pub fn between(after: ChangeSetIndex, up_to: ChangeSetIndex) -> Self {
        Self {
            after_index: after,
            up_to_index: Some(up_to),
        }
    }

    pub fn matches(&self, index: ChangeSetIndex) -> bool {
        index > self.after_index && self.up_to_index.map(|u| index <= u).unwrap_or(true)
    }
}

/// Outcome of a lock request: the locks that could not be granted.
pub type DeniedLocks = Vec<(Lock, BriefcaseId)>;

/// Client of the hub service.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Look up an iModel within a context.
    async fn get_imodel(
        &self,
        ctx: &AuthorizedContext,
        context_id: &str,
        imodel_id: &str,
    ) -> Result<IModelInfo, HubError>;

    /// Register a new, empty iModel.
    async fn create_imodel(
        &self,
        ctx: &AuthorizedContext,
        context_id: &str,
        name: &str,
        description: &str,
    ) -> Result<IModelInfo, HubError>;

    /// Check out a new briefcase id.
    async fn acquire_briefcase(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
    ) -> Result<BriefcaseId, HubError>;

    /// Return a briefcase id to the pool, dropping its locks and reservations.
    async fn release_briefcase(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<(), HubError>;

    /// Changeset tokens matching `query`, ascending by index.
    async fn get_changesets(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        query: ChangeSetQuery,
    ) -> Result<Vec<ChangeSetToken>, HubError>;

    /// Download the content of one changeset.
    async fn download_changeset(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        token: &ChangeSetToken,
    ) -> Result<ChangeSet, HubError>;

    /// Upload a changeset. It must directly follow the current tip.
    async fn upload_changeset(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        token: ChangeSetToken,
        changeset: ChangeSet,
    ) -> Result<ChangeSetToken, HubError>;

    /// Resolve a version to a timeline position.
    async fn resolve_version(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        version: &IModelVersion,
    ) -> Result<ChangeSetPosition, HubError>;

    /// Name the state after `changeset_id`.
    async fn create_named_version(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        name: &str,
        changeset_id: &str,
    ) -> Result<(), HubError>;

    /// Locks held by a briefcase.
    async fn query_locks(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<Vec<Lock>, HubError>;

    /// Acquire locks, granting what is compatible.
    async fn acquire_locks(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        locks: &[Lock],
    ) -> Result<DeniedLocks, HubError>;

    /// Release every lock a briefcase holds.
    async fn release_locks(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<(), HubError>;

    /// Codes reserved (and not yet used) by a briefcase.
    async fn query_codes(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
    ) -> Result<Vec<Code>, HubError>;

    /// Reserve codes. Returns the codes that are unavailable.
    async fn reserve_codes(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        codes: &[Code],
    ) -> Result<Vec<Code>, HubError>;

    /// Mark codes as used by a pushed changeset.
    async fn mark_codes_used(
        &self,
        ctx: &AuthorizedContext,
        imodel_id: &str,
        briefcase_id: BriefcaseId,
        codes: &[Code],
    ) -> Result<(), HubError>;
}
