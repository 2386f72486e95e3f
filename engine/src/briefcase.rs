//! Briefcase identity and the metadata embedded in every briefcase file.

use crate::{ChangeSetId, ChangeSetIndex, ContextId, IModelId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer id the hub assigns to a briefcase when it is acquired.
///
/// Ids below [`BriefcaseId::FIRST_VALID`] and [`BriefcaseId::ILLEGAL`] are
/// reserved and never issued by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BriefcaseId(pub u32);

impl BriefcaseId {
    /// The master copy held by the hub.
    pub const MASTER: BriefcaseId = BriefcaseId(0);
    /// Sentinel for fixed-version briefcases and snapshots that can never push.
    pub const STANDALONE: BriefcaseId = BriefcaseId(1);
    /// Lowest id the hub hands out.
    pub const FIRST_VALID: BriefcaseId = BriefcaseId(2);
    /// Not a briefcase.
    pub const ILLEGAL: BriefcaseId = BriefcaseId(u32::MAX);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Whether this id was issued by the hub (and can therefore push).
    pub fn is_valid(&self) -> bool {
        *self >= Self::FIRST_VALID && *self != Self::ILLEGAL
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BriefcaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mode a briefcase file is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// How a briefcase relates to the hub timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Pinned to one changeset, read-only.
    FixedVersion,
    /// Follows the timeline and may push local changes.
    PullAndPush,
    /// A snapshot detached from the hub.
    None,
}

/// Whether closing a briefcase keeps its id and file for a later session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeepBriefcase {
    /// Keep the file and the hub-issued id (default for pull/push workflows).
    #[default]
    Yes,
    /// Delete the file and release the id back to the hub.
    No,
}

/// Metadata embedded in a briefcase file.
///
/// This is what lets a restarted process rediscover which iModel and which
/// timeline position a file on disk represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefcaseProps {
    pub imodel_id: IModelId,
    pub context_id: ContextId,
    pub briefcase_id: BriefcaseId,
    /// Id of the last changeset merged into this file ("" for the seed)
    pub changeset_id: ChangeSetId,
    /// Index of the last changeset merged into this file (0 for the seed)
    pub changeset_index: ChangeSetIndex,
    pub sync_mode: SyncMode,
    /// Set while changesets have been reversed; the file is then behind its tip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed: Option<ReversedPosition>,
}

/// Position a briefcase has been reversed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversedPosition {
    pub changeset_id: ChangeSetId,
    pub changeset_index: ChangeSetIndex,
}

impl BriefcaseProps {
    /// Props for a freshly created seed file.
    pub fn seed(
        imodel_id: impl Into<IModelId>,
        context_id: impl Into<ContextId>,
        briefcase_id: BriefcaseId,
        sync_mode: SyncMode,
    ) -> Self {
        Self {
            imodel_id: imodel_id.into(),
            context_id: context_id.into(),
            briefcase_id,
            changeset_id: ChangeSetId::new(),
            changeset_index: 0,
            sync_mode,
            reversed: None,
        }
    }

    /// Index of the changeset the content currently reflects.
    pub fn current_index(&self) -> ChangeSetIndex {
        self.reversed
            .as_ref()
            .map(|r| r.changeset_index)
            .unwrap_or(self.changeset_index)
    }

    /// Id of the changeset the content currently reflects.
    pub fn current_changeset_id(&self) -> &ChangeSetId {
        self.reversed
            .as_ref()
            .map(|r| &r.changeset_id)
            .unwrap_or(&self.changeset_id)
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed.is_some()
    }

    /// Record that the content now reflects the given changeset.
    ///
    /// Moving back to the tip clears the reversed marker.
    pub fn set_current(&mut self, changeset_id: ChangeSetId, index: ChangeSetIndex) {
        if index >= self.changeset_index {
            self.changeset_id = changeset_id;
            self.changeset_index = index;
            self.reversed = None;
        } else {
            self.reversed = Some(ReversedPosition {
                changeset_id,
                changeset_index: index,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_not_valid() {
        assert!(!BriefcaseId::MASTER.is_valid());
        assert!(!BriefcaseId::STANDALONE.is_valid());
        assert!(!BriefcaseId::ILLEGAL.is_valid());
        assert!(BriefcaseId::FIRST_VALID.is_valid());
        assert!(BriefcaseId::new(42).is_valid());
    }

    #[test]
    fn set_current_tracks_reversal() {
        let mut props = BriefcaseProps::seed("im", "ctx", BriefcaseId::new(2), SyncMode::PullAndPush);
        props.set_current("a".into(), 1);
        props.set_current("b".into(), 2);
        assert_eq!(props.current_index(), 2);
        assert!(!props.is_reversed());

        props.set_current("a".into(), 1);
        assert!(props.is_reversed());
        assert_eq!(props.current_index(), 1);
        assert_eq!(props.changeset_index, 2);
        assert_eq!(props.current_changeset_id(), "a");

        props.set_current("b".into(), 2);
        assert!(!props.is_reversed());
        assert_eq!(props.current_changeset_id(), "b");
    }

    #[test]
    fn props_serialization_format() {
        let props = BriefcaseProps::seed("im-1", "ctx-1", BriefcaseId::new(7), SyncMode::PullAndPush);
        let json = serde_json::to_string(&props).unwrap();
        assert!(json.contains("\"briefcaseId\":7"));
        assert!(json.contains("\"syncMode\":\"pullAndPush\""));
        assert!(!json.contains("reversed"));
        let parsed: BriefcaseProps = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, props);
    }
}
