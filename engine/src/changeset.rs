//! Changesets and the timeline they form.
//!
//! A changeset is the unit a briefcase pushes: the net changes of its local
//! txns plus any imported schemas. Its id is derived from its content and its
//! parent, so two briefcases can never produce different changesets with the
//! same id.

use crate::{
    error::Result, BriefcaseId, Change, ChangeSetId, ChangeSetIndex, Error, Schema, Timestamp,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length in bytes of a changeset id before hex encoding.
const CHANGESET_ID_BYTES: usize = 20;

/// Content of a changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Id of the changeset this one follows ("" for the first)
    pub parent_id: ChangeSetId,
    /// Net element changes, in application order
    pub changes: Vec<Change>,
    /// Schemas imported by this changeset
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<Schema>,
}

impl ChangeSet {
    pub fn new(parent_id: impl Into<ChangeSetId>, changes: Vec<Change>) -> Self {
        Self {
            parent_id: parent_id.into(),
            changes,
            schemas: Vec::new(),
        }
    }

    /// Builder-style method to attach imported schemas.
    pub fn with_schemas(mut self, schemas: Vec<Schema>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.schemas.is_empty()
    }

    pub fn contains_schema_changes(&self) -> bool {
        !self.schemas.is_empty()
    }

    /// Content-derived id: hex of a truncated SHA-256 over parent and content.
    pub fn compute_id(&self) -> ChangeSetId {
        let mut hasher = Sha256::new();
        hasher.update(self.parent_id.as_bytes());
        hasher.update([0u8]);
        // Serializing a tree of structs and Vecs cannot fail.
        let body = serde_json::to_vec(&(&self.changes, &self.schemas)).unwrap_or_default();
        hasher.update(&body);
        let digest = hasher.finalize();
        hex::encode(&digest[..CHANGESET_ID_BYTES])
    }

    /// Check every change, and that no element is touched twice.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for change in &self.changes {
            change.validate()?;
            if !seen.insert(change.element_id.as_str()) {
                return Err(Error::InvalidChangeSet(format!(
                    "element {} changed more than once",
                    change.element_id
                )));
            }
        }
        Ok(())
    }

    /// The changeset that undoes this one.
    pub fn invert(&self) -> Vec<Change> {
        self.changes.iter().rev().map(Change::invert).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidChangeSet(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let changeset: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidChangeSet(e.to_string()))?;
        changeset.validate()?;
        Ok(changeset)
    }
}

/// Position and identity of a changeset on the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetToken {
    pub id: ChangeSetId,
    pub parent_id: ChangeSetId,
    /// Position on the timeline, starting at 1
    pub index: ChangeSetIndex,
    /// Local file holding the serialized content, once downloaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    /// When the hub accepted the changeset (milliseconds since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_date: Option<Timestamp>,
    #[serde(default)]
    pub contains_schema_changes: bool,
    #[serde(default)]
    pub description: String,
    /// Briefcase that pushed the changeset
    #[serde(default = "illegal_briefcase")]
    pub briefcase_id: BriefcaseId,
}

fn illegal_briefcase() -> BriefcaseId {
    BriefcaseId::ILLEGAL
}

impl ChangeSetToken {
    pub fn new(
        id: impl Into<ChangeSetId>,
        parent_id: impl Into<ChangeSetId>,
        index: ChangeSetIndex,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            index,
            pathname: None,
            push_date: None,
            contains_schema_changes: false,
            description: description.into(),
            briefcase_id: BriefcaseId::ILLEGAL,
        }
    }

    /// Token for a changeset about to be pushed on top of `parent_index`.
    pub fn for_push(
        changeset: &ChangeSet,
        parent_index: ChangeSetIndex,
        description: impl Into<String>,
        briefcase_id: BriefcaseId,
    ) -> Self {
        Self {
            contains_schema_changes: changeset.contains_schema_changes(),
            briefcase_id,
            ..Self::new(
                changeset.compute_id(),
                changeset.parent_id.clone(),
                parent_index + 1,
                description,
            )
        }
    }

    pub fn with_pathname(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = Some(pathname.into());
        self
    }

    /// Check that this token directly follows `parent` (or the seed when `None`).
    pub fn verify_follows(&self, parent: Option<&ChangeSetToken>) -> Result<()> {
        let (expected_index, expected_parent) = match parent {
            Some(p) => (p.index + 1, p.id.as_str()),
            None => (1, ""),
        };
        if self.index != expected_index {
            return Err(Error::OutOfOrderChangeSet {
                expected: expected_index,
                actual: self.index,
            });
        }
        if self.parent_id != expected_parent {
            return Err(Error::ParentMismatch {
                index: self.index,
                expected: expected_parent.to_string(),
                actual: self.parent_id.clone(),
            });
        }
        Ok(())
    }
}

/// The linear history of an iModel: tokens ordered by index from 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    tokens: Vec<ChangeSetToken>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a timeline from tokens, verifying the chain.
    pub fn from_tokens(tokens: Vec<ChangeSetToken>) -> Result<Self> {
        let mut timeline = Self::new();
        for token in tokens {
            timeline.append(token)?;
        }
        Ok(timeline)
    }

    /// Append a token; it must follow the current tip.
    pub fn append(&mut self, token: ChangeSetToken) -> Result<()> {
        token.verify_follows(self.tokens.last())?;
        self.tokens.push(token);
        Ok(())
    }

    /// Index of the tip (0 when empty).
    pub fn tip_index(&self) -> ChangeSetIndex {
        self.tokens.last().map(|t| t.index).unwrap_or(0)
    }

    /// Id of the tip ("" when empty).
    pub fn tip_id(&self) -> &str {
        self.tokens.last().map(|t| t.id.as_str()).unwrap_or("")
    }

    pub fn tip(&self) -> Option<&ChangeSetToken> {
        self.tokens.last()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, index: ChangeSetIndex) -> Option<&ChangeSetToken> {
        if index == 0 {
            return None;
        }
        self.tokens.get((index - 1) as usize)
    }

    /// Index of the changeset with the given id; "" is the seed at index 0.
    pub fn index_of(&self, id: &str) -> Option<ChangeSetIndex> {
        if id.is_empty() {
            return Some(0);
        }
        self.tokens.iter().find(|t| t.id == id).map(|t| t.index)
    }

    /// Tokens with `after < index <= up_to`, ascending.
    pub fn range(&self, after: ChangeSetIndex, up_to: ChangeSetIndex) -> &[ChangeSetToken] {
        let start = (after as usize).min(self.tokens.len());
        let end = (up_to as usize).min(self.tokens.len()).max(start);
        &self.tokens[start..end]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeSetToken> {
        self.tokens.iter()
    }
}

/// Check that `tokens` continue the timeline from (`after_id`, `after_index`)
/// in strict ascending order.
pub fn verify_sequence(
    after_id: &str,
    after_index: ChangeSetIndex,
    tokens: &[ChangeSetToken],
) -> Result<()> {
    let mut expected_parent = after_id.to_string();
    let mut expected_index = after_index + 1;
    for token in tokens {
        if token.index != expected_index {
            return Err(Error::OutOfOrderChangeSet {
                expected: expected_index,
                actual: token.index,
            });
        }
        if token.parent_id != expected_parent {
            return Err(Error::ParentMismatch {
                index: token.index,
                expected: expected_parent,
                actual: token.parent_id.clone(),
            });
        }
        expected_parent = token.id.clone();
        expected_index += 1;
    }
    Ok(())
}
