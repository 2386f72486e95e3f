//! Row-level changes.
//!
//! Every edit is captured as a [`Change`] holding the before and after image
//! of one element. Because both images are kept, a change can be verified
//! against the current state before it is applied and inverted to undo it.

use crate::{error::Result, ElementId, ElementProps, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbOpcode {
    Insert,
    Update,
    Delete,
}

/// How a changeset is being applied to a briefcase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyOption {
    /// Move forward on the timeline, merging with local changes
    Merge,
    /// Move forward again after a reversal
    Reinstate,
    /// Move backward on the timeline
    Reverse,
}

/// A change to one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub opcode: DbOpcode,
    pub element_id: ElementId,
    /// State before the change (absent for inserts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<ElementProps>,
    /// State after the change (absent for deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<ElementProps>,
}

impl Change {
    pub fn insert(after: ElementProps) -> Self {
        Self {
            opcode: DbOpcode::Insert,
            element_id: after.id.clone(),
            before: None,
            after: Some(after),
        }
    }

    pub fn update(before: ElementProps, after: ElementProps) -> Self {
        Self {
            opcode: DbOpcode::Update,
            element_id: after.id.clone(),
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(before: ElementProps) -> Self {
        Self {
            opcode: DbOpcode::Delete,
            element_id: before.id.clone(),
            before: Some(before),
            after: None,
        }
    }

    /// Build a change from optional images, or `None` when they are equal.
    fn from_images(
        element_id: ElementId,
        before: Option<ElementProps>,
        after: Option<ElementProps>,
    ) -> Option<Self> {
        let opcode = match (&before, &after) {
            (None, None) => return None,
            (Some(b), Some(a)) if a == b => return None,
            (None, Some(_)) => DbOpcode::Insert,
            (Some(_), None) => DbOpcode::Delete,
            (Some(_), Some(_)) => DbOpcode::Update,
        };
        Some(Self {
            opcode,
            element_id,
            before,
            after,
        })
    }

    /// The change that undoes this one.
    pub fn invert(&self) -> Self {
        let opcode = match self.opcode {
            DbOpcode::Insert => DbOpcode::Delete,
            DbOpcode::Update => DbOpcode::Update,
            DbOpcode::Delete => DbOpcode::Insert,
        };
        Self {
            opcode,
            element_id: self.element_id.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }

    /// Check that the images agree with the opcode and the element id.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidChange {
            element_id: self.element_id.clone(),
            reason: reason.to_string(),
        };
        match (self.opcode, &self.before, &self.after) {
            (DbOpcode::Insert, None, Some(_))
            | (DbOpcode::Update, Some(_), Some(_))
            | (DbOpcode::Delete, Some(_), None) => {}
            _ => return Err(invalid("images do not match opcode")),
        }
        let ids_match = self
            .before
            .iter()
            .chain(self.after.iter())
            .all(|props| props.id == self.element_id);
        if !ids_match {
            return Err(invalid("image id differs from element id"));
        }
        Ok(())
    }

    /// Model of the element, taken from the after image when present.
    pub fn model_id(&self) -> Option<&str> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|p| p.model_id.as_str())
    }
}

/// Collapse a sequence of changes into one net change per element.
///
/// Elements appear in the order they were first touched; changes whose net
/// effect is nothing (insert then delete, update back to the original) drop
/// out.
pub fn squash<'a>(changes: impl IntoIterator<Item = &'a Change>) -> Vec<Change> {
    let mut order: Vec<ElementId> = Vec::new();
    let mut net: HashMap<ElementId, (Option<ElementProps>, Option<ElementProps>)> = HashMap::new();

    for change in changes {
        match net.get_mut(&change.element_id) {
            Some((_, after)) => *after = change.after.clone(),
            None => {
                order.push(change.element_id.clone());
                net.insert(
                    change.element_id.clone(),
                    (change.before.clone(), change.after.clone()),
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| {
            let (before, after) = net.remove(&id)?;
            Change::from_images(id, before, after)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(label: &str) -> ElementProps {
        ElementProps::new("0x20", "0x10", "Generic:PhysicalObject").with_user_label(label)
    }

    #[test]
    fn invert_swaps_images() {
        let change = Change::update(props("a"), props("b"));
        let inverse = change.invert();
        assert_eq!(inverse.opcode, DbOpcode::Update);
        assert_eq!(inverse.before, Some(props("b")));
        assert_eq!(inverse.after, Some(props("a")));
        assert_eq!(inverse.invert(), change);

        assert_eq!(Change::insert(props("a")).invert().opcode, DbOpcode::Delete);
        assert_eq!(Change::delete(props("a")).invert().opcode, DbOpcode::Insert);
    }

    #[test]
    fn validate_rejects_mismatched_images() {
        assert!(Change::insert(props("a")).validate().is_ok());

        let mut bad = Change::insert(props("a"));
        bad.opcode = DbOpcode::Delete;
        assert!(bad.validate().is_err());

        let mut wrong_id = Change::update(props("a"), props("b"));
        wrong_id.element_id = "0x99".into();
        assert!(wrong_id.validate().is_err());
    }

    #[test]
    fn squash_insert_then_update_is_insert() {
        let changes = vec![Change::insert(props("a")), Change::update(props("a"), props("b"))];
        let net = squash(&changes);
        assert_eq!(net, vec![Change::insert(props("b"))]);
    }

    #[test]
    fn squash_insert_then_delete_is_nothing() {
        let changes = vec![Change::insert(props("a")), Change::delete(props("a"))];
        assert!(squash(&changes).is_empty());
    }

    #[test]
    fn squash_update_then_delete_is_delete_of_original() {
        let changes = vec![
            Change::update(props("a"), props("b")),
            Change::delete(props("b")),
        ];
        assert_eq!(squash(&changes), vec![Change::delete(props("a"))]);
    }

    #[test]
    fn squash_update_back_to_original_is_nothing() {
        let changes = vec![
            Change::update(props("a"), props("b")),
            Change::update(props("b"), props("a")),
        ];
        assert!(squash(&changes).is_empty());
    }

    #[test]
    fn squash_keeps_first_touch_order() {
        let other = ElementProps::new("0x21", "0x10", "Generic:PhysicalObject");
        let changes = vec![
            Change::insert(other.clone()),
            Change::insert(props("a")),
            Change::update(other.clone(), other.clone().with_user_label("x")),
        ];
        let net = squash(&changes);
        assert_eq!(net[0].element_id, "0x21");
        assert_eq!(net[1].element_id, "0x20");
    }
}
