//! ElementTable - the in-memory content of one briefcase.
//!
//! The table holds elements and imported schemas. Local edits go through
//! [`ElementTable::insert`], [`ElementTable::update`] and
//! [`ElementTable::delete`], each returning the [`Change`] it made. Changes
//! from elsewhere are replayed with [`ElementTable::apply_changes`], which
//! checks every before image against the current row and applies a whole
//! batch or nothing.

use crate::{
    error::Result, ApplyOption, Change, ChangeSet, DbOpcode, ElementId, ElementProps, Error,
    Schema, SchemaSet,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element rows and schemas. BTreeMap keeps serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementTable {
    elements: BTreeMap<ElementId, ElementProps>,
    #[serde(default)]
    schemas: SchemaSet,
}

impl ElementTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an element by ID.
    pub fn get(&self, id: &str) -> Option<&ElementProps> {
        self.elements.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// All elements in id order.
    pub fn elements(&self) -> impl Iterator<Item = &ElementProps> {
        self.elements.values()
    }

    /// Elements of one model in id order.
    pub fn elements_in_model<'a>(&'a self, model_id: &'a str) -> impl Iterator<Item = &'a ElementProps> {
        self.elements.values().filter(move |e| e.model_id == model_id)
    }

    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    /// Insert a new element.
    pub fn insert(&mut self, element: ElementProps) -> Result<Change> {
        self.schemas.validate_class(&element.class_name)?;
        if self.elements.contains_key(&element.id) {
            return Err(Error::ElementAlreadyExists(element.id));
        }
        let change = Change::insert(element.clone());
        self.elements.insert(element.id.clone(), element);
        Ok(change)
    }

    /// Replace an existing element.
    pub fn update(&mut self, element: ElementProps) -> Result<Change> {
        self.schemas.validate_class(&element.class_name)?;
        let current = self
            .elements
            .get_mut(&element.id)
            .ok_or_else(|| Error::ElementNotFound(element.id.clone()))?;
        let before = std::mem::replace(current, element.clone());
        Ok(Change::update(before, element))
    }

    /// Delete an element.
    pub fn delete(&mut self, id: &str) -> Result<Change> {
        let before = self
            .elements
            .remove(id)
            .ok_or_else(|| Error::ElementNotFound(id.to_string()))?;
        Ok(Change::delete(before))
    }

    /// Import a schema. Returns `true` when the schema set changed.
    pub fn import_schema(&mut self, schema: Schema) -> Result<bool> {
        self.schemas.import(schema)
    }

    /// Apply one change, verifying its before image.
    fn apply_one(&mut self, change: &Change) -> Result<()> {
        change.validate()?;
        let current = self.elements.get(&change.element_id);
        if current != change.before.as_ref() {
            return Err(match (current, change.opcode) {
                (Some(_), DbOpcode::Insert) => Error::ElementAlreadyExists(change.element_id.clone()),
                (None, _) => Error::ElementNotFound(change.element_id.clone()),
                _ => Error::StaleChange(change.element_id.clone()),
            });
        }
        match &change.after {
            Some(after) => {
                self.elements.insert(change.element_id.clone(), after.clone());
            }
            None => {
                self.elements.remove(&change.element_id);
            }
        }
        Ok(())
    }

    /// Apply a batch of changes in order, all or nothing.
    pub fn apply_changes(&mut self, changes: &[Change]) -> Result<()> {
        let backup = self.elements.clone();
        for change in changes {
            if let Err(e) = self.apply_one(change) {
                self.elements = backup;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Apply a changeset forward: schemas first, then element changes.
    pub fn apply_changeset(&mut self, changeset: &ChangeSet) -> Result<()> {
        self.apply_changeset_with(changeset, ApplyOption::Merge, "")
    }

    /// Apply a changeset in the given direction, all or nothing.
    ///
    /// `changeset_id` is only used to report irreversible changesets.
    pub fn apply_changeset_with(
        &mut self,
        changeset: &ChangeSet,
        option: ApplyOption,
        changeset_id: &str,
    ) -> Result<()> {
        match option {
            ApplyOption::Merge | ApplyOption::Reinstate => {
                let mut schemas = self.schemas.clone();
                for schema in &changeset.schemas {
                    schemas.import(schema.clone())?;
                }
                let previous = std::mem::replace(&mut self.schemas, schemas);
                if let Err(e) = self.apply_changes(&changeset.changes) {
                    self.schemas = previous;
                    return Err(e);
                }
                Ok(())
            }
            ApplyOption::Reverse => {
                if changeset.contains_schema_changes() {
                    return Err(Error::IrreversibleChangeSet(changeset_id.to_string()));
                }
                self.apply_changes(&changeset.invert())
            }
        }
    }

    /// Deterministic JSON of the logical content.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidChangeSet(e.to_string()))
    }
}
