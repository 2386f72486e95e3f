//! Schema definitions and the set of schemas imported into a briefcase.
//!
//! Schemas declare the classes elements may use. Importing one is a
//! repository-wide change: it needs the exclusive schema lock and marks the
//! changeset that carries it as containing schema changes.

use crate::{error::Result, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, versioned set of classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub name: String,
    pub version: SchemaVersion,
    /// Unqualified class names
    pub classes: Vec<String>,
}

impl Schema {
    pub fn new(name: impl Into<String>, version: SchemaVersion) -> Self {
        Self {
            name: name.into(),
            version,
            classes: Vec::new(),
        }
    }

    /// Builder-style method to add a class.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    /// Parse a schema document.
    pub fn from_json(json: &str) -> Result<Self> {
        let schema: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSchema(e.to_string()))?;
        if schema.name.is_empty() || schema.name.contains(':') {
            return Err(Error::InvalidSchema(format!(
                "invalid schema name '{}'",
                schema.name
            )));
        }
        Ok(schema)
    }
}

/// Schemas imported into one database, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaSet {
    schemas: BTreeMap<String, Schema>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values()
    }

    /// Import a schema.
    ///
    /// Returns `true` when the set changed. Re-importing the same version is
    /// a no-op and importing an older version is an error.
    pub fn import(&mut self, schema: Schema) -> Result<bool> {
        match self.schemas.get(&schema.name) {
            Some(existing) if existing.version > schema.version => Err(Error::SchemaDowngrade {
                name: schema.name,
                existing: existing.version,
                incoming: schema.version,
            }),
            Some(existing) if existing == &schema => Ok(false),
            _ => {
                self.schemas.insert(schema.name.clone(), schema);
                Ok(true)
            }
        }
    }

    /// Check a fully qualified class name.
    ///
    /// Classes of schemas that were never imported are domain classes the
    /// database already knows about, so only imported schemas are checked.
    pub fn validate_class(&self, class_name: &str) -> Result<()> {
        let (schema_name, class) = class_name
            .split_once(':')
            .ok_or_else(|| Error::ClassNotFound(class_name.to_string()))?;
        match self.schemas.get(schema_name) {
            Some(schema) if !schema.has_class(class) => {
                Err(Error::ClassNotFound(class_name.to_string()))
            }
            _ => Ok(()),
        }
    }
}
