//! Element, model and relationship properties.

use crate::{Code, ElementId, ModelId};
use serde::{Deserialize, Serialize};

/// The persisted state of one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementProps {
    /// Unique identifier for this element
    pub id: ElementId,
    /// Model containing this element
    pub model_id: ModelId,
    /// Fully qualified class name, `Schema:Class`
    pub class_name: String,
    /// Business key; empty when the element has none
    #[serde(default)]
    pub code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_label: Option<String>,
    /// Class-specific properties
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl ElementProps {
    pub fn new(
        id: impl Into<ElementId>,
        model_id: impl Into<ModelId>,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            class_name: class_name.into(),
            code: Code::empty(),
            user_label: None,
            properties: serde_json::Value::Null,
        }
    }

    pub fn with_code(mut self, code: Code) -> Self {
        self.code = code;
        self
    }

    pub fn with_user_label(mut self, label: impl Into<String>) -> Self {
        self.user_label = Some(label.into());
        self
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    /// Schema part of the class name, if qualified.
    pub fn schema_name(&self) -> Option<&str> {
        self.class_name.split_once(':').map(|(schema, _)| schema)
    }
}

/// A model: the container elements live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProps {
    pub id: ModelId,
    /// The element this model breaks down
    pub modeled_element_id: ElementId,
    pub class_name: String,
}

impl ModelProps {
    pub fn new(
        id: impl Into<ModelId>,
        modeled_element_id: impl Into<ElementId>,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            modeled_element_id: modeled_element_id.into(),
            class_name: class_name.into(),
        }
    }
}

/// A link-table relationship between two elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipProps {
    pub class_name: String,
    pub source_id: ElementId,
    pub target_id: ElementId,
}

impl RelationshipProps {
    pub fn new(
        class_name: impl Into<String>,
        source_id: impl Into<ElementId>,
        target_id: impl Into<ElementId>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
        }
    }
}
