//! Core types for Kibana saved objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Space addressed when no `/s/{space}` prefix is used.
pub const DEFAULT_SPACE: &str = "default";

/// Saved object type used for spaces themselves.
pub const SPACE_TYPE: &str = "space";

/// Saved object type used for tags.
pub const TAG_TYPE: &str = "tag";

/// Object types checked for user content before a space is deleted.
///
/// Deleting a space deletes everything in it, so these are the types a
/// space is expected to hold. `config` is left out: Kibana creates one in
/// every space.
pub const SPACE_CONTENT_TYPES: &[&str] = &[
    "dashboard",
    "visualization",
    "lens",
    "search",
    "index-pattern",
    "map",
    "query",
    "tag",
];

/// Space attributes Kibana fills in on every read.
const SERVER_SPACE_FIELDS: &[&str] = &["id", "_reserved"];

/// Strip what Kibana adds to a space on its own, so a declared space and
/// the stored copy compare equal.
///
/// Removes server-owned fields, an empty `disabledFeatures` list and an
/// empty description.
pub fn normalize_space_attributes(attributes: &mut Value) {
    let Value::Object(map) = attributes else {
        return;
    };
    for field in SERVER_SPACE_FIELDS {
        map.remove(*field);
    }
    if map
        .get("disabledFeatures")
        .and_then(Value::as_array)
        .is_some_and(Vec::is_empty)
    {
        map.remove("disabledFeatures");
    }
    if map.get("description").and_then(Value::as_str) == Some("") {
        map.remove("description");
    }
}

/// A reference from one saved object to another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced object type
    #[serde(rename = "type")]
    pub object_type: String,
    /// Referenced object id
    pub id: String,
    /// Reference name, unique within the referencing object
    pub name: String,
}

impl Reference {
    /// Create a reference to a tag.
    pub fn tag(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            object_type: TAG_TYPE.to_string(),
            name: format!("tag-ref-{id}"),
            id,
        }
    }

    /// Check if this reference points at the given tag.
    pub fn is_tag(&self, id: &str) -> bool {
        self.object_type == TAG_TYPE && self.id == id
    }
}

/// A saved object as stored in one Kibana space.
///
/// Spaces themselves are represented with `object_type == "space"` and an
/// empty `space`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedObject {
    /// Space the object lives in (empty for spaces)
    pub space: String,
    /// Saved object type (dashboard, visualization, search, ...)
    #[serde(rename = "type")]
    pub object_type: String,
    /// Object id
    pub id: String,
    /// Type-specific attributes
    pub attributes: Value,
    /// Outgoing references, including tag references
    #[serde(default)]
    pub references: Vec<Reference>,
    /// Last modification reported by Kibana
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SavedObject {
    /// Create a saved object with no references.
    pub fn new(
        space: impl Into<String>,
        object_type: impl Into<String>,
        id: impl Into<String>,
        attributes: Value,
    ) -> Self {
        Self {
            space: space.into(),
            object_type: object_type.into(),
            id: id.into(),
            attributes,
            references: Vec::new(),
            updated_at: None,
        }
    }

    /// Whether this object is a space definition.
    pub fn is_space(&self) -> bool {
        self.object_type == SPACE_TYPE
    }

    /// Whether the object carries a reference to the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.references.iter().any(|r| r.is_tag(tag))
    }

    /// Add a tag reference if it is not already present.
    pub fn with_tag(mut self, tag: &str) -> Self {
        if !self.has_tag(tag) {
            self.references.push(Reference::tag(tag));
        }
        self
    }

    /// Human-readable `type/id@space` label.
    pub fn label(&self) -> String {
        if self.is_space() {
            format!("{}/{}", self.object_type, self.id)
        } else {
            format!("{}/{}@{}", self.object_type, self.id, self.space)
        }
    }
}
