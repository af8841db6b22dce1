//! Target connector - executes actions against one environment with retry

use crate::planner::Action;
use crate::types::{ManagementTags, ObservedResource, ResourceDefinition, ResourceKey};
use kibanakit::{
    Backend, CancelToken, Error, LogCallback, Result, RetryPolicy, SPACE_CONTENT_TYPES, SPACE_TYPE,
    SavedObject, Sleeper, TAG_TYPE, with_retry,
};
use std::sync::Arc;

/// Retrying client bound to one environment.
///
/// Every remote call goes through the retry policy. Writes are idempotent
/// per resource key: updates and disables overwrite by id, and a create
/// that finds its own earlier write completes as an overwrite.
///
/// A space is only deleted once it holds nothing but managed objects, since
/// Kibana removes a space together with its content.
pub struct TargetConnector {
    environment: String,
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    tags: ManagementTags,
    /// Types inspected before deleting a space
    content_types: Vec<String>,
}

impl TargetConnector {
    pub fn new(
        environment: impl Into<String>,
        backend: Arc<dyn Backend>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        tags: ManagementTags,
    ) -> Self {
        Self {
            environment: environment.into(),
            backend,
            policy,
            sleeper,
            tags,
            content_types: SPACE_CONTENT_TYPES.iter().map(ToString::to_string).collect(),
        }
    }

    /// Also inspect these types before deleting a space.
    #[must_use]
    pub fn with_content_types<'t>(mut self, types: impl IntoIterator<Item = &'t String>) -> Self {
        for object_type in types {
            if object_type != SPACE_TYPE && !self.content_types.contains(object_type) {
                self.content_types.push(object_type.clone());
            }
        }
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn call<T>(
        &self,
        operation: &str,
        cancel: &CancelToken,
        f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let operation = format!("{}: {operation}", self.environment);
        let callback = LogCallback {
            operation: &operation,
        };
        with_retry(&self.policy, self.sleeper.as_ref(), cancel, Some(&callback), f)
    }

    /// Managed resources of `types` in `space`.
    pub fn list(
        &self,
        space: &str,
        types: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<SavedObject>> {
        self.call(&format!("list {space}"), cancel, || {
            self.backend.find(space, types, &self.tags.marker)
        })
    }

    /// Create a declared resource.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Conflict` if an object without the management
    /// marker already holds the id.
    pub fn create(&self, desired: &ResourceDefinition, cancel: &CancelToken) -> Result<()> {
        let object = desired.to_saved_object();
        let label = desired.key.to_string();
        match self.call(&format!("create {label}"), cancel, || self.backend.create(&object)) {
            Err(Error::Conflict { .. }) => {}
            other => return other,
        }

        let key = &desired.key;
        let existing = self.call(&format!("get {label}"), cancel, || {
            self.backend.get(&key.space, &key.resource_type, &key.id)
        })?;
        match existing {
            Some(current) if current.has_tag(&self.tags.marker) => {
                log::debug!(
                    "{}: {label} already exists and is managed, overwriting",
                    self.environment
                );
                self.upsert(&label, &object, cancel)
            }
            Some(_) => Err(Error::Conflict {
                target: label,
                message: "an object not managed by this tool already uses this id".to_string(),
            }),
            None => self.call(&format!("create {label}"), cancel, || self.backend.create(&object)),
        }
    }

    /// Overwrite a deployed resource with its declaration.
    pub fn update(&self, desired: &ResourceDefinition, cancel: &CancelToken) -> Result<()> {
        self.upsert(&desired.key.to_string(), &desired.to_saved_object(), cancel)
    }

    /// Soft-delete an orphan by tagging it as disabled.
    pub fn disable(&self, observed: &ObservedResource, cancel: &CancelToken) -> Result<()> {
        let object = observed.to_disabled_object(&self.tags);
        self.upsert(&observed.key.to_string(), &object, cancel)
    }

    /// Remove an orphan. An object that is already gone counts as deleted.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Conflict` for a space that still holds objects
    /// without the management marker.
    pub fn delete(&self, key: &ResourceKey, cancel: &CancelToken) -> Result<()> {
        if key.is_space() {
            self.ensure_no_foreign_content(key, cancel)?;
        }
        let result = self.call(&format!("delete {key}"), cancel, || {
            self.backend.delete(&key.space, &key.resource_type, &key.id)
        });
        match result {
            Err(e) if e.is_ignorable() => {
                log::debug!("{}: {key} was already deleted", self.environment);
                Ok(())
            }
            other => other,
        }
    }

    fn ensure_no_foreign_content(&self, key: &ResourceKey, cancel: &CancelToken) -> Result<()> {
        let contents = self.call(&format!("list contents of {key}"), cancel, || {
            self.backend.find_all(&key.id, &self.content_types)
        })?;
        let foreign: Vec<String> = contents
            .iter()
            .filter(|o| !o.has_tag(&self.tags.marker))
            .filter(|o| !self.is_ownership_tag(o))
            .map(SavedObject::label)
            .collect();
        if foreign.is_empty() {
            return Ok(());
        }
        Err(Error::Conflict {
            target: key.to_string(),
            message: format!(
                "space {} still holds {} object(s) not managed by this tool: {}",
                key.id,
                foreign.len(),
                foreign.join(", ")
            ),
        })
    }

    /// The tag objects backing the marker and disabled references.
    fn is_ownership_tag(&self, object: &SavedObject) -> bool {
        object.object_type == TAG_TYPE
            && (object.id == self.tags.marker || object.id == self.tags.disabled)
    }

    fn upsert(&self, label: &str, object: &SavedObject, cancel: &CancelToken) -> Result<()> {
        self.call(&format!("write {label}"), cancel, || self.backend.upsert(object))
    }

    /// Perform one planned action. Actions without a remote effect succeed
    /// without any call.
    pub fn execute(&self, action: &Action, cancel: &CancelToken) -> Result<()> {
        match action {
            Action::Create { desired } => self.create(desired, cancel),
            Action::Update { desired, .. } => self.update(desired, cancel),
            Action::Disable { observed } => self.disable(observed, cancel),
            Action::Delete { observed } => self.delete(&observed.key, cancel),
            Action::FlagDrift { .. } | Action::Noop { .. } => Ok(()),
        }
    }
}
