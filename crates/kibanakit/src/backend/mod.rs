//! Backend traits and implementations for the Kibana APIs.
//!
//! [`http::HttpBackend`] talks to a live Kibana instance. [`MockBackend`]
//! keeps objects in memory and records every call, for tests that must not
//! touch the network.
//!
//! ```
//! use kibanakit::backend::{Backend, MockBackend};
//! use kibanakit::SavedObject;
//! use serde_json::json;
//!
//! let mock = MockBackend::new();
//! mock.insert(SavedObject::new("default", "dashboard", "a", json!({"title": "A"})).with_tag("managed"));
//!
//! let found = mock.find("default", &["dashboard".to_string()], "managed").unwrap();
//! assert_eq!(found.len(), 1);
//! ```

pub mod http;

use crate::error::{Error, Result};
use crate::types::{SPACE_TYPE, SavedObject};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Operations the reconciler needs from a Kibana instance.
///
/// All methods block. Implementations must be shareable across worker
/// threads.
pub trait Backend: Send + Sync {
    /// List objects of the given types in `space` that reference `tag`.
    ///
    /// For `types` containing `"space"`, spaces carrying the tag are
    /// returned regardless of `space`.
    fn find(&self, space: &str, types: &[String], tag: &str) -> Result<Vec<SavedObject>>;

    /// List every object of the given types in `space`, whatever its tags.
    /// Spaces themselves are never returned.
    fn find_all(&self, space: &str, types: &[String]) -> Result<Vec<SavedObject>>;

    /// Fetch a single object, `None` if it does not exist.
    fn get(&self, space: &str, object_type: &str, id: &str) -> Result<Option<SavedObject>>;

    /// Create an object.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if an object with the same id exists.
    fn create(&self, object: &SavedObject) -> Result<()>;

    /// Create or overwrite an object by id.
    fn upsert(&self, object: &SavedObject) -> Result<()>;

    /// Delete an object.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object does not exist.
    fn delete(&self, space: &str, object_type: &str, id: &str) -> Result<()>;
}

/// A call recorded by [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `find` in a space
    Find {
        /// Space searched
        space: String,
    },
    /// `get` of an object
    Get {
        /// `type/id@space`
        label: String,
    },
    /// `create` of an object
    Create {
        /// `type/id@space`
        label: String,
    },
    /// `upsert` of an object
    Upsert {
        /// `type/id@space`
        label: String,
    },
    /// `delete` of an object
    Delete {
        /// `type/id@space`
        label: String,
    },
}

impl MockCall {
    /// Whether the call changes remote state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Create { .. } | Self::Upsert { .. } | Self::Delete { .. }
        )
    }
}

type ObjectKey = (String, String, String);

#[derive(Debug, Default)]
struct MockState {
    objects: BTreeMap<ObjectKey, SavedObject>,
    calls: Vec<MockCall>,
    /// Errors returned by the next mutating calls on an object id, in order
    failures: HashMap<String, VecDeque<Error>>,
    /// Errors returned by the next `find` calls in a space, in order
    find_failures: HashMap<String, VecDeque<Error>>,
}

/// In-memory backend for testing without network access.
///
/// Clones share the same state, so a test can keep a handle while the
/// code under test owns another.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

fn key_of(space: &str, object_type: &str, id: &str) -> ObjectKey {
    let space = if object_type == SPACE_TYPE { "" } else { space };
    (space.to_string(), object_type.to_string(), id.to_string())
}

fn label_of(space: &str, object_type: &str, id: &str) -> String {
    if object_type == SPACE_TYPE {
        format!("{object_type}/{id}")
    } else {
        format!("{object_type}/{id}@{space}")
    }
}

impl MockBackend {
    /// Create a new empty mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object as if it already existed remotely.
    pub fn insert(&self, object: SavedObject) {
        let key = key_of(&object.space, &object.object_type, &object.id);
        self.state().objects.insert(key, object);
    }

    /// Look up a stored object.
    pub fn object(&self, space: &str, object_type: &str, id: &str) -> Option<SavedObject> {
        self.state()
            .objects
            .get(&key_of(space, object_type, id))
            .cloned()
    }

    /// All stored objects, ordered by `(space, type, id)`.
    pub fn objects(&self) -> Vec<SavedObject> {
        self.state().objects.values().cloned().collect()
    }

    /// Make the next mutating calls for object `id` fail with `errors`, in order.
    pub fn fail_next(&self, id: &str, errors: impl IntoIterator<Item = Error>) {
        self.state()
            .failures
            .entry(id.to_string())
            .or_default()
            .extend(errors);
    }

    /// Make the next `find` calls in `space` fail with `errors`, in order.
    pub fn fail_find(&self, space: &str, errors: impl IntoIterator<Item = Error>) {
        self.state()
            .find_failures
            .entry(space.to_string())
            .or_default()
            .extend(errors);
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Calls that change remote state.
    pub fn mutating_calls(&self) -> Vec<MockCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.is_mutating())
            .cloned()
            .collect()
    }

    fn take_failure(state: &mut MockState, id: &str) -> Option<Error> {
        state.failures.get_mut(id).and_then(VecDeque::pop_front)
    }
}

impl Backend for MockBackend {
    fn find(&self, space: &str, types: &[String], tag: &str) -> Result<Vec<SavedObject>> {
        let mut state = self.state();
        state.calls.push(MockCall::Find {
            space: space.to_string(),
        });
        if let Some(err) = state
            .find_failures
            .get_mut(space)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(state
            .objects
            .values()
            .filter(|o| types.contains(&o.object_type))
            .filter(|o| o.is_space() || o.space == space)
            .filter(|o| o.has_tag(tag))
            .cloned()
            .collect())
    }

    fn find_all(&self, space: &str, types: &[String]) -> Result<Vec<SavedObject>> {
        let mut state = self.state();
        state.calls.push(MockCall::Find {
            space: space.to_string(),
        });
        Ok(state
            .objects
            .values()
            .filter(|o| !o.is_space() && o.space == space)
            .filter(|o| types.contains(&o.object_type))
            .cloned()
            .collect())
    }

    fn get(&self, space: &str, object_type: &str, id: &str) -> Result<Option<SavedObject>> {
        let mut state = self.state();
        state.calls.push(MockCall::Get {
            label: label_of(space, object_type, id),
        });
        Ok(state.objects.get(&key_of(space, object_type, id)).cloned())
    }

    fn create(&self, object: &SavedObject) -> Result<()> {
        let mut state = self.state();
        let label = object.label();
        state.calls.push(MockCall::Create {
            label: label.clone(),
        });
        if let Some(err) = Self::take_failure(&mut state, &object.id) {
            return Err(err);
        }
        let key = key_of(&object.space, &object.object_type, &object.id);
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict {
                target: label,
                message: "object already exists".to_string(),
            });
        }
        state.objects.insert(key, object.clone());
        Ok(())
    }

    fn upsert(&self, object: &SavedObject) -> Result<()> {
        let mut state = self.state();
        state.calls.push(MockCall::Upsert {
            label: object.label(),
        });
        if let Some(err) = Self::take_failure(&mut state, &object.id) {
            return Err(err);
        }
        let key = key_of(&object.space, &object.object_type, &object.id);
        state.objects.insert(key, object.clone());
        Ok(())
    }

    fn delete(&self, space: &str, object_type: &str, id: &str) -> Result<()> {
        let mut state = self.state();
        let label = label_of(space, object_type, id);
        state.calls.push(MockCall::Delete {
            label: label.clone(),
        });
        if let Some(err) = Self::take_failure(&mut state, id) {
            return Err(err);
        }
        match state.objects.remove(&key_of(space, object_type, id)) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound { url: label }),
        }
    }
}
