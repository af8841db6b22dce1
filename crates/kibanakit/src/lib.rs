//! # kibanakit
//!
//! Blocking Rust client for the Kibana saved objects and spaces APIs.
//!
//! This crate provides:
//! - A [`Backend`] trait over the handful of calls a reconciler needs
//!   (find by tag, get, create, upsert, delete)
//! - An HTTP implementation ([`HttpBackend`]) and an in-memory one
//!   ([`MockBackend`]) for tests
//! - Categorised errors so transient failures can be told apart from
//!   terminal ones
//! - Retry with exponential backoff, jitter, a total wait budget and
//!   cooperative cancellation
//!
//! ## Example
//!
//! ```no_run
//! use kibanakit::{Backend, CancelToken, HttpBackend, RetryPolicy, ThreadSleeper, with_retry};
//! use std::time::Duration;
//!
//! let backend = HttpBackend::new("http://localhost:5601", Duration::from_secs(30));
//! let cancel = CancelToken::new();
//!
//! let managed = with_retry(&RetryPolicy::default(), &ThreadSleeper, &cancel, None, || {
//!     backend.find("default", &["dashboard".to_string()], "kibana-resource-sync")
//! })
//! .expect("listing failed");
//! println!("{} managed dashboards", managed.len());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cancel;
pub mod error;
pub mod retry;
pub mod types;

pub use backend::http::{HttpBackend, encode_segment};
pub use backend::{Backend, MockBackend, MockCall};
pub use cancel::CancelToken;
pub use error::{Error, ErrorCategory, Result};
pub use retry::{
    Classifier, LogCallback, RetryCallback, RetryPolicy, Sleeper, ThreadSleeper, with_retry,
};
pub use types::{
    DEFAULT_SPACE, Reference, SPACE_CONTENT_TYPES, SPACE_TYPE, SavedObject, TAG_TYPE,
    normalize_space_attributes,
};
