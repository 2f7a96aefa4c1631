//! Service worker registration registry.
//!
//! Tracks which service worker registrations exist for which scopes, keeps one
//! live object per registration and version id, and coordinates every read and
//! write against a storage backend that may disconnect at any time.
//!
//! # Key types
//!
//! | Type | Role |
//! |---|---|
//! | [`Registry`] | Public API: create, find, enumerate, store, delete, user data |
//! | [`Registration`] / [`Version`] | Live objects, shared via `Arc` |
//! | [`Completion`] | Single-shot reply of one registry operation |
//! | [`RegistryError`] | Failure status returned to callers |
//! | [`QuotaClient`] | Usage accounting collaborator |
//! | [`StoragePolicy`] | Session-only origin policy collaborator |
//! | [`RegistryObserver`] | Notifications for the owning context |
//!
//! # Failure classes
//!
//! A lost connection is transient: the registry rebinds, re-establishes live
//! version state through `recover`, and replays every unanswered call exactly
//! once. A database error other than `NotFound` is treated as corruption: storage
//! is disabled and wiped once, and every operation aborts until the wipe is done.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use swreg_registry::{Registry, RegistrationOptions};
//! use swreg_storage::{MemoryStorage, StorageKey};
//! use url::Url;
//!
//! # async fn demo() -> swreg_registry::Result<()> {
//! let registry = Registry::new(Arc::new(MemoryStorage::new()));
//! let scope = Url::parse("https://example.test/app/").unwrap();
//! let key = StorageKey::first_party(&scope);
//! let registration = registry
//! 	.create_new_registration(RegistrationOptions::new(scope), key)
//! 	.await?
//! 	.expect("fresh id");
//! registry.notify_installing(&registration);
//! # Ok(())
//! # }
//! ```

mod cache;
mod completion;
mod config;
mod connection;
mod error;
mod live;
mod observer;
mod policy;
mod quota;
mod registry;

pub use completion::Completion;
pub use config::RegistryConfig;
pub use connection::ConnectionMetrics;
pub use error::{RegistryError, Result};
pub use live::{FetchHandlerExistence, LiveObjects, Registration, RegistrationInfo, RegistrationStatus, Version, VersionStatus};
pub use observer::{NoOpObserver, RegistryObserver};
pub use policy::StoragePolicy;
pub use quota::{BucketLocator, QuotaClient, QuotaError};
pub use registry::{RegistrationOptions, Registry, RegistryBuilder};
