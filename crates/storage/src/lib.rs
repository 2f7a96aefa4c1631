//! Storage collaborator contract for the service worker registry.
//!
//! The registry never touches durable state directly. Every read and write goes
//! through a [`StorageControl`] handle obtained from a [`StorageBackend`]. A handle
//! can die at any time (the backend may live in another process); calls on a dead
//! handle resolve to [`Disconnected`] and the caller is expected to rebind and
//! retry.
//!
//! # Key types
//!
//! | Type | Meaning |
//! |---|---|
//! | [`RegistrationData`] | Durable registration record, one per `(storage key, scope)` |
//! | [`ResourceRecord`] | One script resource owned by a stored version |
//! | [`FoundRegistration`] | Lookup reply: record, resources and a [`LiveVersionRef`] |
//! | [`DatabaseError`] | Database-layer failure carried inside a successful transport reply |
//! | [`Disconnected`] | Transport failure; the reply never arrived |
//! | [`MemoryStorage`] | Volatile backend with fault injection |
//!
//! # Reply shape
//!
//! Operations return [`Remote<T>`]. The outer `Result` is the transport, the inner
//! one (where present) is the database:
//!
//! ```ignore
//! match control.find_registration_for_scope(&scope, &key).await {
//!     Err(Disconnected) => { /* rebind and replay */ }
//!     Ok(Err(DatabaseError::NotFound)) => { /* benign miss */ }
//!     Ok(Err(other)) => { /* possible corruption */ }
//!     Ok(Ok(found)) => { /* materialize live objects */ }
//! }
//! ```

mod control;
mod error;
pub mod memory;
mod scope;
mod types;

pub use control::{Remote, StorageBackend, StorageControl};
pub use error::{DatabaseError, Disconnected};
pub use memory::MemoryStorage;
pub use scope::{LongestScopeMatcher, scope_matches};
pub use types::{
	CrossOriginEmbedderPolicy, DeleteOutcome, FoundRegistration, LiveVersionInfo, LiveVersionRef, NavigationPreloadState, PolicyUpdate,
	RegistrationData, RegistrationId, ResourceId, ResourceRecord, ScriptType, StorageKey, StoreOutcome, UpdateViaCache, VersionId,
};
