//! Records and identifiers exchanged with the storage backend.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use url::Url;

macro_rules! storage_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
		pub struct $name(pub u64);

		impl $name {
			/// Sentinel returned by the backend when allocation fails.
			pub const INVALID: Self = Self(0);

			pub const fn is_valid(self) -> bool {
				self.0 != Self::INVALID.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}
	};
}

storage_id!(
	/// Backend-allocated registration identifier. Never reused.
	RegistrationId
);
storage_id!(
	/// Backend-allocated version identifier.
	VersionId
);
storage_id!(
	/// Backend-allocated script resource identifier.
	ResourceId
);

/// Partition under which registrations are namespaced.
///
/// The registry only compares keys; it never interprets them beyond extracting
/// the origin for storage policy bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey {
	origin: String,
	top_level_site: String,
}

impl StorageKey {
	pub fn new(origin: impl Into<String>, top_level_site: impl Into<String>) -> Self {
		Self {
			origin: origin.into(),
			top_level_site: top_level_site.into(),
		}
	}

	/// First-party key for `url`: origin and top-level site are the same.
	pub fn first_party(url: &Url) -> Self {
		let origin = url.origin().ascii_serialization();
		Self::new(origin.clone(), origin)
	}

	pub fn origin(&self) -> &str {
		&self.origin
	}

	pub fn top_level_site(&self) -> &str {
		&self.top_level_site
	}
}

impl fmt::Display for StorageKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.origin == self.top_level_site {
			f.write_str(&self.origin)
		} else {
			write!(f, "{}^{}", self.origin, self.top_level_site)
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptType {
	#[default]
	Classic,
	Module,
}

/// HTTP cache policy applied to update checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateViaCache {
	#[default]
	Imports,
	All,
	None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossOriginEmbedderPolicy {
	#[default]
	None,
	RequireCorp,
	Credentialless,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationPreloadState {
	pub enabled: bool,
	pub header: String,
}

impl Default for NavigationPreloadState {
	fn default() -> Self {
		Self {
			enabled: false,
			header: "true".to_string(),
		}
	}
}

/// Durable registration record.
///
/// At most one record exists per `(storage_key, scope)`; storing a record for an
/// occupied pair replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationData {
	pub registration_id: RegistrationId,
	pub scope: Url,
	pub storage_key: StorageKey,
	pub script: Url,
	pub script_type: ScriptType,
	pub update_via_cache: UpdateViaCache,
	pub version_id: VersionId,
	pub is_active: bool,
	pub has_fetch_handler: bool,
	pub last_update_check: Option<DateTime<Utc>>,
	pub used_features: BTreeSet<u32>,
	pub resources_total_size_bytes: u64,
	pub navigation_preload: NavigationPreloadState,
	pub cross_origin_embedder_policy: Option<CrossOriginEmbedderPolicy>,
	pub origin_trial_tokens: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
	pub resource_id: ResourceId,
	pub url: Url,
	pub size_bytes: u64,
	pub sha256_checksum: Option<String>,
}

/// Pins a stored version's resources in the backend while held.
///
/// The backend hands these out with lookup replies and fresh version ids. Once
/// every reference to a version is dropped, the backend may purge resources that
/// no stored record still points at.
pub struct LiveVersionRef {
	version_id: VersionId,
	_pin: Arc<dyn Any + Send + Sync>,
}

impl LiveVersionRef {
	pub fn new(version_id: VersionId, pin: Arc<dyn Any + Send + Sync>) -> Self {
		Self { version_id, _pin: pin }
	}

	pub fn version_id(&self) -> VersionId {
		self.version_id
	}
}

impl fmt::Debug for LiveVersionRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LiveVersionRef").field("version_id", &self.version_id).finish_non_exhaustive()
	}
}

/// Reply to the `find_*` and enumeration operations.
#[derive(Debug)]
pub struct FoundRegistration {
	pub registration: RegistrationData,
	pub resources: Vec<ResourceRecord>,
	pub version_reference: Option<LiveVersionRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreOutcome {
	/// Version whose record was superseded by this store, if any.
	pub deleted_version_id: Option<VersionId>,
	/// Bytes of resources released by the superseded record.
	pub deleted_resources_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteOutcome {
	pub deleted_resources_size: u64,
	/// True when no registration remains under the deleted record's storage key.
	pub storage_key_is_empty: bool,
}

/// A version the registry still holds in memory, reported during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveVersionInfo {
	pub version_id: VersionId,
	pub registration_id: RegistrationId,
	pub resource_ids: Vec<ResourceId>,
}

/// Per-origin storage policy delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyUpdate {
	pub origin: String,
	pub purge_on_shutdown: bool,
}
