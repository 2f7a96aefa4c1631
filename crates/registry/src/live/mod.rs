//! In-memory registration and version objects.
//!
//! At most one [`Registration`] and one [`Version`] exist per id at any time.
//! New objects are minted only through [`LiveObjects`] (for fresh ids) or the
//! registration cache (for storage replies), never constructed ad hoc by callers.
//!
//! # Key types
//!
//! | Type | Meaning |
//! |---|---|
//! | [`Registration`] | Scope plus its waiting/active versions and storage-derived flags |
//! | [`Version`] | One installed script iteration, with its resources and live reference |
//! | [`LiveObjects`] | Weak id tables shared by the cache and the connection manager |
//!
//! # Invariants
//!
//! - A deleted registration is never stored again.
//! - A version's reference is replaced only by recovery or when it had none.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use swreg_storage::{
	CrossOriginEmbedderPolicy, LiveVersionInfo, LiveVersionRef, NavigationPreloadState, RegistrationData, RegistrationId, ResourceId,
	ResourceRecord, ScriptType, StorageKey, UpdateViaCache, VersionId,
};
use url::Url;

mod context;

pub use context::LiveObjects;

/// Lifecycle status of a registration as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
	/// Not being uninstalled. May or may not be stored.
	#[default]
	Intact,
	/// Durable delete issued, reply pending.
	Uninstalling,
	/// Durable delete confirmed.
	Uninstalled,
}

#[derive(Debug, Default)]
struct RegistrationState {
	status: RegistrationStatus,
	stored: bool,
	deleted: bool,
	resources_total_size_bytes: u64,
	last_update_check: Option<DateTime<Utc>>,
	navigation_preload: NavigationPreloadState,
	update_via_cache: UpdateViaCache,
	active: Option<Arc<Version>>,
	waiting: Option<Arc<Version>>,
}

/// A live service worker registration.
#[derive(Debug)]
pub struct Registration {
	id: RegistrationId,
	scope: Url,
	key: StorageKey,
	script_type: ScriptType,
	state: Mutex<RegistrationState>,
}

impl Registration {
	pub(crate) fn new(id: RegistrationId, scope: Url, key: StorageKey, script_type: ScriptType, update_via_cache: UpdateViaCache) -> Self {
		Self {
			id,
			scope,
			key,
			script_type,
			state: Mutex::new(RegistrationState {
				update_via_cache,
				..RegistrationState::default()
			}),
		}
	}

	/// Builds a stored registration from a durable record.
	pub(crate) fn from_record(data: &RegistrationData, version: Arc<Version>) -> Self {
		let registration = Self::new(
			data.registration_id,
			data.scope.clone(),
			data.storage_key.clone(),
			data.script_type,
			data.update_via_cache,
		);
		{
			let mut state = registration.state.lock();
			state.stored = true;
			state.resources_total_size_bytes = data.resources_total_size_bytes;
			state.last_update_check = data.last_update_check;
			state.navigation_preload = data.navigation_preload.clone();
			if data.is_active {
				state.active = Some(version);
			} else {
				state.waiting = Some(version);
			}
		}
		registration
	}

	pub fn id(&self) -> RegistrationId {
		self.id
	}

	pub fn scope(&self) -> &Url {
		&self.scope
	}

	pub fn key(&self) -> &StorageKey {
		&self.key
	}

	/// Script type requested when the registration was created.
	pub fn script_type(&self) -> ScriptType {
		self.script_type
	}

	pub fn status(&self) -> RegistrationStatus {
		self.state.lock().status
	}

	pub(crate) fn set_status(&self, status: RegistrationStatus) {
		self.state.lock().status = status;
	}

	pub fn is_uninstalling(&self) -> bool {
		self.status() == RegistrationStatus::Uninstalling
	}

	/// True while a durable record for this registration is believed to exist.
	pub fn is_stored(&self) -> bool {
		self.state.lock().stored
	}

	pub(crate) fn set_stored(&self, stored: bool) {
		self.state.lock().stored = stored;
	}

	/// True once the durable delete has been confirmed.
	pub fn is_deleted(&self) -> bool {
		self.state.lock().deleted
	}

	pub(crate) fn mark_deleted(&self) {
		let mut state = self.state.lock();
		state.deleted = true;
		state.stored = false;
	}

	pub fn resources_total_size_bytes(&self) -> u64 {
		self.state.lock().resources_total_size_bytes
	}

	pub(crate) fn set_resources_total_size_bytes(&self, size: u64) {
		self.state.lock().resources_total_size_bytes = size;
	}

	pub fn last_update_check(&self) -> Option<DateTime<Utc>> {
		self.state.lock().last_update_check
	}

	pub fn set_last_update_check(&self, time: DateTime<Utc>) {
		self.state.lock().last_update_check = Some(time);
	}

	pub fn navigation_preload(&self) -> NavigationPreloadState {
		self.state.lock().navigation_preload.clone()
	}

	pub fn set_navigation_preload_enabled(&self, enabled: bool) {
		self.state.lock().navigation_preload.enabled = enabled;
	}

	pub fn set_navigation_preload_header(&self, header: impl Into<String>) {
		self.state.lock().navigation_preload.header = header.into();
	}

	pub fn update_via_cache(&self) -> UpdateViaCache {
		self.state.lock().update_via_cache
	}

	pub fn active_version(&self) -> Option<Arc<Version>> {
		self.state.lock().active.clone()
	}

	pub fn waiting_version(&self) -> Option<Arc<Version>> {
		self.state.lock().waiting.clone()
	}

	/// Puts `version` in the active slot, clearing it from the waiting slot if present.
	pub fn set_active_version(&self, version: Arc<Version>) {
		let mut state = self.state.lock();
		if state.waiting.as_ref().is_some_and(|w| w.id() == version.id()) {
			state.waiting = None;
		}
		state.active = Some(version);
	}

	pub fn set_waiting_version(&self, version: Arc<Version>) {
		self.state.lock().waiting = Some(version);
	}

	/// Snapshot of the fields surfaced by registration enumeration.
	pub fn info(&self) -> RegistrationInfo {
		let state = self.state.lock();
		RegistrationInfo {
			registration_id: self.id,
			scope: self.scope.clone(),
			storage_key: self.key.clone(),
			update_via_cache: state.update_via_cache,
			active_version_id: state.active.as_ref().map(|v| v.id()),
			waiting_version_id: state.waiting.as_ref().map(|v| v.id()),
			resources_total_size_bytes: state.resources_total_size_bytes,
			navigation_preload: state.navigation_preload.clone(),
		}
	}
}

/// Enumeration snapshot of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
	pub registration_id: RegistrationId,
	pub scope: Url,
	pub storage_key: StorageKey,
	pub update_via_cache: UpdateViaCache,
	pub active_version_id: Option<VersionId>,
	pub waiting_version_id: Option<VersionId>,
	pub resources_total_size_bytes: u64,
	pub navigation_preload: NavigationPreloadState,
}

impl From<&RegistrationData> for RegistrationInfo {
	fn from(data: &RegistrationData) -> Self {
		let (active_version_id, waiting_version_id) = if data.is_active {
			(Some(data.version_id), None)
		} else {
			(None, Some(data.version_id))
		};
		Self {
			registration_id: data.registration_id,
			scope: data.scope.clone(),
			storage_key: data.storage_key.clone(),
			update_via_cache: data.update_via_cache,
			active_version_id,
			waiting_version_id,
			resources_total_size_bytes: data.resources_total_size_bytes,
			navigation_preload: data.navigation_preload.clone(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VersionStatus {
	#[default]
	New,
	Installing,
	Installed,
	Activating,
	Activated,
	Redundant,
}

/// Whether the script registered a fetch event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchHandlerExistence {
	/// Not yet evaluated. A version in this state cannot be stored.
	#[default]
	Unknown,
	Exists,
	DoesNotExist,
}

#[derive(Debug, Default)]
struct VersionState {
	status: VersionStatus,
	fetch_handler: FetchHandlerExistence,
	resources: Vec<ResourceRecord>,
	used_features: BTreeSet<u32>,
	cross_origin_embedder_policy: Option<CrossOriginEmbedderPolicy>,
	origin_trial_tokens: Option<BTreeMap<String, Vec<String>>>,
	reference: Option<LiveVersionRef>,
}

/// A live service worker version.
#[derive(Debug)]
pub struct Version {
	id: VersionId,
	registration_id: RegistrationId,
	scope: Url,
	script_url: Url,
	script_type: ScriptType,
	state: Mutex<VersionState>,
}

impl Version {
	pub(crate) fn new(id: VersionId, registration_id: RegistrationId, scope: Url, script_url: Url, script_type: ScriptType) -> Self {
		Self {
			id,
			registration_id,
			scope,
			script_url,
			script_type,
			state: Mutex::new(VersionState::default()),
		}
	}

	/// Builds an installed (or activated) version from a durable record.
	pub(crate) fn from_record(data: &RegistrationData, resources: Vec<ResourceRecord>) -> Self {
		let version = Self::new(
			data.version_id,
			data.registration_id,
			data.scope.clone(),
			data.script.clone(),
			data.script_type,
		);
		{
			let mut state = version.state.lock();
			state.status = if data.is_active {
				VersionStatus::Activated
			} else {
				VersionStatus::Installed
			};
			state.fetch_handler = if data.has_fetch_handler {
				FetchHandlerExistence::Exists
			} else {
				FetchHandlerExistence::DoesNotExist
			};
			state.resources = resources;
			state.used_features = data.used_features.clone();
			state.cross_origin_embedder_policy = data.cross_origin_embedder_policy;
			state.origin_trial_tokens = data.origin_trial_tokens.clone();
		}
		version
	}

	pub fn id(&self) -> VersionId {
		self.id
	}

	pub fn registration_id(&self) -> RegistrationId {
		self.registration_id
	}

	pub fn scope(&self) -> &Url {
		&self.scope
	}

	pub fn script_url(&self) -> &Url {
		&self.script_url
	}

	pub fn script_type(&self) -> ScriptType {
		self.script_type
	}

	pub fn status(&self) -> VersionStatus {
		self.state.lock().status
	}

	pub fn set_status(&self, status: VersionStatus) {
		self.state.lock().status = status;
	}

	pub fn is_redundant(&self) -> bool {
		self.status() == VersionStatus::Redundant
	}

	pub fn fetch_handler_existence(&self) -> FetchHandlerExistence {
		self.state.lock().fetch_handler
	}

	pub fn set_fetch_handler_existence(&self, existence: FetchHandlerExistence) {
		self.state.lock().fetch_handler = existence;
	}

	pub fn resources(&self) -> Vec<ResourceRecord> {
		self.state.lock().resources.clone()
	}

	pub fn resource_ids(&self) -> Vec<ResourceId> {
		self.state.lock().resources.iter().map(|r| r.resource_id).collect()
	}

	/// Replaces the script resources written for this version.
	pub fn set_resources(&self, resources: Vec<ResourceRecord>) {
		self.state.lock().resources = resources;
	}

	pub fn used_features(&self) -> BTreeSet<u32> {
		self.state.lock().used_features.clone()
	}

	pub fn set_used_features(&self, features: BTreeSet<u32>) {
		self.state.lock().used_features = features;
	}

	pub fn cross_origin_embedder_policy(&self) -> Option<CrossOriginEmbedderPolicy> {
		self.state.lock().cross_origin_embedder_policy
	}

	pub fn set_cross_origin_embedder_policy(&self, policy: CrossOriginEmbedderPolicy) {
		self.state.lock().cross_origin_embedder_policy = Some(policy);
	}

	pub fn origin_trial_tokens(&self) -> Option<BTreeMap<String, Vec<String>>> {
		self.state.lock().origin_trial_tokens.clone()
	}

	pub fn set_origin_trial_tokens(&self, tokens: BTreeMap<String, Vec<String>>) {
		self.state.lock().origin_trial_tokens = Some(tokens);
	}

	/// True while the backend holds this version's resources pinned for us.
	pub fn has_live_reference(&self) -> bool {
		self.state.lock().reference.is_some()
	}

	/// Keeps `reference` unless one is already held.
	pub(crate) fn attach_reference(&self, reference: LiveVersionRef) {
		let mut state = self.state.lock();
		if state.reference.is_none() {
			state.reference = Some(reference);
		}
	}

	/// Swaps in a reference issued by a recovered connection.
	pub(crate) fn replace_reference(&self, reference: LiveVersionRef) {
		self.state.lock().reference = Some(reference);
	}

	pub(crate) fn live_info(&self) -> LiveVersionInfo {
		LiveVersionInfo {
			version_id: self.id,
			registration_id: self.registration_id,
			resource_ids: self.resource_ids(),
		}
	}
}
