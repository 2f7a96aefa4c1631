//! Registry facade.
//!
//! [`Registry`] composes the live object tables, the installing/uninstalling
//! cache and the connection manager behind one asynchronous API. Every operation
//! returns a [`Completion`]; whatever must be visible to concurrent callers
//! (the disabled check, the uninstalling mark on delete) has already happened
//! when the operation returns.
//!
//! # Lookup order
//!
//! | Operation | Order |
//! |---|---|
//! | [`Registry::find_registration_for_scope`] | installing set, storage, installing set |
//! | [`Registry::find_registration_for_client_url`] | storage, then longest installing scope |
//! | [`Registry::find_registration_for_id`] | live objects, storage, installing set |
//!
//! # Error policy
//!
//! Database errors other than `NotFound` (and `Disabled`, which only echoes a
//! reset already underway) schedule one wipe of the backend. Until that wipe
//! finishes every operation fails with [`RegistryError::Abort`] without reaching
//! storage.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use swreg_storage::{
	DatabaseError, RegistrationId, Remote, ResourceId, ScriptType, StorageBackend, StorageControl, StorageKey, UpdateViaCache, VersionId,
};
use tracing::{debug, trace};
use url::Url;

use crate::cache::RegistrationCache;
use crate::completion::Completion;
use crate::config::RegistryConfig;
use crate::connection::{ConnectionManager, ConnectionMetrics};
use crate::live::{LiveObjects, Registration, Version};
use crate::observer::{NoOpObserver, RegistryObserver};
use crate::policy::{PolicyTracker, StoragePolicy};
use crate::quota::{QuotaClient, QuotaNotifier};
use crate::{RegistryError, Result};

mod find;
mod maintenance;
mod store;
mod user_data;

/// Options for [`Registry::create_new_registration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOptions {
	pub scope: Url,
	pub script_type: ScriptType,
	pub update_via_cache: UpdateViaCache,
}

impl RegistrationOptions {
	pub fn new(scope: Url) -> Self {
		Self {
			scope,
			script_type: ScriptType::default(),
			update_via_cache: UpdateViaCache::default(),
		}
	}
}

#[derive(Debug, Default)]
struct StorageState {
	disabled: bool,
	reset_scheduled: bool,
	/// Storage keys with at least one stored registration, as far as we know.
	registered_keys: BTreeSet<StorageKey>,
}

struct RegistryInner {
	config: RegistryConfig,
	connection: ConnectionManager,
	live: Arc<LiveObjects>,
	cache: RegistrationCache,
	quota: QuotaNotifier,
	storage_policy: Option<Arc<dyn StoragePolicy>>,
	policy: Mutex<PolicyTracker>,
	observer: Arc<dyn RegistryObserver>,
	storage: Mutex<StorageState>,
}

/// Service worker registration registry.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Registry {
	inner: Arc<RegistryInner>,
}

/// Collaborators and settings for a [`Registry`].
pub struct RegistryBuilder {
	backend: Arc<dyn StorageBackend>,
	config: RegistryConfig,
	quota: Option<Arc<dyn QuotaClient>>,
	storage_policy: Option<Arc<dyn StoragePolicy>>,
	observer: Arc<dyn RegistryObserver>,
}

impl RegistryBuilder {
	pub fn config(mut self, config: RegistryConfig) -> Self {
		self.config = config;
		self
	}

	pub fn quota_client(mut self, client: Arc<dyn QuotaClient>) -> Self {
		self.quota = Some(client);
		self
	}

	pub fn storage_policy(mut self, policy: Arc<dyn StoragePolicy>) -> Self {
		self.storage_policy = Some(policy);
		self
	}

	pub fn observer(mut self, observer: Arc<dyn RegistryObserver>) -> Self {
		self.observer = observer;
		self
	}

	pub fn build(self) -> Registry {
		let live = Arc::new(LiveObjects::new());
		let connection = ConnectionManager::new(self.backend, Arc::clone(&live), self.config.max_recovery_retries);
		Registry {
			inner: Arc::new(RegistryInner {
				cache: RegistrationCache::new(Arc::clone(&live)),
				config: self.config,
				connection,
				live,
				quota: QuotaNotifier::new(self.quota),
				storage_policy: self.storage_policy,
				policy: Mutex::new(PolicyTracker::default()),
				observer: self.observer,
				storage: Mutex::new(StorageState::default()),
			}),
		}
	}
}

impl Registry {
	pub fn builder(backend: Arc<dyn StorageBackend>) -> RegistryBuilder {
		RegistryBuilder {
			backend,
			config: RegistryConfig::default(),
			quota: None,
			storage_policy: None,
			observer: Arc::new(NoOpObserver),
		}
	}

	/// Registry with default configuration and no collaborators.
	pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
		Self::builder(backend).build()
	}

	pub fn config(&self) -> &RegistryConfig {
		&self.inner.config
	}

	/// Creates a registration under a fresh id. Nothing is written to storage.
	///
	/// Resolves to `None` when the quota bucket cannot be resolved (no id is
	/// requested in that case) or when the backend hands out an invalid id.
	pub fn create_new_registration(&self, options: RegistrationOptions, key: StorageKey) -> Completion<Option<Arc<Registration>>> {
		if self.is_storage_disabled() {
			return Completion::ready(Ok(None));
		}
		let registry = self.clone();
		Completion::spawn(async move {
			if let Err(err) = registry.inner.quota.ensure_bucket(&key).await {
				debug!(key = %key, error = %err, "no quota bucket, registration not created");
				return Ok(None);
			}
			let id = registry
				.inner
				.connection
				.call("get_new_registration_id", |control| {
					async move { control.get_new_registration_id().await }.boxed()
				})
				.await?;
			if !id.is_valid() {
				debug!(scope = %options.scope, "invalid registration id");
				return Ok(None);
			}
			let registration = registry.inner.live.get_or_insert_registration_with(id, || {
				Registration::new(id, options.scope, key, options.script_type, options.update_via_cache)
			});
			Ok(Some(registration))
		})
	}

	/// Creates a version for `registration` under a fresh id.
	pub fn create_new_version(&self, registration: &Registration, script_url: Url, script_type: ScriptType) -> Completion<Option<Arc<Version>>> {
		if self.is_storage_disabled() {
			return Completion::ready(Ok(None));
		}
		let reply = self.inner.connection.call("get_new_version_id", |control| {
			async move { control.get_new_version_id().await }.boxed()
		});
		let live = Arc::clone(&self.inner.live);
		let registration_id = registration.id();
		let scope = registration.scope().clone();
		Completion::spawn(async move {
			let (id, reference) = reply.await?;
			if !id.is_valid() {
				debug!(registration = %registration_id, "invalid version id");
				return Ok(None);
			}
			let version = live.get_or_insert_version_with(id, || Version::new(id, registration_id, scope, script_url, script_type));
			if let Some(reference) = reference {
				version.attach_reference(reference);
			}
			Ok(Some(version))
		})
	}

	/// Allocates a resource id for a script about to be written.
	pub fn get_new_resource_id(&self) -> Completion<ResourceId> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.inner.connection.call("get_new_resource_id", |control| {
			async move { control.get_new_resource_id().await }.boxed()
		}))
	}

	/// Live registration for `id`, deleted or not.
	pub fn get_live_registration(&self, id: RegistrationId) -> Option<Arc<Registration>> {
		self.inner.live.registration(id)
	}

	pub fn get_live_version(&self, id: VersionId) -> Option<Arc<Version>> {
		self.inner.live.version(id)
	}

	/// Starts tracking `registration` as installing.
	///
	/// # Panics
	///
	/// Panics if it is already installing.
	pub fn notify_installing(&self, registration: &Arc<Registration>) {
		self.inner.cache.notify_installing(registration);
	}

	/// Stops tracking `registration` as installing. On failure the version's
	/// uncommitted resources are doomed.
	pub fn notify_done_installing(&self, registration: &Registration, version: &Version, status: Result<()>) {
		self.inner.cache.notify_done_installing(registration.id());
		let Err(err) = status else {
			return;
		};
		let resource_ids = version.resource_ids();
		debug!(registration = %registration.id(), version = %version.id(), error = %err, resources = resource_ids.len(), "install failed");
		if !resource_ids.is_empty() {
			let _ = self.doom_uncommitted_resources(registration.key().clone(), resource_ids);
		}
	}

	pub fn is_storage_disabled(&self) -> bool {
		self.inner.storage.lock().disabled
	}

	pub fn is_recovering(&self) -> bool {
		self.inner.connection.is_recovering()
	}

	/// Storage calls issued and not yet answered.
	pub fn inflight_calls(&self) -> usize {
		self.inner.connection.inflight_count()
	}

	pub fn connection_metrics(&self) -> ConnectionMetrics {
		self.inner.connection.metrics()
	}

	/// True while some stored registration exists for `origin`.
	pub fn is_tracking_origin(&self, origin: &str) -> bool {
		self.inner.policy.lock().is_tracking(origin)
	}

	/// Issues a database call and applies the registry's error policy to its reply.
	fn db_call<T, F>(&self, op: &'static str, invoker: F) -> impl Future<Output = Result<T>> + Send + 'static
	where
		T: Send + 'static,
		F: Fn(Arc<dyn StorageControl>) -> BoxFuture<'static, Remote<std::result::Result<T, DatabaseError>>> + Send + Sync + 'static,
	{
		let reply = self.inner.connection.call(op, invoker);
		let registry = self.clone();
		async move {
			match reply.await? {
				Ok(value) => Ok(value),
				Err(err) => Err(registry.on_database_error(op, err)),
			}
		}
	}

	/// [`Registry::db_call`] for resource bookkeeping: any database error is also
	/// reported to quota as a failed write.
	fn resource_call<F>(&self, op: &'static str, key: StorageKey, invoker: F) -> impl Future<Output = Result<()>> + Send + 'static
	where
		F: Fn(Arc<dyn StorageControl>) -> BoxFuture<'static, Remote<std::result::Result<(), DatabaseError>>> + Send + Sync + 'static,
	{
		let reply = self.inner.connection.call(op, invoker);
		let registry = self.clone();
		async move {
			match reply.await? {
				Ok(()) => Ok(()),
				Err(err) => {
					registry.inner.quota.write_failed(&key);
					Err(registry.on_database_error(op, err))
				}
			}
		}
	}

	fn on_database_error(&self, op: &'static str, err: DatabaseError) -> RegistryError {
		match err {
			DatabaseError::NotFound | DatabaseError::Disabled => trace!(op, error = %err, "benign database status"),
			_ => self.schedule_delete_and_start_over(op, err),
		}
		err.into()
	}

	/// Filters deleted registrations out of lookup results.
	fn found(&self, registration: Arc<Registration>) -> Result<Arc<Registration>> {
		if registration.is_deleted() {
			return Err(RegistryError::NotFound);
		}
		self.inner.quota.storage_accessed(registration.key());
		Ok(registration)
	}
}
