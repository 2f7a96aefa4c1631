//! Volatile storage backend.
//!
//! [`MemoryStorage`] keeps every record in process memory and implements the full
//! [`StorageControl`] contract. It doubles as the test backend for the registry,
//! so it can also misbehave on request:
//!
//! - [`MemoryStorage::fail_next`] makes the next call of an operation report a
//!   database error.
//! - [`MemoryStorage::hold`] parks every call (except `recover`) until
//!   [`MemoryStorage::release`] or a disconnect.
//! - [`MemoryStorage::hold_recovery`] parks `recover` alone until
//!   [`MemoryStorage::release_recovery`], keeping the registry in its recovering
//!   phase.
//! - [`MemoryStorage::disconnect`] kills every handle handed out so far. Parked
//!   calls on those handles resolve to [`Disconnected`].
//! - [`MemoryStorage::disconnect_on`] disconnects from inside the next calls of an
//!   operation, which is how a connection lost during recovery is simulated.
//!
//! Operation names used by the fault and counter APIs are the [`StorageControl`]
//! method names, e.g. `"store_registration"`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};
use url::Url;

use crate::control::{Remote, StorageBackend, StorageControl};
use crate::error::{DatabaseError, Disconnected};
use crate::types::{
	DeleteOutcome, FoundRegistration, LiveVersionInfo, LiveVersionRef, PolicyUpdate, RegistrationData, RegistrationId, ResourceId,
	ResourceRecord, StorageKey, StoreOutcome, VersionId,
};

mod database;

use database::{Database, StoredRegistration};

#[derive(Debug, Default)]
struct Faults {
	fail_next: HashMap<&'static str, VecDeque<DatabaseError>>,
	disconnect_on: HashMap<&'static str, usize>,
	invalid_ids: bool,
}

struct MemoryInner {
	db: Mutex<Database>,
	faults: Mutex<Faults>,
	calls: Mutex<HashMap<&'static str, usize>>,
	/// Bumped on every recorded call so waiters can re-check counts.
	call_tick: watch::Sender<u64>,
	/// Connection epoch; handles bound under an older epoch are dead.
	epoch: watch::Sender<u64>,
	/// True while calls are parked.
	gate: watch::Sender<bool>,
	/// True while `recover` is parked.
	recovery_gate: watch::Sender<bool>,
	pins: Mutex<Vec<(VersionId, Weak<()>)>>,
	policy_updates: Mutex<Vec<PolicyUpdate>>,
}

impl MemoryInner {
	fn record_call(&self, op: &'static str) {
		*self.calls.lock().entry(op).or_default() += 1;
		self.call_tick.send_modify(|tick| *tick += 1);
		trace!(op, "memory storage call");
	}

	fn disconnect(&self) {
		self.pins.lock().clear();
		self.epoch.send_modify(|epoch| *epoch += 1);
		debug!(epoch = *self.epoch.borrow(), "memory storage disconnected");
	}

	fn pin(&self, version_id: VersionId) -> LiveVersionRef {
		let pin = Arc::new(());
		self.pins.lock().push((version_id, Arc::downgrade(&pin)));
		LiveVersionRef::new(version_id, pin)
	}

	fn pinned_versions(&self) -> BTreeSet<VersionId> {
		let mut pins = self.pins.lock();
		pins.retain(|(_, pin)| pin.strong_count() > 0);
		pins.iter().map(|(id, _)| *id).collect()
	}

	fn run<T>(&self, op: &'static str, f: impl FnOnce(&mut Database) -> Result<T, DatabaseError>) -> Result<T, DatabaseError> {
		if let Some(err) = self.faults.lock().fail_next.get_mut(op).and_then(VecDeque::pop_front) {
			debug!(op, error = %err, "memory storage injected failure");
			return Err(err);
		}
		let mut db = self.db.lock();
		if db.disabled {
			return Err(DatabaseError::Disabled);
		}
		f(&mut *db)
	}

	fn found(&self, stored: StoredRegistration) -> FoundRegistration {
		let reference = self.pin(stored.data.version_id);
		FoundRegistration {
			registration: stored.data,
			resources: stored.resources,
			version_reference: Some(reference),
		}
	}
}

/// In-memory [`StorageBackend`].
#[derive(Clone)]
pub struct MemoryStorage {
	inner: Arc<MemoryInner>,
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(MemoryInner {
				db: Mutex::new(Database::default()),
				faults: Mutex::new(Faults::default()),
				calls: Mutex::new(HashMap::new()),
				call_tick: watch::channel(0).0,
				epoch: watch::channel(0).0,
				gate: watch::channel(false).0,
				recovery_gate: watch::channel(false).0,
				pins: Mutex::new(Vec::new()),
				policy_updates: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Sets the id handed out by the next `get_new_registration_id`.
	pub fn set_next_registration_id(&self, id: u64) {
		self.inner.db.lock().set_next_registration_id(id);
	}

	/// Writes a record directly, bypassing connections and fault injection.
	pub fn insert_registration(&self, data: RegistrationData, resources: Vec<ResourceRecord>) -> Result<StoreOutcome, DatabaseError> {
		self.inner.db.lock().store(data, resources)
	}

	/// Number of calls made to `op` across all handles.
	pub fn call_count(&self, op: &str) -> usize {
		self.inner.calls.lock().get(op).copied().unwrap_or(0)
	}

	/// Waits until `op` has been called at least `count` times.
	pub async fn wait_for_calls(&self, op: &str, count: usize) {
		let mut tick = self.inner.call_tick.subscribe();
		while self.call_count(op) < count {
			if tick.changed().await.is_err() {
				return;
			}
		}
	}

	/// Makes the next call of `op` fail with `error`. Calls queue up.
	pub fn fail_next(&self, op: &'static str, error: DatabaseError) {
		self.inner.faults.lock().fail_next.entry(op).or_default().push_back(error);
	}

	/// Makes the next `times` calls of `op` drop the connection instead of replying.
	pub fn disconnect_on(&self, op: &'static str, times: usize) {
		*self.inner.faults.lock().disconnect_on.entry(op).or_default() += times;
	}

	/// Makes id allocation return the invalid sentinel.
	pub fn fail_id_allocation(&self, fail: bool) {
		self.inner.faults.lock().invalid_ids = fail;
	}

	pub fn hold(&self) {
		self.inner.gate.send_replace(true);
	}

	pub fn release(&self) {
		self.inner.gate.send_replace(false);
	}

	pub fn hold_recovery(&self) {
		self.inner.recovery_gate.send_replace(true);
	}

	pub fn release_recovery(&self) {
		self.inner.recovery_gate.send_replace(false);
	}

	pub fn disconnect(&self) {
		self.inner.disconnect();
	}

	pub fn registration(&self, id: RegistrationId) -> Option<RegistrationData> {
		self.inner.db.lock().record(id).map(|r| r.data.clone())
	}

	pub fn registration_count(&self) -> usize {
		self.inner.db.lock().records().count()
	}

	pub fn user_data(&self, id: RegistrationId, key: &str) -> Option<String> {
		let db = self.inner.db.lock();
		db.record(id)?;
		db.get_user_data(id, &[key.to_string()]).ok()?.pop()
	}

	pub fn uncommitted_resource_ids(&self) -> BTreeSet<ResourceId> {
		self.inner.db.lock().uncommitted().clone()
	}

	pub fn purgeable_resource_ids(&self) -> BTreeSet<ResourceId> {
		self.inner.db.lock().purgeable().clone()
	}

	/// Versions for which some [`LiveVersionRef`] from the current epoch is alive.
	pub fn pinned_versions(&self) -> BTreeSet<VersionId> {
		self.inner.pinned_versions()
	}

	pub fn policy_updates(&self) -> Vec<PolicyUpdate> {
		self.inner.policy_updates.lock().clone()
	}

	pub fn is_disabled(&self) -> bool {
		self.inner.db.lock().disabled
	}
}

impl StorageBackend for MemoryStorage {
	fn connect(&self) -> Arc<dyn StorageControl> {
		let epoch = *self.inner.epoch.borrow();
		trace!(epoch, "memory storage connect");
		Arc::new(MemoryConnection {
			inner: Arc::clone(&self.inner),
			epoch,
		})
	}
}

/// Handle bound to one [`MemoryStorage`] epoch.
struct MemoryConnection {
	inner: Arc<MemoryInner>,
	epoch: u64,
}

impl MemoryConnection {
	fn is_alive(&self) -> bool {
		*self.inner.epoch.borrow() == self.epoch
	}

	/// Admits one call: counts it, parks while held, applies injected disconnects.
	async fn enter(&self, op: &'static str) -> Remote<()> {
		self.inner.record_call(op);
		let gate = if op == "recover" { &self.inner.recovery_gate } else { &self.inner.gate };
		self.wait_released(gate).await?;
		if !self.is_alive() {
			return Err(Disconnected);
		}
		let inject = {
			let mut faults = self.inner.faults.lock();
			match faults.disconnect_on.get_mut(op) {
				Some(remaining) if *remaining > 0 => {
					*remaining -= 1;
					true
				}
				_ => false,
			}
		};
		if inject {
			self.inner.disconnect();
			return Err(Disconnected);
		}
		Ok(())
	}

	async fn wait_released(&self, gate: &watch::Sender<bool>) -> Remote<()> {
		let mut gate = gate.subscribe();
		let mut epoch = self.inner.epoch.subscribe();
		loop {
			if *epoch.borrow_and_update() != self.epoch {
				return Err(Disconnected);
			}
			if !*gate.borrow_and_update() {
				return Ok(());
			}
			tokio::select! {
				_ = gate.changed() => {}
				_ = epoch.changed() => {}
			}
		}
	}

	async fn db_call<T: Send>(
		&self,
		op: &'static str,
		f: impl FnOnce(&mut Database) -> Result<T, DatabaseError> + Send,
	) -> Remote<Result<T, DatabaseError>> {
		self.enter(op).await?;
		Ok(self.inner.run(op, f))
	}

	fn new_id<T>(&self, allocate: impl FnOnce(&mut Database) -> T, invalid: T) -> T {
		if self.inner.faults.lock().invalid_ids {
			return invalid;
		}
		allocate(&mut *self.inner.db.lock())
	}
}

#[async_trait]
impl StorageControl for MemoryConnection {
	async fn closed(&self) {
		let mut epoch = self.inner.epoch.subscribe();
		while *epoch.borrow_and_update() == self.epoch {
			if epoch.changed().await.is_err() {
				return;
			}
		}
	}

	async fn get_registered_storage_keys(&self) -> Remote<Vec<StorageKey>> {
		self.enter("get_registered_storage_keys").await?;
		Ok(self.inner.db.lock().storage_keys())
	}

	async fn find_registration_for_client_url(&self, client_url: &Url, key: &StorageKey) -> Remote<Result<FoundRegistration, DatabaseError>> {
		let found = self
			.db_call("find_registration_for_client_url", |db| db.find_for_client_url(client_url, key))
			.await?;
		Ok(found.map(|stored| self.inner.found(stored)))
	}

	async fn find_registration_for_scope(&self, scope: &Url, key: &StorageKey) -> Remote<Result<FoundRegistration, DatabaseError>> {
		let found = self.db_call("find_registration_for_scope", |db| db.find_for_scope(scope, key)).await?;
		Ok(found.map(|stored| self.inner.found(stored)))
	}

	async fn find_registration_for_id(
		&self,
		registration_id: RegistrationId,
		key: Option<&StorageKey>,
	) -> Remote<Result<FoundRegistration, DatabaseError>> {
		let found = self
			.db_call("find_registration_for_id", |db| db.find_for_id(registration_id, key))
			.await?;
		Ok(found.map(|stored| self.inner.found(stored)))
	}

	async fn get_registrations_for_storage_key(&self, key: &StorageKey) -> Remote<Result<Vec<FoundRegistration>, DatabaseError>> {
		let found = self
			.db_call("get_registrations_for_storage_key", |db| Ok(db.for_storage_key(key)))
			.await?;
		Ok(found.map(|all| all.into_iter().map(|stored| self.inner.found(stored)).collect()))
	}

	async fn get_all_registrations(&self) -> Remote<Result<Vec<RegistrationData>, DatabaseError>> {
		self.db_call("get_all_registrations", |db| Ok(db.records().map(|r| r.data.clone()).collect()))
			.await
	}

	async fn store_registration(
		&self,
		registration: RegistrationData,
		resources: Vec<ResourceRecord>,
	) -> Remote<Result<StoreOutcome, DatabaseError>> {
		self.db_call("store_registration", move |db| db.store(registration, resources)).await
	}

	async fn delete_registration(&self, registration_id: RegistrationId, key: &StorageKey) -> Remote<Result<DeleteOutcome, DatabaseError>> {
		self.db_call("delete_registration", |db| db.delete(registration_id, key)).await
	}

	async fn update_to_active_state(&self, registration_id: RegistrationId, key: &StorageKey) -> Remote<Result<(), DatabaseError>> {
		self.db_call("update_to_active_state", |db| db.update_to_active_state(registration_id, key))
			.await
	}

	async fn update_last_update_check_time(
		&self,
		registration_id: RegistrationId,
		key: &StorageKey,
		time: DateTime<Utc>,
	) -> Remote<Result<(), DatabaseError>> {
		self.db_call("update_last_update_check_time", |db| db.update_last_update_check_time(registration_id, key, time))
			.await
	}

	async fn update_navigation_preload_enabled(
		&self,
		registration_id: RegistrationId,
		key: &StorageKey,
		enable: bool,
	) -> Remote<Result<(), DatabaseError>> {
		self.db_call("update_navigation_preload_enabled", |db| {
			db.update_navigation_preload_enabled(registration_id, key, enable)
		})
		.await
	}

	async fn update_navigation_preload_header(
		&self,
		registration_id: RegistrationId,
		key: &StorageKey,
		value: &str,
	) -> Remote<Result<(), DatabaseError>> {
		self.db_call("update_navigation_preload_header", |db| {
			db.update_navigation_preload_header(registration_id, key, value)
		})
		.await
	}

	async fn get_new_registration_id(&self) -> Remote<RegistrationId> {
		self.enter("get_new_registration_id").await?;
		Ok(self.new_id(Database::new_registration_id, RegistrationId::INVALID))
	}

	async fn get_new_version_id(&self) -> Remote<(VersionId, Option<LiveVersionRef>)> {
		self.enter("get_new_version_id").await?;
		let id = self.new_id(Database::new_version_id, VersionId::INVALID);
		if !id.is_valid() {
			return Ok((id, None));
		}
		Ok((id, Some(self.inner.pin(id))))
	}

	async fn get_new_resource_id(&self) -> Remote<ResourceId> {
		self.enter("get_new_resource_id").await?;
		Ok(self.new_id(Database::new_resource_id, ResourceId::INVALID))
	}

	async fn store_uncommitted_resource_id(&self, resource_id: ResourceId) -> Remote<Result<(), DatabaseError>> {
		self.db_call("store_uncommitted_resource_id", |db| db.store_uncommitted(resource_id))
			.await
	}

	async fn doom_uncommitted_resources(&self, resource_ids: &[ResourceId]) -> Remote<Result<(), DatabaseError>> {
		self.db_call("doom_uncommitted_resources", |db| db.doom_uncommitted(resource_ids))
			.await
	}

	async fn get_user_data(&self, registration_id: RegistrationId, keys: &[String]) -> Remote<Result<Vec<String>, DatabaseError>> {
		self.db_call("get_user_data", |db| db.get_user_data(registration_id, keys)).await
	}

	async fn get_user_data_by_key_prefix(&self, registration_id: RegistrationId, prefix: &str) -> Remote<Result<Vec<String>, DatabaseError>> {
		self.db_call("get_user_data_by_key_prefix", |db| db.get_user_data_by_key_prefix(registration_id, prefix))
			.await
	}

	async fn get_user_keys_and_data_by_key_prefix(
		&self,
		registration_id: RegistrationId,
		prefix: &str,
	) -> Remote<Result<BTreeMap<String, String>, DatabaseError>> {
		self.db_call("get_user_keys_and_data_by_key_prefix", |db| {
			db.get_user_keys_and_data_by_key_prefix(registration_id, prefix)
		})
		.await
	}

	async fn store_user_data(
		&self,
		registration_id: RegistrationId,
		key: &StorageKey,
		entries: &[(String, String)],
	) -> Remote<Result<(), DatabaseError>> {
		self.db_call("store_user_data", |db| db.store_user_data(registration_id, key, entries))
			.await
	}

	async fn clear_user_data(&self, registration_id: RegistrationId, keys: &[String]) -> Remote<Result<(), DatabaseError>> {
		self.db_call("clear_user_data", |db| db.clear_user_data(registration_id, keys)).await
	}

	async fn clear_user_data_by_key_prefixes(&self, registration_id: RegistrationId, prefixes: &[String]) -> Remote<Result<(), DatabaseError>> {
		self.db_call("clear_user_data_by_key_prefixes", |db| db.clear_user_data_by_key_prefixes(registration_id, prefixes))
			.await
	}

	async fn clear_user_data_for_all_registrations_by_key_prefix(&self, prefix: &str) -> Remote<Result<(), DatabaseError>> {
		self.db_call("clear_user_data_for_all_registrations_by_key_prefix", |db| {
			db.clear_user_data_for_all_registrations_by_key_prefix(prefix)
		})
		.await
	}

	async fn get_user_data_for_all_registrations(&self, key: &str) -> Remote<Result<Vec<(RegistrationId, String)>, DatabaseError>> {
		self.db_call("get_user_data_for_all_registrations", |db| db.get_user_data_for_all_registrations(key))
			.await
	}

	async fn get_user_data_for_all_registrations_by_key_prefix(
		&self,
		prefix: &str,
	) -> Remote<Result<Vec<(RegistrationId, String)>, DatabaseError>> {
		self.db_call("get_user_data_for_all_registrations_by_key_prefix", |db| {
			db.get_user_data_for_all_registrations_by_key_prefix(prefix)
		})
		.await
	}

	async fn get_usage_for_storage_key(&self, key: &StorageKey) -> Remote<Result<u64, DatabaseError>> {
		self.db_call("get_usage_for_storage_key", |db| Ok(db.usage_for_storage_key(key))).await
	}

	async fn perform_storage_cleanup(&self) -> Remote<()> {
		self.enter("perform_storage_cleanup").await?;
		let pinned_versions = self.inner.pinned_versions();
		let mut db = self.inner.db.lock();
		let pinned: BTreeSet<ResourceId> = pinned_versions.iter().flat_map(|v| db.resource_ids_of(*v)).collect();
		let purged = db.purge(&pinned);
		debug!(purged, "memory storage cleanup");
		Ok(())
	}

	async fn disable(&self) -> Remote<()> {
		self.enter("disable").await?;
		self.inner.db.lock().disabled = true;
		Ok(())
	}

	async fn delete_and_start_over(&self) -> Remote<Result<(), DatabaseError>> {
		self.enter("delete_and_start_over").await?;
		if let Some(err) = self.inner.faults.lock().fail_next.get_mut("delete_and_start_over").and_then(VecDeque::pop_front) {
			return Ok(Err(err));
		}
		self.inner.db.lock().wipe();
		self.inner.pins.lock().clear();
		Ok(Ok(()))
	}

	async fn recover(&self, versions: Vec<LiveVersionInfo>) -> Remote<Vec<LiveVersionRef>> {
		self.enter("recover").await?;
		Ok(versions.into_iter().map(|info| self.inner.pin(info.version_id)).collect())
	}

	async fn apply_policy_updates(&self, updates: Vec<PolicyUpdate>) -> Remote<Result<(), DatabaseError>> {
		let applied = self
			.db_call("apply_policy_updates", |_| Ok(updates.clone()))
			.await?;
		Ok(applied.map(|updates| self.inner.policy_updates.lock().extend(updates)))
	}
}
