use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{DatabaseError, Disconnected};
use crate::types::{
	DeleteOutcome, FoundRegistration, LiveVersionInfo, LiveVersionRef, PolicyUpdate, RegistrationData, RegistrationId, ResourceId,
	ResourceRecord, StorageKey, StoreOutcome, VersionId,
};

/// Transport-level result of a storage call.
pub type Remote<T> = Result<T, Disconnected>;

/// Source of storage handles.
///
/// Each call to [`StorageBackend::connect`] yields a fresh handle. Old handles
/// stay dead once disconnected; they are never revived.
pub trait StorageBackend: Send + Sync {
	fn connect(&self) -> Arc<dyn StorageControl>;
}

/// One bound connection to the storage backend.
///
/// Every method is a single request with a single reply. Arguments are borrowed
/// or owned per call, so a caller replaying a request after reconnecting must
/// supply its own copy of any owned argument.
#[async_trait]
pub trait StorageControl: Send + Sync {
	/// Resolves once this handle is disconnected.
	async fn closed(&self);

	async fn get_registered_storage_keys(&self) -> Remote<Vec<StorageKey>>;

	/// Longest-scope match for a client URL.
	async fn find_registration_for_client_url(&self, client_url: &Url, key: &StorageKey) -> Remote<Result<FoundRegistration, DatabaseError>>;

	async fn find_registration_for_scope(&self, scope: &Url, key: &StorageKey) -> Remote<Result<FoundRegistration, DatabaseError>>;

	/// Lookup by id. When `key` is `None` the record may live under any key.
	async fn find_registration_for_id(
		&self,
		registration_id: RegistrationId,
		key: Option<&StorageKey>,
	) -> Remote<Result<FoundRegistration, DatabaseError>>;

	async fn get_registrations_for_storage_key(&self, key: &StorageKey) -> Remote<Result<Vec<FoundRegistration>, DatabaseError>>;

	async fn get_all_registrations(&self) -> Remote<Result<Vec<RegistrationData>, DatabaseError>>;

	async fn store_registration(
		&self,
		registration: RegistrationData,
		resources: Vec<ResourceRecord>,
	) -> Remote<Result<StoreOutcome, DatabaseError>>;

	async fn delete_registration(&self, registration_id: RegistrationId, key: &StorageKey) -> Remote<Result<DeleteOutcome, DatabaseError>>;

	async fn update_to_active_state(&self, registration_id: RegistrationId, key: &StorageKey) -> Remote<Result<(), DatabaseError>>;

	async fn update_last_update_check_time(
		&self,
		registration_id: RegistrationId,
		key: &StorageKey,
		time: DateTime<Utc>,
	) -> Remote<Result<(), DatabaseError>>;

	async fn update_navigation_preload_enabled(
		&self,
		registration_id: RegistrationId,
		key: &StorageKey,
		enable: bool,
	) -> Remote<Result<(), DatabaseError>>;

	async fn update_navigation_preload_header(
		&self,
		registration_id: RegistrationId,
		key: &StorageKey,
		value: &str,
	) -> Remote<Result<(), DatabaseError>>;

	/// Returns [`RegistrationId::INVALID`] when allocation fails.
	async fn get_new_registration_id(&self) -> Remote<RegistrationId>;

	/// Returns [`VersionId::INVALID`] and no reference when allocation fails.
	async fn get_new_version_id(&self) -> Remote<(VersionId, Option<LiveVersionRef>)>;

	async fn get_new_resource_id(&self) -> Remote<ResourceId>;

	async fn store_uncommitted_resource_id(&self, resource_id: ResourceId) -> Remote<Result<(), DatabaseError>>;

	async fn doom_uncommitted_resources(&self, resource_ids: &[ResourceId]) -> Remote<Result<(), DatabaseError>>;

	/// Values are returned in the order of `keys`; any missing key is `NotFound`.
	async fn get_user_data(&self, registration_id: RegistrationId, keys: &[String]) -> Remote<Result<Vec<String>, DatabaseError>>;

	async fn get_user_data_by_key_prefix(&self, registration_id: RegistrationId, prefix: &str) -> Remote<Result<Vec<String>, DatabaseError>>;

	async fn get_user_keys_and_data_by_key_prefix(
		&self,
		registration_id: RegistrationId,
		prefix: &str,
	) -> Remote<Result<BTreeMap<String, String>, DatabaseError>>;

	async fn store_user_data(
		&self,
		registration_id: RegistrationId,
		key: &StorageKey,
		entries: &[(String, String)],
	) -> Remote<Result<(), DatabaseError>>;

	async fn clear_user_data(&self, registration_id: RegistrationId, keys: &[String]) -> Remote<Result<(), DatabaseError>>;

	async fn clear_user_data_by_key_prefixes(&self, registration_id: RegistrationId, prefixes: &[String]) -> Remote<Result<(), DatabaseError>>;

	async fn clear_user_data_for_all_registrations_by_key_prefix(&self, prefix: &str) -> Remote<Result<(), DatabaseError>>;

	async fn get_user_data_for_all_registrations(&self, key: &str) -> Remote<Result<Vec<(RegistrationId, String)>, DatabaseError>>;

	async fn get_user_data_for_all_registrations_by_key_prefix(
		&self,
		prefix: &str,
	) -> Remote<Result<Vec<(RegistrationId, String)>, DatabaseError>>;

	async fn get_usage_for_storage_key(&self, key: &StorageKey) -> Remote<Result<u64, DatabaseError>>;

	async fn perform_storage_cleanup(&self) -> Remote<()>;

	/// Refuses all further database work until [`StorageControl::delete_and_start_over`].
	async fn disable(&self) -> Remote<()>;

	/// Wipes all durable state and re-enables the backend.
	async fn delete_and_start_over(&self) -> Remote<Result<(), DatabaseError>>;

	/// Re-establishes backend state after a reconnect.
	///
	/// Returns one fresh reference per reported version that still exists.
	async fn recover(&self, versions: Vec<LiveVersionInfo>) -> Remote<Vec<LiveVersionRef>>;

	async fn apply_policy_updates(&self, updates: Vec<PolicyUpdate>) -> Remote<Result<(), DatabaseError>>;
}
