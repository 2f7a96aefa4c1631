use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use swreg_registry::{RegistrationOptions, RegistryError};
use swreg_storage::{DatabaseError, RegistrationId, ResourceId};

use crate::common::{Harness, Observed, QuotaEvent, at, eventually, key};

#[tokio::test]
async fn interrupted_store_is_replayed_once() {
	let h = Harness::new();
	let registration = h.registration("/app/").await;
	let version = h.version(&registration, &[1000]).await;
	registration.set_active_version(version.clone());

	h.storage.hold();
	let store = h.registry.store_registration(registration.clone(), version.clone());
	h.storage.wait_for_calls("store_registration", 1).await;
	h.storage.disconnect();
	h.storage.wait_for_calls("store_registration", 2).await;
	assert_eq!(h.storage.call_count("recover"), 1);
	h.storage.release();
	store.await.unwrap();

	assert_eq!(h.storage.call_count("store_registration"), 2);
	assert_eq!(h.storage.registration_count(), 1);
	assert_eq!(h.quota.deltas(), vec![1000]);
	assert_eq!(h.observer.events(), vec![Observed::Stored(registration.id())]);
	assert_eq!(h.registry.inflight_calls(), 0);
	assert!(!h.registry.is_recovering());

	let metrics = h.registry.connection_metrics();
	assert_eq!(metrics.recoveries, 1);
	assert_eq!(metrics.retry_histogram, BTreeMap::from([(0, 1)]));
	assert!(h.storage.pinned_versions().contains(&version.id()));
}

#[tokio::test]
async fn calls_issued_while_held_all_survive_a_disconnect() {
	let h = Harness::new();
	let (registration, _) = h.stored("/app/", 10).await;

	h.storage.hold();
	let usage = h.registry.get_storage_usage_for_storage_key(key());
	let listed = h.registry.get_registrations_for_storage_key(key());
	let resource = h.registry.get_new_resource_id();
	h.storage.wait_for_calls("get_usage_for_storage_key", 1).await;
	h.storage.wait_for_calls("get_registrations_for_storage_key", 1).await;
	h.storage.wait_for_calls("get_new_resource_id", 2).await;
	h.storage.disconnect();
	h.storage.wait_for_calls("get_usage_for_storage_key", 2).await;
	h.storage.wait_for_calls("get_registrations_for_storage_key", 2).await;
	h.storage.wait_for_calls("get_new_resource_id", 3).await;
	h.storage.release();

	assert_eq!(usage.await.unwrap(), 10);
	let listed = listed.await.unwrap();
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].id(), registration.id());
	assert!(resource.await.unwrap().is_valid());
	assert_eq!(h.storage.call_count("get_usage_for_storage_key"), 2);
	assert_eq!(h.storage.call_count("get_registrations_for_storage_key"), 2);
	assert_eq!(h.registry.inflight_calls(), 0);
}

#[tokio::test]
async fn failed_recovery_attempts_are_counted() {
	let h = Harness::new();
	h.registry.get_storage_usage_for_storage_key(key()).await.unwrap();

	h.storage.disconnect_on("recover", 3);
	h.storage.disconnect();
	h.storage.wait_for_calls("recover", 4).await;
	eventually(|| !h.registry.is_recovering()).await;

	let metrics = h.registry.connection_metrics();
	assert_eq!(metrics.recoveries, 1);
	assert_eq!(metrics.retry_histogram, BTreeMap::from([(3, 1)]));
	assert_eq!(h.registry.get_storage_usage_for_storage_key(key()).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_database_errors_schedule_one_reset() {
	let h = Harness::new();
	let (registration, _) = h.stored("/app/", 10).await;

	h.storage.hold();
	let usage = h.registry.get_storage_usage_for_storage_key(key());
	let listed = h.registry.get_registrations_for_storage_key(key());
	h.storage.wait_for_calls("get_usage_for_storage_key", 1).await;
	h.storage.wait_for_calls("get_registrations_for_storage_key", 1).await;
	h.storage.fail_next("get_usage_for_storage_key", DatabaseError::Corrupted);
	h.storage.fail_next("get_registrations_for_storage_key", DatabaseError::IoError);
	h.storage.release();

	assert_eq!(usage.await.unwrap_err(), RegistryError::Failed);
	assert_eq!(listed.await.unwrap_err(), RegistryError::Failed);

	eventually(|| !h.registry.is_storage_disabled()).await;
	assert_eq!(h.storage.call_count("delete_and_start_over"), 1);
	assert_eq!(h.observer.events().last(), Some(&Observed::Wiped));
	assert_eq!(h.storage.registration_count(), 0);
	assert!(!registration.is_stored());
	assert_eq!(
		h.registry.find_registration_for_id(registration.id(), key()).await.unwrap_err(),
		RegistryError::NotFound
	);
}

#[tokio::test]
async fn disabled_registry_aborts_without_reaching_storage() {
	let h = Harness::new();
	h.registry.prepare_for_delete_and_start_over();
	assert!(h.registry.is_storage_disabled());

	let find = h.registry.find_registration_for_scope(at("/app/"), key());
	assert!(find.is_immediate());
	assert_eq!(find.await.unwrap_err(), RegistryError::Abort);
	assert_eq!(
		h.registry.get_all_registrations_info().await.unwrap_err(),
		RegistryError::Abort
	);
	assert_eq!(
		h.registry
			.get_user_data(RegistrationId(1), vec!["k".to_string()])
			.await
			.unwrap_err(),
		RegistryError::Abort
	);
	let created = h
		.registry
		.create_new_registration(RegistrationOptions::new(at("/app/")), key())
		.await
		.unwrap();
	assert!(created.is_none());
	assert_eq!(h.storage.call_count("find_registration_for_scope"), 0);
	assert_eq!(h.storage.call_count("get_all_registrations"), 0);
	assert_eq!(h.storage.call_count("get_new_registration_id"), 0);

	h.registry.delete_and_start_over().await.unwrap();
	assert!(!h.registry.is_storage_disabled());
	assert_eq!(h.observer.events(), vec![Observed::Wiped]);
	let created = h
		.registry
		.create_new_registration(RegistrationOptions::new(at("/app/")), key())
		.await
		.unwrap();
	assert!(created.is_some());
}

#[tokio::test]
async fn missing_records_do_not_reset_storage() {
	let h = Harness::new();
	let err = h
		.registry
		.update_to_active_state(RegistrationId(999), key())
		.await
		.unwrap_err();
	assert_eq!(err, RegistryError::NotFound);
	assert!(!h.registry.is_storage_disabled());
	assert_eq!(h.storage.call_count("delete_and_start_over"), 0);
}

#[tokio::test]
async fn failed_resource_write_is_reported_to_quota() {
	let h = Harness::new();
	h.storage.fail_next("store_uncommitted_resource_id", DatabaseError::IoError);

	let err = h
		.registry
		.store_uncommitted_resource_id(ResourceId(42), key())
		.await
		.unwrap_err();
	assert_eq!(err, RegistryError::Failed);
	assert!(h.quota.events().contains(&QuotaEvent::WriteFailed(key())));

	eventually(|| h.storage.call_count("delete_and_start_over") == 1 && !h.registry.is_storage_disabled()).await;
}

#[tokio::test]
async fn failed_wipe_keeps_storage_disabled() {
	let h = Harness::new();
	h.storage.fail_next("delete_and_start_over", DatabaseError::IoError);
	h.registry.prepare_for_delete_and_start_over();

	assert_eq!(h.registry.delete_and_start_over().await.unwrap_err(), RegistryError::Failed);
	assert!(h.registry.is_storage_disabled());
	assert!(h.observer.events().is_empty());

	h.registry.delete_and_start_over().await.unwrap();
	assert!(!h.registry.is_storage_disabled());
	assert_eq!(h.observer.events(), vec![Observed::Wiped]);
}

#[tokio::test]
async fn disable_storage_reaches_the_backend() {
	let h = Harness::new();
	h.registry.disable_storage().await.unwrap();

	assert!(h.registry.is_storage_disabled());
	assert!(h.storage.is_disabled());
	assert_eq!(
		h.registry.get_new_resource_id().await.unwrap_err(),
		RegistryError::Abort
	);
}
