use std::collections::BTreeSet;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use swreg_registry::{FetchHandlerExistence, Registration, RegistrationOptions, RegistrationStatus, RegistryError};
use swreg_storage::{PolicyUpdate, RegistrationId, ScriptType, StorageKey, VersionId};

use crate::common::{Harness, ORIGIN, Observed, at, eventually, key, record, url};

#[tokio::test]
async fn store_then_delete_last_registration_for_key() {
	let h = Harness::new();
	h.storage.set_next_registration_id(5);

	let registration = h.registration("/app/").await;
	assert_eq!(registration.id(), RegistrationId(5));
	h.registry.notify_installing(&registration);
	let version = h.version(&registration, &[1000]).await;
	registration.set_active_version(version.clone());
	h.registry
		.store_registration(registration.clone(), version.clone())
		.await
		.unwrap();
	h.registry.notify_done_installing(&registration, &version, Ok(()));

	assert!(registration.is_stored());
	assert_eq!(h.quota.deltas(), vec![1000]);
	assert_eq!(h.observer.events(), vec![Observed::Stored(RegistrationId(5))]);
	assert!(h.registry.is_tracking_origin(ORIGIN));

	h.storage.hold();
	let delete = h.registry.delete_registration(registration.clone(), key());
	assert_eq!(registration.status(), RegistrationStatus::Uninstalling);
	h.storage.release();
	delete.await.unwrap();

	assert_eq!(registration.status(), RegistrationStatus::Uninstalled);
	assert!(registration.is_deleted());
	assert_eq!(h.quota.deltas(), vec![1000, -1000]);
	assert_eq!(
		h.observer.events(),
		vec![Observed::Stored(RegistrationId(5)), Observed::AllDeleted(key())]
	);
	assert!(!h.registry.is_tracking_origin(ORIGIN));
	assert_eq!(h.storage.registration_count(), 0);
}

#[tokio::test]
async fn storage_lookups_share_one_live_object_per_id() {
	let h = Harness::new();
	let (data, resources) = record(100, "/seeded/", 7, 50);
	h.storage.insert_registration(data, resources).unwrap();

	let first = h.registry.find_registration_for_scope(at("/seeded/"), key()).await.unwrap();
	let second = h.registry.find_registration_for_scope(at("/seeded/"), key()).await.unwrap();
	let by_client = h
		.registry
		.find_registration_for_client_url(at("/seeded/index.html"), key())
		.await
		.unwrap();
	assert!(Arc::ptr_eq(&first, &second));
	assert!(Arc::ptr_eq(&first, &by_client));

	let by_id = h.registry.find_registration_for_id_only(RegistrationId(100));
	assert!(by_id.is_immediate());
	assert!(Arc::ptr_eq(&first, &by_id.await.unwrap()));

	let version = first.active_version().unwrap();
	assert_eq!(version.id(), VersionId(7));
	assert!(version.has_live_reference());
	assert!(h.storage.pinned_versions().contains(&VersionId(7)));

	let all = h.registry.get_registrations_for_storage_key(key()).await.unwrap();
	assert_eq!(all.len(), 1);
	assert!(Arc::ptr_eq(&first, &all[0]));
}

#[tokio::test]
async fn installing_registration_is_found_without_storage() {
	let h = Harness::new();
	let registration = h.registration("/app/").await;
	h.registry.notify_installing(&registration);

	let found = h.registry.find_registration_for_scope(at("/app/"), key());
	assert!(found.is_immediate());
	assert!(Arc::ptr_eq(&registration, &found.await.unwrap()));
	assert_eq!(h.storage.call_count("find_registration_for_scope"), 0);

	let by_id = h.registry.find_registration_for_id(registration.id(), key()).await.unwrap();
	assert!(Arc::ptr_eq(&registration, &by_id));
	assert_eq!(h.storage.call_count("find_registration_for_id"), 0);

	let version = h.version(&registration, &[]).await;
	h.registry.notify_done_installing(&registration, &version, Err(RegistryError::Failed));
	assert_eq!(
		h.registry.find_registration_for_scope(at("/app/"), key()).await.unwrap_err(),
		RegistryError::NotFound
	);
	assert_eq!(
		h.registry.find_registration_for_id(registration.id(), key()).await.unwrap_err(),
		RegistryError::NotFound
	);
}

#[tokio::test]
async fn longer_installing_scope_beats_stored_match() {
	let h = Harness::new();
	let (root, _) = h.stored("/", 10).await;
	let app = h.registration("/app/").await;
	h.registry.notify_installing(&app);

	let found = h
		.registry
		.find_registration_for_client_url(at("/app/page.html"), key())
		.await
		.unwrap();
	assert_eq!(found.id(), app.id());

	let found = h
		.registry
		.find_registration_for_client_url(at("/other.html"), key())
		.await
		.unwrap();
	assert_eq!(found.id(), root.id());
}

/// Stores `scope` while it is installing, then deletes it without finishing the install.
async fn deleted_while_installing(h: &Harness, scope: &str) -> Arc<Registration> {
	let registration = h.registration(scope).await;
	h.registry.notify_installing(&registration);
	let version = h.version(&registration, &[10]).await;
	registration.set_active_version(version.clone());
	h.registry
		.store_registration(registration.clone(), version)
		.await
		.unwrap();
	h.registry.delete_registration(registration.clone(), key()).await.unwrap();
	assert!(registration.is_deleted());
	registration
}

#[tokio::test]
async fn deleted_installing_registration_does_not_shadow_stored_match() {
	let h = Harness::new();
	let (root, _) = h.stored("/", 10).await;
	deleted_while_installing(&h, "/app/").await;

	let found = h
		.registry
		.find_registration_for_client_url(at("/app/page.html"), key())
		.await
		.unwrap();
	assert_eq!(found.id(), root.id());

	let listed = h.registry.get_registrations_for_storage_key(key()).await.unwrap();
	assert_eq!(listed.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![root.id()]);
	let infos = h.registry.get_all_registrations_info().await.unwrap();
	assert_eq!(infos.iter().map(|info| info.registration_id).collect::<Vec<_>>(), vec![root.id()]);
}

#[tokio::test]
async fn deleted_installing_registration_does_not_hide_a_newer_one_at_its_scope() {
	let h = Harness::new();
	let deleted = deleted_while_installing(&h, "/app/").await;
	let (newer, _) = h.stored("/app/", 10).await;
	assert_ne!(deleted.id(), newer.id());

	let found = h.registry.find_registration_for_scope(at("/app/"), key());
	assert!(!found.is_immediate());
	assert_eq!(found.await.unwrap().id(), newer.id());
	assert_eq!(h.storage.call_count("find_registration_for_scope"), 1);
}

#[tokio::test]
async fn installing_registration_answers_client_lookup_when_storage_misses() {
	let h = Harness::new();
	let app = h.registration("/app/").await;
	h.registry.notify_installing(&app);

	let found = h
		.registry
		.find_registration_for_client_url(at("/app/deep/page.html"), key())
		.await
		.unwrap();
	assert!(Arc::ptr_eq(&app, &found));
	assert_eq!(h.storage.call_count("find_registration_for_client_url"), 1);

	assert_eq!(
		h.registry
			.find_registration_for_client_url(at("/elsewhere"), key())
			.await
			.unwrap_err(),
		RegistryError::NotFound
	);
}

#[tokio::test]
async fn lookup_during_delete_sees_uninstalling_registration() {
	let h = Harness::new();
	let (registration, _) = h.stored("/app/", 10).await;

	h.storage.hold();
	let delete = h.registry.delete_registration(registration.clone(), key());

	let found = h.registry.find_registration_for_id(registration.id(), key());
	assert!(found.is_immediate());
	let found = found.await.unwrap();
	assert!(Arc::ptr_eq(&registration, &found));
	assert!(found.is_uninstalling());

	let uninstalling = h.registry.get_uninstalling_registrations(&key());
	assert_eq!(uninstalling.len(), 1);
	assert_eq!(uninstalling[0].id(), registration.id());

	h.storage.release();
	delete.await.unwrap();

	assert!(h.registry.get_uninstalling_registrations(&key()).is_empty());
	assert_eq!(
		h.registry.find_registration_for_id(registration.id(), key()).await.unwrap_err(),
		RegistryError::NotFound
	);
}

#[tokio::test]
async fn failed_delete_leaves_registration_intact() {
	let h = Harness::new();
	let (registration, _) = h.stored("/app/", 10).await;

	let err = h
		.registry
		.delete_registration(registration.clone(), StorageKey::first_party(&url("https://b.test/")))
		.await
		.unwrap_err();
	assert_eq!(err, RegistryError::NotFound);
	assert_eq!(registration.status(), RegistrationStatus::Intact);
	assert!(!registration.is_deleted());
	assert!(h.registry.get_uninstalling_registrations(&key()).is_empty());
	assert_eq!(h.storage.registration_count(), 1);
}

#[tokio::test]
async fn version_without_resources_is_not_stored() {
	let h = Harness::new();
	let registration = h.registration("/app/").await;
	let version = h
		.registry
		.create_new_version(&registration, at("/sw.js"), ScriptType::Module)
		.await
		.unwrap()
		.unwrap();
	version.set_fetch_handler_existence(FetchHandlerExistence::DoesNotExist);

	let store = h.registry.store_registration(registration.clone(), version);
	assert!(store.is_immediate());
	assert_eq!(store.await.unwrap_err(), RegistryError::Failed);
	assert_eq!(h.storage.call_count("store_registration"), 0);
	assert!(!registration.is_stored());
	assert!(h.quota.deltas().is_empty());
}

#[tokio::test]
#[should_panic(expected = "fetch handler")]
async fn storing_before_fetch_handler_evaluation_panics() {
	let h = Harness::new();
	let registration = h.registration("/app/").await;
	let version = h
		.registry
		.create_new_version(&registration, at("/sw.js"), ScriptType::Classic)
		.await
		.unwrap()
		.unwrap();
	let _ = h.registry.store_registration(registration, version);
}

#[tokio::test]
async fn restoring_a_registration_reports_size_difference() {
	let h = Harness::new();
	let (registration, _) = h.stored("/app/", 100).await;
	let update = h.version(&registration, &[30, 40]).await;
	registration.set_active_version(update.clone());
	h.registry.store_registration(registration.clone(), update.clone()).await.unwrap();

	assert_eq!(h.quota.deltas(), vec![100, -30]);
	assert_eq!(registration.resources_total_size_bytes(), 70);
	assert_eq!(h.storage.registration(registration.id()).unwrap().version_id, update.id());
	assert_eq!(h.registry.get_storage_usage_for_storage_key(key()).await.unwrap(), 70);
}

#[tokio::test]
async fn bucket_failure_skips_id_allocation() {
	let h = Harness::new();
	h.quota.refuse_buckets();

	let created = h
		.registry
		.create_new_registration(RegistrationOptions::new(at("/app/")), key())
		.await
		.unwrap();
	assert!(created.is_none());
	assert_eq!(h.storage.call_count("get_new_registration_id"), 0);
}

#[tokio::test]
async fn invalid_ids_create_nothing() {
	let h = Harness::new();
	h.storage.fail_id_allocation(true);

	let created = h
		.registry
		.create_new_registration(RegistrationOptions::new(at("/app/")), key())
		.await
		.unwrap();
	assert!(created.is_none());

	h.storage.fail_id_allocation(false);
	let registration = h.registration("/app/").await;
	h.storage.fail_id_allocation(true);
	let version = h
		.registry
		.create_new_version(&registration, at("/sw.js"), ScriptType::Classic)
		.await
		.unwrap();
	assert!(version.is_none());
}

#[tokio::test]
async fn enumeration_unions_stored_and_installing() {
	let h = Harness::new();
	let (stored, _) = h.stored("/a/", 10).await;
	let installing = h.registration("/b/").await;
	h.registry.notify_installing(&installing);

	let ids: BTreeSet<_> = h
		.registry
		.get_registrations_for_storage_key(key())
		.await
		.unwrap()
		.iter()
		.map(|r| r.id())
		.collect();
	assert_eq!(ids, BTreeSet::from([stored.id(), installing.id()]));

	let infos = h.registry.get_all_registrations_info().await.unwrap();
	let ids: BTreeSet<_> = infos.iter().map(|info| info.registration_id).collect();
	assert_eq!(ids, BTreeSet::from([stored.id(), installing.id()]));
	let stored_info = infos.iter().find(|info| info.registration_id == stored.id()).unwrap();
	assert_eq!(stored_info.resources_total_size_bytes, 10);
}

#[tokio::test]
async fn failed_install_dooms_uncommitted_resources() {
	let h = Harness::new();
	let registration = h.registration("/app/").await;
	h.registry.notify_installing(&registration);
	let version = h.version(&registration, &[5, 6]).await;
	let resource_ids: BTreeSet<_> = version.resource_ids().into_iter().collect();
	assert_eq!(h.storage.uncommitted_resource_ids(), resource_ids);

	h.registry.notify_done_installing(&registration, &version, Err(RegistryError::Failed));

	eventually(|| h.storage.purgeable_resource_ids() == resource_ids).await;
	assert!(h.storage.uncommitted_resource_ids().is_empty());
}

#[tokio::test]
async fn field_updates_reach_the_stored_record() {
	let h = Harness::new();
	let (registration, _) = h.stored("/app/", 10).await;
	let id = registration.id();

	h.registry.update_navigation_preload_enabled(id, key(), true).await.unwrap();
	h.registry
		.update_navigation_preload_header(id, key(), "on".to_string())
		.await
		.unwrap();
	let checked = chrono::Utc::now();
	h.registry.update_last_update_check_time(id, key(), checked).await.unwrap();

	let data = h.storage.registration(id).unwrap();
	assert!(data.navigation_preload.enabled);
	assert_eq!(data.navigation_preload.header, "on");
	assert_eq!(data.last_update_check, Some(checked));
}

#[tokio::test]
async fn start_tracks_keys_already_in_storage() {
	let h = Harness::new();
	h.policy.0.lock().insert(ORIGIN.to_string());
	let (data, resources) = record(100, "/seeded/", 7, 50);
	h.storage.insert_registration(data, resources).unwrap();

	h.registry.start().await.unwrap();

	assert!(h.registry.is_tracking_origin(ORIGIN));
	eventually(|| {
		h.storage.policy_updates()
			== vec![PolicyUpdate {
				origin: ORIGIN.to_string(),
				purge_on_shutdown: true,
			}]
	})
	.await;
}

#[tokio::test]
async fn policy_changes_are_forwarded_once_per_change() {
	let h = Harness::new();
	h.stored("/app/", 10).await;
	h.registry.on_storage_policy_changed();
	assert!(h.storage.policy_updates().is_empty());

	h.policy.0.lock().insert(ORIGIN.to_string());
	h.registry.on_storage_policy_changed();
	h.registry.on_storage_policy_changed();
	h.policy.0.lock().clear();
	h.registry.on_storage_policy_changed();

	eventually(|| h.storage.policy_updates().len() == 2).await;
	let flags: Vec<_> = h.storage.policy_updates().into_iter().map(|u| u.purge_on_shutdown).collect();
	assert_eq!(flags, vec![true, false]);
}
