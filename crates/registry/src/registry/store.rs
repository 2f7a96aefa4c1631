use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use swreg_storage::{RegistrationData, RegistrationId, ResourceId, StorageKey};
use tracing::{debug, trace};

use super::Registry;
use crate::RegistryError;
use crate::completion::Completion;
use crate::live::{FetchHandlerExistence, Registration, RegistrationStatus, Version, VersionStatus};

impl Registry {
	/// Writes `registration` with `version` as its stored version.
	///
	/// A registration that is already stored may be stored again; the new record
	/// replaces the old one and the quota sees the size difference.
	///
	/// # Panics
	///
	/// Panics if the version's fetch handler existence is still unknown, or if the
	/// registration is uninstalling.
	pub fn store_registration(&self, registration: Arc<Registration>, version: Arc<Version>) -> Completion<()> {
		assert_ne!(
			version.fetch_handler_existence(),
			FetchHandlerExistence::Unknown,
			"version {} stored before its fetch handler was evaluated",
			version.id()
		);
		assert_eq!(
			registration.status(),
			RegistrationStatus::Intact,
			"registration {} stored while not intact",
			registration.id()
		);
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		let resources = version.resources();
		if resources.is_empty() {
			debug!(registration = %registration.id(), version = %version.id(), "refusing to store a version without resources");
			return Completion::ready(Err(RegistryError::Failed));
		}
		let resources_total_size_bytes: u64 = resources.iter().map(|r| r.size_bytes).sum();
		let data = RegistrationData {
			registration_id: registration.id(),
			scope: registration.scope().clone(),
			storage_key: registration.key().clone(),
			script: version.script_url().clone(),
			script_type: version.script_type(),
			update_via_cache: registration.update_via_cache(),
			version_id: version.id(),
			is_active: version.status() == VersionStatus::Activated,
			has_fetch_handler: version.fetch_handler_existence() == FetchHandlerExistence::Exists,
			last_update_check: registration.last_update_check(),
			used_features: version.used_features(),
			resources_total_size_bytes,
			navigation_preload: registration.navigation_preload(),
			cross_origin_embedder_policy: version.cross_origin_embedder_policy(),
			origin_trial_tokens: version.origin_trial_tokens(),
		};

		let reply = self.db_call("store_registration", move |control| {
			let data = data.clone();
			let resources = resources.clone();
			async move { control.store_registration(data, resources).await }.boxed()
		});
		let registry = self.clone();
		Completion::spawn(async move {
			let outcome = reply.await?;
			registration.set_stored(true);
			registration.set_resources_total_size_bytes(resources_total_size_bytes);
			if let Some(superseded) = outcome.deleted_version_id {
				trace!(registration = %registration.id(), version = %superseded, "stored version superseded");
			}
			let key = registration.key();
			registry
				.inner
				.quota
				.storage_modified(key, size_delta(resources_total_size_bytes, outcome.deleted_resources_size));
			registry
				.inner
				.observer
				.on_registration_stored(registration.id(), registration.scope(), key);
			registry.track_storage_key(key);
			debug!(registration = %registration.id(), size = resources_total_size_bytes, "registration stored");
			Ok(())
		})
	}

	/// Deletes the durable record of `registration`.
	///
	/// The registration is uninstalling as soon as this returns. When the delete
	/// is confirmed it becomes uninstalled; on failure it is intact again.
	///
	/// # Panics
	///
	/// Panics if the registration is already deleted.
	pub fn delete_registration(&self, registration: Arc<Registration>, key: StorageKey) -> Completion<()> {
		assert!(!registration.is_deleted(), "registration {} deleted twice", registration.id());
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		self.inner.cache.notify_deleting(&registration);

		let id = registration.id();
		let reply = {
			let key = key.clone();
			self.db_call("delete_registration", move |control| {
				let key = key.clone();
				async move { control.delete_registration(id, &key).await }.boxed()
			})
		};
		let registry = self.clone();
		Completion::spawn(async move {
			let outcome = match reply.await {
				Ok(outcome) => outcome,
				Err(err) => {
					registry.inner.cache.notify_done_deleting(&registration, RegistrationStatus::Intact);
					return Err(err);
				}
			};
			registration.mark_deleted();
			registry.inner.cache.notify_done_deleting(&registration, RegistrationStatus::Uninstalled);
			registry
				.inner
				.quota
				.storage_modified(&key, size_delta(0, outcome.deleted_resources_size));
			if outcome.storage_key_is_empty {
				debug!(key = %key, "last registration deleted for storage key");
				registry.inner.observer.on_all_registrations_deleted_for_storage_key(&key);
				registry.untrack_storage_key(&key);
			}
			Ok(())
		})
	}

	/// Marks the stored version of registration `id` as active.
	pub fn update_to_active_state(&self, id: RegistrationId, key: StorageKey) -> Completion<()> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.db_call("update_to_active_state", move |control| {
			let key = key.clone();
			async move { control.update_to_active_state(id, &key).await }.boxed()
		}))
	}

	pub fn update_last_update_check_time(&self, id: RegistrationId, key: StorageKey, time: DateTime<Utc>) -> Completion<()> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.db_call("update_last_update_check_time", move |control| {
			let key = key.clone();
			async move { control.update_last_update_check_time(id, &key, time).await }.boxed()
		}))
	}

	pub fn update_navigation_preload_enabled(&self, id: RegistrationId, key: StorageKey, enable: bool) -> Completion<()> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.db_call("update_navigation_preload_enabled", move |control| {
			let key = key.clone();
			async move { control.update_navigation_preload_enabled(id, &key, enable).await }.boxed()
		}))
	}

	pub fn update_navigation_preload_header(&self, id: RegistrationId, key: StorageKey, value: String) -> Completion<()> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.db_call("update_navigation_preload_header", move |control| {
			let key = key.clone();
			let value = value.clone();
			async move { control.update_navigation_preload_header(id, &key, &value).await }.boxed()
		}))
	}

	/// Records `resource_id` as written but not yet part of any stored version.
	pub fn store_uncommitted_resource_id(&self, resource_id: ResourceId, key: StorageKey) -> Completion<()> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.resource_call("store_uncommitted_resource_id", key, move |control| {
			async move { control.store_uncommitted_resource_id(resource_id).await }.boxed()
		}))
	}

	pub fn doom_uncommitted_resource(&self, key: StorageKey, resource_id: ResourceId) -> Completion<()> {
		self.doom_uncommitted_resources(key, vec![resource_id])
	}

	/// Marks uncommitted resources for deletion.
	pub fn doom_uncommitted_resources(&self, key: StorageKey, resource_ids: Vec<ResourceId>) -> Completion<()> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.resource_call("doom_uncommitted_resources", key, move |control| {
			let resource_ids = resource_ids.clone();
			async move { control.doom_uncommitted_resources(&resource_ids).await }.boxed()
		}))
	}
}

/// Signed byte delta for the quota client, saturating at the `i64` range.
pub(super) fn size_delta(added: u64, removed: u64) -> i64 {
	let added = i64::try_from(added).unwrap_or(i64::MAX);
	let removed = i64::try_from(removed).unwrap_or(i64::MAX);
	added.saturating_sub(removed)
}
