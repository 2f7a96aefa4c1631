use std::collections::BTreeSet;
use std::sync::Arc;

use futures::FutureExt;
use swreg_storage::{RegistrationId, StorageKey};
use tracing::trace;
use url::Url;

use super::Registry;
use crate::RegistryError;
use crate::completion::Completion;
use crate::live::{Registration, RegistrationInfo};

impl Registry {
	/// Registration whose scope is the longest prefix of `client_url`.
	///
	/// An installing registration that is not deleted wins over the stored match
	/// when its scope is strictly longer, and answers on its own when storage has
	/// no match.
	pub fn find_registration_for_client_url(&self, client_url: Url, key: StorageKey) -> Completion<Arc<Registration>> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		let reply = {
			let client_url = client_url.clone();
			let key = key.clone();
			self.db_call("find_registration_for_client_url", move |control| {
				let client_url = client_url.clone();
				let key = key.clone();
				async move { control.find_registration_for_client_url(&client_url, &key).await }.boxed()
			})
		};
		let registry = self.clone();
		Completion::spawn(async move {
			let stored = reply.await;
			let installing = registry.inner.cache.find_installing_for_client_url(&client_url, &key);
			let registration = match stored {
				Ok(found) => {
					let stored = registry.inner.cache.get_or_create_registration(found);
					match installing {
						Some(installing) if installing.scope().as_str().len() > stored.scope().as_str().len() => installing,
						_ => stored,
					}
				}
				Err(RegistryError::NotFound) => installing.ok_or(RegistryError::NotFound)?,
				Err(err) => return Err(err),
			};
			registry.found(registration)
		})
	}

	/// Registration with exactly `scope`. Installing registrations that are not
	/// deleted answer without a storage round-trip.
	pub fn find_registration_for_scope(&self, scope: Url, key: StorageKey) -> Completion<Arc<Registration>> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		if let Some(installing) = self.inner.cache.find_installing_for_scope(&scope, &key) {
			trace!(registration = %installing.id(), "scope lookup answered by installing set");
			return Completion::ready(self.found(installing));
		}
		let reply = {
			let scope = scope.clone();
			let key = key.clone();
			self.db_call("find_registration_for_scope", move |control| {
				let scope = scope.clone();
				let key = key.clone();
				async move { control.find_registration_for_scope(&scope, &key).await }.boxed()
			})
		};
		let registry = self.clone();
		Completion::spawn(async move {
			let registration = match reply.await {
				Ok(found) => registry.inner.cache.get_or_create_registration(found),
				Err(RegistryError::NotFound) => registry
					.inner
					.cache
					.find_installing_for_scope(&scope, &key)
					.ok_or(RegistryError::NotFound)?,
				Err(err) => return Err(err),
			};
			registry.found(registration)
		})
	}

	/// Registration `id` under `key`.
	pub fn find_registration_for_id(&self, id: RegistrationId, key: StorageKey) -> Completion<Arc<Registration>> {
		self.find_by_id(id, Some(key))
	}

	/// Registration `id` under whatever storage key holds it.
	pub fn find_registration_for_id_only(&self, id: RegistrationId) -> Completion<Arc<Registration>> {
		self.find_by_id(id, None)
	}

	fn find_by_id(&self, id: RegistrationId, key: Option<StorageKey>) -> Completion<Arc<Registration>> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		if let Some(live) = self.inner.live.registration(id) {
			// A live object that is neither stored nor installing has no durable
			// record to find.
			if live.is_deleted() || !(live.is_stored() || self.inner.cache.is_installing(id)) {
				return Completion::ready(Err(RegistryError::NotFound));
			}
			return Completion::ready(self.found(live));
		}
		let reply = self.db_call("find_registration_for_id", move |control| {
			let key = key.clone();
			async move { control.find_registration_for_id(id, key.as_ref()).await }.boxed()
		});
		let registry = self.clone();
		Completion::spawn(async move {
			let registration = match reply.await {
				Ok(found) => registry.inner.cache.get_or_create_registration(found),
				Err(RegistryError::NotFound) => registry.inner.cache.find_installing_for_id(id).ok_or(RegistryError::NotFound)?,
				Err(err) => return Err(err),
			};
			registry.found(registration)
		})
	}

	/// Stored and installing registrations under `key`, one per id.
	pub fn get_registrations_for_storage_key(&self, key: StorageKey) -> Completion<Vec<Arc<Registration>>> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		let reply = {
			let key = key.clone();
			self.db_call("get_registrations_for_storage_key", move |control| {
				let key = key.clone();
				async move { control.get_registrations_for_storage_key(&key).await }.boxed()
			})
		};
		let registry = self.clone();
		Completion::spawn(async move {
			let found = match reply.await {
				Ok(found) => found,
				Err(RegistryError::NotFound) => Vec::new(),
				Err(err) => return Err(err),
			};
			let mut seen = BTreeSet::new();
			let mut registrations = Vec::with_capacity(found.len());
			for found in found {
				let registration = registry.inner.cache.get_or_create_registration(found);
				if registration.is_deleted() {
					continue;
				}
				seen.insert(registration.id());
				registrations.push(registration);
			}
			for installing in registry.inner.cache.installing_for_storage_key(&key) {
				if seen.insert(installing.id()) {
					registrations.push(installing);
				}
			}
			if !registrations.is_empty() {
				registry.inner.quota.storage_accessed(&key);
			}
			Ok(registrations)
		})
	}

	/// Snapshot of every stored registration plus installing ones not yet stored.
	///
	/// Live objects are preferred over the durable record when both exist.
	pub fn get_all_registrations_info(&self) -> Completion<Vec<RegistrationInfo>> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		let reply = self.db_call("get_all_registrations", |control| {
			async move { control.get_all_registrations().await }.boxed()
		});
		let registry = self.clone();
		Completion::spawn(async move {
			let records = reply.await?;
			let mut seen = BTreeSet::new();
			let mut infos = Vec::with_capacity(records.len());
			for data in &records {
				seen.insert(data.registration_id);
				match registry.inner.live.registration(data.registration_id) {
					Some(live) if !live.is_deleted() => infos.push(live.info()),
					Some(_) => {}
					None => infos.push(RegistrationInfo::from(data)),
				}
			}
			for installing in registry.inner.cache.installing() {
				if seen.insert(installing.id()) {
					infos.push(installing.info());
				}
			}
			Ok(infos)
		})
	}

	/// Registrations under `key` whose durable delete is still in flight.
	pub fn get_uninstalling_registrations(&self, key: &StorageKey) -> Vec<Arc<Registration>> {
		self.inner.cache.uninstalling_for_storage_key(key)
	}

	/// Bytes of script resources stored under `key`.
	pub fn get_storage_usage_for_storage_key(&self, key: StorageKey) -> Completion<u64> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.db_call("get_usage_for_storage_key", move |control| {
			let key = key.clone();
			async move { control.get_usage_for_storage_key(&key).await }.boxed()
		}))
	}
}
