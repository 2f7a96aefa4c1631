use std::collections::BTreeMap;

use futures::FutureExt;
use swreg_storage::{RegistrationId, StorageKey};
use tracing::debug;

use super::Registry;
use crate::RegistryError;
use crate::completion::Completion;

impl Registry {
	/// Values for `keys`, in the order requested. Any missing key is `NotFound`.
	pub fn get_user_data(&self, id: RegistrationId, keys: Vec<String>) -> Completion<Vec<String>> {
		if let Some(rejected) = self.reject_user_data_request(id, keys.is_empty()) {
			return rejected;
		}
		Completion::spawn(self.db_call("get_user_data", move |control| {
			let keys = keys.clone();
			async move { control.get_user_data(id, &keys).await }.boxed()
		}))
	}

	pub fn get_user_data_by_key_prefix(&self, id: RegistrationId, prefix: String) -> Completion<Vec<String>> {
		if let Some(rejected) = self.reject_user_data_request(id, false) {
			return rejected;
		}
		Completion::spawn(self.db_call("get_user_data_by_key_prefix", move |control| {
			let prefix = prefix.clone();
			async move { control.get_user_data_by_key_prefix(id, &prefix).await }.boxed()
		}))
	}

	pub fn get_user_keys_and_data_by_key_prefix(&self, id: RegistrationId, prefix: String) -> Completion<BTreeMap<String, String>> {
		if let Some(rejected) = self.reject_user_data_request(id, false) {
			return rejected;
		}
		Completion::spawn(self.db_call("get_user_keys_and_data_by_key_prefix", move |control| {
			let prefix = prefix.clone();
			async move { control.get_user_keys_and_data_by_key_prefix(id, &prefix).await }.boxed()
		}))
	}

	/// Stores `entries` for registration `id`.
	///
	/// An empty batch, an empty key or an invalid id fails with
	/// [`RegistryError::Failed`] without reaching storage.
	pub fn store_user_data(&self, id: RegistrationId, key: StorageKey, entries: Vec<(String, String)>) -> Completion<()> {
		let malformed = entries.is_empty() || entries.iter().any(|(k, _)| k.is_empty());
		if let Some(rejected) = self.reject_user_data_request(id, malformed) {
			return rejected;
		}
		Completion::spawn(self.db_call("store_user_data", move |control| {
			let key = key.clone();
			let entries = entries.clone();
			async move { control.store_user_data(id, &key, &entries).await }.boxed()
		}))
	}

	pub fn clear_user_data(&self, id: RegistrationId, keys: Vec<String>) -> Completion<()> {
		if let Some(rejected) = self.reject_user_data_request(id, keys.is_empty()) {
			return rejected;
		}
		Completion::spawn(self.db_call("clear_user_data", move |control| {
			let keys = keys.clone();
			async move { control.clear_user_data(id, &keys).await }.boxed()
		}))
	}

	pub fn clear_user_data_by_key_prefixes(&self, id: RegistrationId, prefixes: Vec<String>) -> Completion<()> {
		if let Some(rejected) = self.reject_user_data_request(id, prefixes.is_empty()) {
			return rejected;
		}
		Completion::spawn(self.db_call("clear_user_data_by_key_prefixes", move |control| {
			let prefixes = prefixes.clone();
			async move { control.clear_user_data_by_key_prefixes(id, &prefixes).await }.boxed()
		}))
	}

	/// Clears entries starting with `prefix` across every registration.
	pub fn clear_user_data_for_all_registrations_by_key_prefix(&self, prefix: String) -> Completion<()> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.db_call("clear_user_data_for_all_registrations_by_key_prefix", move |control| {
			let prefix = prefix.clone();
			async move { control.clear_user_data_for_all_registrations_by_key_prefix(&prefix).await }.boxed()
		}))
	}

	/// `(registration id, value)` for every registration holding `key`.
	pub fn get_user_data_for_all_registrations(&self, key: String) -> Completion<Vec<(RegistrationId, String)>> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.db_call("get_user_data_for_all_registrations", move |control| {
			let key = key.clone();
			async move { control.get_user_data_for_all_registrations(&key).await }.boxed()
		}))
	}

	pub fn get_user_data_for_all_registrations_by_key_prefix(&self, prefix: String) -> Completion<Vec<(RegistrationId, String)>> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.db_call("get_user_data_for_all_registrations_by_key_prefix", move |control| {
			let prefix = prefix.clone();
			async move { control.get_user_data_for_all_registrations_by_key_prefix(&prefix).await }.boxed()
		}))
	}

	/// Local checks shared by the per-registration user data operations.
	fn reject_user_data_request<T: Send + 'static>(&self, id: RegistrationId, malformed: bool) -> Option<Completion<T>> {
		if self.is_storage_disabled() {
			return Some(Completion::ready(Err(RegistryError::Abort)));
		}
		if !id.is_valid() || malformed {
			debug!(registration = %id, "malformed user data request");
			return Some(Completion::ready(Err(RegistryError::Failed)));
		}
		None
	}
}
