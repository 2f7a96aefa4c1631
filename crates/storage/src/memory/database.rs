//! Record tables backing [`super::MemoryStorage`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::DatabaseError;
use crate::scope::LongestScopeMatcher;
use crate::types::{DeleteOutcome, RegistrationData, RegistrationId, ResourceId, ResourceRecord, StorageKey, StoreOutcome, VersionId};

type DbResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Clone)]
pub(super) struct StoredRegistration {
	pub data: RegistrationData,
	pub resources: Vec<ResourceRecord>,
}

#[derive(Debug)]
pub(super) struct Database {
	records: BTreeMap<RegistrationId, StoredRegistration>,
	user_data: BTreeMap<(RegistrationId, String), String>,
	uncommitted: BTreeSet<ResourceId>,
	purgeable: BTreeSet<ResourceId>,
	next_registration_id: u64,
	next_version_id: u64,
	next_resource_id: u64,
	pub disabled: bool,
}

impl Default for Database {
	fn default() -> Self {
		Self {
			records: BTreeMap::new(),
			user_data: BTreeMap::new(),
			uncommitted: BTreeSet::new(),
			purgeable: BTreeSet::new(),
			next_registration_id: 1,
			next_version_id: 1,
			next_resource_id: 1,
			disabled: false,
		}
	}
}

impl Database {
	pub fn set_next_registration_id(&mut self, id: u64) {
		self.next_registration_id = id.max(1);
	}

	pub fn new_registration_id(&mut self) -> RegistrationId {
		let id = RegistrationId(self.next_registration_id);
		self.next_registration_id += 1;
		id
	}

	pub fn new_version_id(&mut self) -> VersionId {
		let id = VersionId(self.next_version_id);
		self.next_version_id += 1;
		id
	}

	pub fn new_resource_id(&mut self) -> ResourceId {
		let id = ResourceId(self.next_resource_id);
		self.next_resource_id += 1;
		id
	}

	/// Drops every record and re-enables the database. Id counters keep running
	/// so ids are never reused across a wipe.
	pub fn wipe(&mut self) {
		self.records.clear();
		self.user_data.clear();
		self.uncommitted.clear();
		self.purgeable.clear();
		self.disabled = false;
	}

	pub fn storage_keys(&self) -> Vec<StorageKey> {
		let keys: BTreeSet<_> = self.records.values().map(|r| r.data.storage_key.clone()).collect();
		keys.into_iter().collect()
	}

	pub fn record(&self, id: RegistrationId) -> Option<&StoredRegistration> {
		self.records.get(&id)
	}

	pub fn records(&self) -> impl Iterator<Item = &StoredRegistration> {
		self.records.values()
	}

	fn record_for_key(&self, id: RegistrationId, key: &StorageKey) -> DbResult<&StoredRegistration> {
		self.records.get(&id).filter(|r| &r.data.storage_key == key).ok_or(DatabaseError::NotFound)
	}

	fn record_for_key_mut(&mut self, id: RegistrationId, key: &StorageKey) -> DbResult<&mut StoredRegistration> {
		self.records
			.get_mut(&id)
			.filter(|r| &r.data.storage_key == key)
			.ok_or(DatabaseError::NotFound)
	}

	pub fn find_for_client_url(&self, client_url: &Url, key: &StorageKey) -> DbResult<StoredRegistration> {
		let mut matcher = LongestScopeMatcher::new(client_url);
		let mut best = None;
		for record in self.records.values().filter(|r| &r.data.storage_key == key) {
			if matcher.match_longest(&record.data.scope) {
				best = Some(record);
			}
		}
		best.cloned().ok_or(DatabaseError::NotFound)
	}

	pub fn find_for_scope(&self, scope: &Url, key: &StorageKey) -> DbResult<StoredRegistration> {
		self.records
			.values()
			.find(|r| &r.data.storage_key == key && &r.data.scope == scope)
			.cloned()
			.ok_or(DatabaseError::NotFound)
	}

	pub fn find_for_id(&self, id: RegistrationId, key: Option<&StorageKey>) -> DbResult<StoredRegistration> {
		match key {
			Some(key) => self.record_for_key(id, key).cloned(),
			None => self.records.get(&id).cloned().ok_or(DatabaseError::NotFound),
		}
	}

	pub fn for_storage_key(&self, key: &StorageKey) -> Vec<StoredRegistration> {
		self.records.values().filter(|r| &r.data.storage_key == key).cloned().collect()
	}

	pub fn store(&mut self, data: RegistrationData, resources: Vec<ResourceRecord>) -> DbResult<StoreOutcome> {
		if !data.registration_id.is_valid() || !data.version_id.is_valid() || resources.is_empty() {
			return Err(DatabaseError::Failed);
		}
		let total: u64 = resources.iter().map(|r| r.size_bytes).sum();
		if total != data.resources_total_size_bytes {
			return Err(DatabaseError::Failed);
		}

		// The (key, scope) pair is unique: a record under another id is superseded.
		let superseded: Vec<RegistrationId> = self
			.records
			.values()
			.filter(|r| r.data.storage_key == data.storage_key && r.data.scope == data.scope)
			.map(|r| r.data.registration_id)
			.chain(self.records.contains_key(&data.registration_id).then_some(data.registration_id))
			.collect();

		let keep: BTreeSet<ResourceId> = resources.iter().map(|r| r.resource_id).collect();
		let mut outcome = StoreOutcome::default();
		for id in superseded {
			let Some(old) = self.records.remove(&id) else {
				continue;
			};
			outcome.deleted_version_id = Some(old.data.version_id);
			outcome.deleted_resources_size += old.data.resources_total_size_bytes;
			self.purgeable
				.extend(old.resources.iter().map(|r| r.resource_id).filter(|id| !keep.contains(id)));
		}

		for id in &keep {
			self.uncommitted.remove(id);
		}
		self.records.insert(data.registration_id, StoredRegistration { data, resources });
		Ok(outcome)
	}

	pub fn delete(&mut self, id: RegistrationId, key: &StorageKey) -> DbResult<DeleteOutcome> {
		self.record_for_key(id, key)?;
		let Some(old) = self.records.remove(&id) else {
			return Err(DatabaseError::NotFound);
		};
		self.user_data.retain(|(owner, _), _| *owner != id);
		self.purgeable.extend(old.resources.iter().map(|r| r.resource_id));
		Ok(DeleteOutcome {
			deleted_resources_size: old.data.resources_total_size_bytes,
			storage_key_is_empty: !self.records.values().any(|r| &r.data.storage_key == key),
		})
	}

	pub fn update_to_active_state(&mut self, id: RegistrationId, key: &StorageKey) -> DbResult<()> {
		self.record_for_key_mut(id, key)?.data.is_active = true;
		Ok(())
	}

	pub fn update_last_update_check_time(&mut self, id: RegistrationId, key: &StorageKey, time: DateTime<Utc>) -> DbResult<()> {
		self.record_for_key_mut(id, key)?.data.last_update_check = Some(time);
		Ok(())
	}

	pub fn update_navigation_preload_enabled(&mut self, id: RegistrationId, key: &StorageKey, enable: bool) -> DbResult<()> {
		self.record_for_key_mut(id, key)?.data.navigation_preload.enabled = enable;
		Ok(())
	}

	pub fn update_navigation_preload_header(&mut self, id: RegistrationId, key: &StorageKey, value: &str) -> DbResult<()> {
		self.record_for_key_mut(id, key)?.data.navigation_preload.header = value.to_string();
		Ok(())
	}

	pub fn store_uncommitted(&mut self, id: ResourceId) -> DbResult<()> {
		if !id.is_valid() {
			return Err(DatabaseError::Failed);
		}
		self.uncommitted.insert(id);
		Ok(())
	}

	pub fn doom_uncommitted(&mut self, ids: &[ResourceId]) -> DbResult<()> {
		for id in ids {
			self.uncommitted.remove(id);
			self.purgeable.insert(*id);
		}
		Ok(())
	}

	pub fn uncommitted(&self) -> &BTreeSet<ResourceId> {
		&self.uncommitted
	}

	pub fn purgeable(&self) -> &BTreeSet<ResourceId> {
		&self.purgeable
	}

	/// Releases purgeable resources no live version still pins.
	pub fn purge(&mut self, pinned: &BTreeSet<ResourceId>) -> usize {
		let before = self.purgeable.len();
		self.purgeable.retain(|id| pinned.contains(id));
		before - self.purgeable.len()
	}

	pub fn resource_ids_of(&self, version_id: VersionId) -> Vec<ResourceId> {
		self.records
			.values()
			.filter(|r| r.data.version_id == version_id)
			.flat_map(|r| r.resources.iter().map(|res| res.resource_id))
			.collect()
	}

	fn ensure_registration(&self, id: RegistrationId) -> DbResult<()> {
		if self.records.contains_key(&id) { Ok(()) } else { Err(DatabaseError::NotFound) }
	}

	pub fn get_user_data(&self, id: RegistrationId, keys: &[String]) -> DbResult<Vec<String>> {
		self.ensure_registration(id)?;
		keys.iter()
			.map(|k| self.user_data.get(&(id, k.clone())).cloned().ok_or(DatabaseError::NotFound))
			.collect()
	}

	fn user_entries_with_prefix<'a>(&'a self, id: RegistrationId, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a String)> + 'a {
		self.user_data
			.range((id, prefix.to_string())..)
			.take_while(move |((owner, key), _)| *owner == id && key.starts_with(prefix))
			.map(|((_, key), value)| (key, value))
	}

	pub fn get_user_data_by_key_prefix(&self, id: RegistrationId, prefix: &str) -> DbResult<Vec<String>> {
		self.ensure_registration(id)?;
		Ok(self.user_entries_with_prefix(id, prefix).map(|(_, v)| v.clone()).collect())
	}

	pub fn get_user_keys_and_data_by_key_prefix(&self, id: RegistrationId, prefix: &str) -> DbResult<BTreeMap<String, String>> {
		self.ensure_registration(id)?;
		Ok(self
			.user_entries_with_prefix(id, prefix)
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect())
	}

	pub fn store_user_data(&mut self, id: RegistrationId, key: &StorageKey, entries: &[(String, String)]) -> DbResult<()> {
		if entries.is_empty() || entries.iter().any(|(k, _)| k.is_empty()) {
			return Err(DatabaseError::Failed);
		}
		self.record_for_key(id, key)?;
		for (k, v) in entries {
			self.user_data.insert((id, k.clone()), v.clone());
		}
		Ok(())
	}

	pub fn clear_user_data(&mut self, id: RegistrationId, keys: &[String]) -> DbResult<()> {
		for k in keys {
			self.user_data.remove(&(id, k.clone()));
		}
		Ok(())
	}

	pub fn clear_user_data_by_key_prefixes(&mut self, id: RegistrationId, prefixes: &[String]) -> DbResult<()> {
		self.user_data
			.retain(|(owner, key), _| *owner != id || !prefixes.iter().any(|p| key.starts_with(p.as_str())));
		Ok(())
	}

	pub fn clear_user_data_for_all_registrations_by_key_prefix(&mut self, prefix: &str) -> DbResult<()> {
		self.user_data.retain(|(_, key), _| !key.starts_with(prefix));
		Ok(())
	}

	pub fn get_user_data_for_all_registrations(&self, key: &str) -> DbResult<Vec<(RegistrationId, String)>> {
		Ok(self
			.user_data
			.iter()
			.filter(|((_, k), _)| k == key)
			.map(|((id, _), v)| (*id, v.clone()))
			.collect())
	}

	pub fn get_user_data_for_all_registrations_by_key_prefix(&self, prefix: &str) -> DbResult<Vec<(RegistrationId, String)>> {
		Ok(self
			.user_data
			.iter()
			.filter(|((_, k), _)| k.starts_with(prefix))
			.map(|((id, _), v)| (*id, v.clone()))
			.collect())
	}

	pub fn usage_for_storage_key(&self, key: &StorageKey) -> u64 {
		self.records
			.values()
			.filter(|r| &r.data.storage_key == key)
			.map(|r| r.data.resources_total_size_bytes)
			.sum()
	}
}
