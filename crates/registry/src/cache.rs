//! Installing and uninstalling registration sets.
//!
//! A registration is *installing* from the moment its owner starts installing a
//! version until the install finishes, whether or not a durable record exists yet.
//! It is *uninstalling* from the moment a durable delete is issued until the
//! delete replies. Both sets answer lookups without a storage round-trip.
//!
//! The cache is also the only place live objects are materialized from storage
//! replies ([`RegistrationCache::get_or_create_registration`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use swreg_storage::{FoundRegistration, LiveVersionRef, LongestScopeMatcher, RegistrationData, RegistrationId, ResourceRecord, StorageKey};
use tracing::debug;
use url::Url;

use crate::live::{LiveObjects, Registration, RegistrationStatus, Version};

#[derive(Default)]
struct Sets {
	installing: BTreeMap<RegistrationId, Arc<Registration>>,
	uninstalling: BTreeMap<RegistrationId, Arc<Registration>>,
}

pub(crate) struct RegistrationCache {
	live: Arc<LiveObjects>,
	sets: Mutex<Sets>,
}

impl RegistrationCache {
	pub(crate) fn new(live: Arc<LiveObjects>) -> Self {
		Self {
			live,
			sets: Mutex::new(Sets::default()),
		}
	}

	/// # Panics
	///
	/// Panics if the registration is already installing.
	pub(crate) fn notify_installing(&self, registration: &Arc<Registration>) {
		let previous = self.sets.lock().installing.insert(registration.id(), Arc::clone(registration));
		assert!(previous.is_none(), "registration {} is already installing", registration.id());
		debug!(registration = %registration.id(), scope = %registration.scope(), "installing");
	}

	pub(crate) fn notify_done_installing(&self, id: RegistrationId) -> Option<Arc<Registration>> {
		self.sets.lock().installing.remove(&id)
	}

	pub(crate) fn is_installing(&self, id: RegistrationId) -> bool {
		self.sets.lock().installing.contains_key(&id)
	}

	/// Installing registration with exactly `scope`. Deleted ones never match.
	pub(crate) fn find_installing_for_scope(&self, scope: &Url, key: &StorageKey) -> Option<Arc<Registration>> {
		self.sets
			.lock()
			.installing
			.values()
			.find(|r| !r.is_deleted() && r.scope() == scope && r.key() == key)
			.cloned()
	}

	/// Longest-scope match among installing registrations that are not deleted.
	///
	/// Candidates are scanned in ascending id order; among equal-length scopes the
	/// lowest id wins.
	pub(crate) fn find_installing_for_client_url(&self, client_url: &Url, key: &StorageKey) -> Option<Arc<Registration>> {
		let sets = self.sets.lock();
		let mut matcher = LongestScopeMatcher::new(client_url);
		let mut best = None;
		for registration in sets.installing.values().filter(|r| !r.is_deleted() && r.key() == key) {
			if matcher.match_longest(registration.scope()) {
				best = Some(registration);
			}
		}
		best.cloned()
	}

	pub(crate) fn find_installing_for_id(&self, id: RegistrationId) -> Option<Arc<Registration>> {
		self.sets.lock().installing.get(&id).cloned()
	}

	pub(crate) fn installing_for_storage_key(&self, key: &StorageKey) -> Vec<Arc<Registration>> {
		self.sets
			.lock()
			.installing
			.values()
			.filter(|r| !r.is_deleted() && r.key() == key)
			.cloned()
			.collect()
	}

	pub(crate) fn installing(&self) -> Vec<Arc<Registration>> {
		self.sets.lock().installing.values().filter(|r| !r.is_deleted()).cloned().collect()
	}

	/// Marks `registration` as uninstalling. Takes effect immediately, before any
	/// storage reply.
	pub(crate) fn notify_deleting(&self, registration: &Arc<Registration>) {
		registration.set_status(RegistrationStatus::Uninstalling);
		self.sets.lock().uninstalling.insert(registration.id(), Arc::clone(registration));
		debug!(registration = %registration.id(), "uninstalling");
	}

	pub(crate) fn notify_done_deleting(&self, registration: &Registration, status: RegistrationStatus) {
		self.sets.lock().uninstalling.remove(&registration.id());
		registration.set_status(status);
	}

	pub(crate) fn uninstalling_for_storage_key(&self, key: &StorageKey) -> Vec<Arc<Registration>> {
		self.sets.lock().uninstalling.values().filter(|r| r.key() == key).cloned().collect()
	}

	pub(crate) fn clear_uninstalling(&self) -> Vec<Arc<Registration>> {
		std::mem::take(&mut self.sets.lock().uninstalling).into_values().collect()
	}

	/// Returns the live registration for a storage reply, creating it on a miss.
	///
	/// Every path that materializes a registration from storage goes through
	/// here, so one id never maps to two objects.
	pub(crate) fn get_or_create_registration(&self, found: FoundRegistration) -> Arc<Registration> {
		let FoundRegistration {
			registration: data,
			resources,
			version_reference,
		} = found;
		if let Some(existing) = self.live.registration(data.registration_id) {
			if let Some(reference) = version_reference
				&& let Some(version) = self.live.version(reference.version_id())
			{
				version.attach_reference(reference);
			}
			return existing;
		}
		let version = self.get_or_create_version(&data, resources, version_reference);
		self.live
			.get_or_insert_registration_with(data.registration_id, || Registration::from_record(&data, version))
	}

	pub(crate) fn get_or_create_version(
		&self,
		data: &RegistrationData,
		resources: Vec<ResourceRecord>,
		reference: Option<LiveVersionRef>,
	) -> Arc<Version> {
		let version = self.live.get_or_insert_version_with(data.version_id, || Version::from_record(data, resources));
		if let Some(reference) = reference {
			version.attach_reference(reference);
		}
		version
	}
}
