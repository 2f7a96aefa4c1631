use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use swreg_storage::{LiveVersionRef, RegistrationId, VersionId};
use tracing::trace;

use super::{Registration, Version};

/// Id-keyed tables of every live registration and version.
///
/// Entries are weak: an object lives exactly as long as some external holder (or
/// the installing/uninstalling sets) keeps a strong reference.
#[derive(Debug, Default)]
pub struct LiveObjects {
	registrations: Mutex<FxHashMap<RegistrationId, Weak<Registration>>>,
	versions: Mutex<FxHashMap<VersionId, Weak<Version>>>,
}

impl LiveObjects {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn registration(&self, id: RegistrationId) -> Option<Arc<Registration>> {
		self.registrations.lock().get(&id).and_then(Weak::upgrade)
	}

	pub fn version(&self, id: VersionId) -> Option<Arc<Version>> {
		self.versions.lock().get(&id).and_then(Weak::upgrade)
	}

	/// Returns the live registration for `id`, or inserts the one built by `make`.
	///
	/// Lookup and insertion happen under one lock, so two racing callers always
	/// end up with the same object.
	pub(crate) fn get_or_insert_registration_with(&self, id: RegistrationId, make: impl FnOnce() -> Registration) -> Arc<Registration> {
		let mut table = self.registrations.lock();
		if let Some(existing) = table.get(&id).and_then(Weak::upgrade) {
			return existing;
		}
		table.retain(|_, weak| weak.strong_count() > 0);
		let registration = Arc::new(make());
		table.insert(id, Arc::downgrade(&registration));
		trace!(registration = %id, "live registration created");
		registration
	}

	pub(crate) fn get_or_insert_version_with(&self, id: VersionId, make: impl FnOnce() -> Version) -> Arc<Version> {
		let mut table = self.versions.lock();
		if let Some(existing) = table.get(&id).and_then(Weak::upgrade) {
			return existing;
		}
		table.retain(|_, weak| weak.strong_count() > 0);
		let version = Arc::new(make());
		table.insert(id, Arc::downgrade(&version));
		trace!(version = %id, "live version created");
		version
	}

	pub fn registrations(&self) -> Vec<Arc<Registration>> {
		self.registrations.lock().values().filter_map(Weak::upgrade).collect()
	}

	/// Live versions whose backend state must survive a reconnect.
	pub fn recoverable_versions(&self) -> Vec<Arc<Version>> {
		let mut versions: Vec<_> = self
			.versions
			.lock()
			.values()
			.filter_map(Weak::upgrade)
			.filter(|v| !v.is_redundant())
			.collect();
		versions.sort_by_key(|v| v.id());
		versions
	}

	/// Hands references from a recovered connection back to their versions.
	pub(crate) fn reattach_references(&self, references: Vec<LiveVersionRef>) {
		for reference in references {
			match self.version(reference.version_id()) {
				Some(version) => version.replace_reference(reference),
				None => trace!(version = %reference.version_id(), "recovered reference for dead version dropped"),
			}
		}
	}
}
