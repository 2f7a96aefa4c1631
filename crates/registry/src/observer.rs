use swreg_storage::{RegistrationId, StorageKey};
use url::Url;

/// Receives registry-level notifications for the owning context.
///
/// All methods default to no-ops. They are called synchronously from the task
/// that handled the storage reply, so implementations should return quickly.
pub trait RegistryObserver: Send + Sync {
	fn on_registration_stored(&self, _registration_id: RegistrationId, _scope: &Url, _key: &StorageKey) {}

	fn on_all_registrations_deleted_for_storage_key(&self, _key: &StorageKey) {}

	/// Durable state was wiped and storage re-enabled.
	fn on_storage_wiped(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl RegistryObserver for NoOpObserver {}
