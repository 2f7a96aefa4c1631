use std::future::Future;

use futures::FutureExt;
use swreg_storage::{DatabaseError, PolicyUpdate, StorageKey};
use tracing::{debug, error, info, warn};

use super::Registry;
use crate::completion::Completion;
use crate::live::RegistrationStatus;
use crate::{RegistryError, Result};

impl Registry {
	/// Binds the storage connection and starts policy tracking for every storage
	/// key that already holds registrations.
	pub fn start(&self) -> Completion<()> {
		let handle = self.inner.connection.get_connection();
		debug!(generation = handle.generation, "registry starting");
		let keys = self.get_registered_storage_keys();
		let registry = self.clone();
		Completion::spawn(async move {
			let keys = keys.await?;
			info!(keys = keys.len(), "registry started");
			for key in &keys {
				registry.track_storage_key(key);
			}
			Ok(())
		})
	}

	pub fn get_registered_storage_keys(&self) -> Completion<Vec<StorageKey>> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.inner.connection.call("get_registered_storage_keys", |control| {
			async move { control.get_registered_storage_keys().await }.boxed()
		}))
	}

	/// Asks the backend to purge resources nothing references any more.
	pub fn perform_storage_cleanup(&self) -> Completion<()> {
		if self.is_storage_disabled() {
			return Completion::ready(Err(RegistryError::Abort));
		}
		Completion::spawn(self.inner.connection.call("perform_storage_cleanup", |control| {
			async move { control.perform_storage_cleanup().await }.boxed()
		}))
	}

	/// Disables storage locally and in the backend. Every later operation aborts.
	pub fn disable_storage(&self) -> Completion<()> {
		self.inner.storage.lock().disabled = true;
		warn!("storage disabled");
		Completion::spawn(self.inner.connection.call("disable", |control| {
			async move { control.disable().await }.boxed()
		}))
	}

	/// Re-evaluates session-only origins and sends the changes to the backend.
	pub fn on_storage_policy_changed(&self) {
		let Some(policy) = self.inner.storage_policy.as_deref() else {
			return;
		};
		let updates = self.inner.policy.lock().refresh(policy);
		self.apply_policy_updates(updates);
	}

	/// Stops all storage work ahead of [`Registry::delete_and_start_over`].
	///
	/// Later database errors no longer schedule a reset of their own.
	pub fn prepare_for_delete_and_start_over(&self) {
		let mut storage = self.inner.storage.lock();
		storage.disabled = true;
		storage.reset_scheduled = true;
	}

	/// Wipes all durable state, then re-enables storage on a fresh connection.
	///
	/// Runs even while storage is disabled.
	pub fn delete_and_start_over(&self) -> Completion<()> {
		Completion::spawn(self.start_over())
	}

	pub(super) fn schedule_delete_and_start_over(&self, op: &'static str, err: DatabaseError) {
		{
			let mut storage = self.inner.storage.lock();
			if storage.reset_scheduled {
				debug!(op, error = %err, "reset already scheduled");
				return;
			}
			storage.reset_scheduled = true;
			storage.disabled = true;
		}
		warn!(op, error = %err, "database error, scheduling delete and start over");
		let reset = self.start_over();
		tokio::spawn(async move {
			if let Err(err) = reset.await {
				error!(error = %err, "delete and start over failed");
			}
		});
	}

	fn start_over(&self) -> impl Future<Output = Result<()>> + Send + 'static {
		let reply = self.inner.connection.call("delete_and_start_over", |control| {
			async move { control.delete_and_start_over().await }.boxed()
		});
		let registry = self.clone();
		async move {
			match reply.await? {
				Ok(()) => {
					registry.did_start_over();
					Ok(())
				}
				Err(err) => {
					error!(error = %err, "storage wipe failed, storage stays disabled");
					registry.inner.storage.lock().reset_scheduled = false;
					Err(err.into())
				}
			}
		}
	}

	fn did_start_over(&self) {
		self.inner.connection.reset();
		self.inner.policy.lock().clear();
		for registration in self.inner.live.registrations() {
			registration.set_stored(false);
		}
		for registration in self.inner.cache.clear_uninstalling() {
			registration.mark_deleted();
			registration.set_status(RegistrationStatus::Uninstalled);
		}
		{
			let mut storage = self.inner.storage.lock();
			storage.disabled = false;
			storage.reset_scheduled = false;
			storage.registered_keys.clear();
		}
		info!("storage wiped and re-enabled");
		self.inner.observer.on_storage_wiped();
	}

	/// Starts policy tracking for `key` unless it is already tracked.
	pub(super) fn track_storage_key(&self, key: &StorageKey) {
		let update = {
			let mut storage = self.inner.storage.lock();
			if !storage.registered_keys.insert(key.clone()) {
				return;
			}
			self.inner
				.policy
				.lock()
				.start_tracking(key, self.inner.storage_policy.as_deref())
		};
		self.apply_policy_updates(update.into_iter().collect());
	}

	pub(super) fn untrack_storage_key(&self, key: &StorageKey) {
		let mut storage = self.inner.storage.lock();
		if storage.registered_keys.remove(key) {
			self.inner.policy.lock().stop_tracking(key);
		}
	}

	fn apply_policy_updates(&self, updates: Vec<PolicyUpdate>) {
		if updates.is_empty() || !self.inner.config.track_storage_policy || self.is_storage_disabled() {
			return;
		}
		debug!(origins = updates.len(), "applying storage policy updates");
		let reply = self.db_call("apply_policy_updates", move |control| {
			let updates = updates.clone();
			async move { control.apply_policy_updates(updates).await }.boxed()
		});
		tokio::spawn(async move {
			if let Err(err) = reply.await {
				debug!(error = %err, "storage policy update failed");
			}
		});
	}
}
