//! Session-only storage policy tracking.
//!
//! Every origin with at least one stored registration is tracked. The backend is
//! told which of those origins must be purged on shutdown, and told again when the
//! answer for an origin changes.

use std::collections::BTreeMap;

use swreg_storage::{PolicyUpdate, StorageKey};

/// Answers storage policy questions for an origin.
pub trait StoragePolicy: Send + Sync {
	fn should_purge_on_shutdown(&self, origin: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackedOrigin {
	keys: usize,
	purge_on_shutdown: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PolicyTracker {
	origins: BTreeMap<String, TrackedOrigin>,
}

impl PolicyTracker {
	/// Counts one more storage key for the key's origin.
	///
	/// Returns an update when a newly tracked origin must be purged on shutdown.
	pub(crate) fn start_tracking(&mut self, key: &StorageKey, policy: Option<&dyn StoragePolicy>) -> Option<PolicyUpdate> {
		if let Some(tracked) = self.origins.get_mut(key.origin()) {
			tracked.keys += 1;
			return None;
		}
		let purge_on_shutdown = policy.is_some_and(|p| p.should_purge_on_shutdown(key.origin()));
		self.origins.insert(
			key.origin().to_string(),
			TrackedOrigin {
				keys: 1,
				purge_on_shutdown,
			},
		);
		purge_on_shutdown.then(|| PolicyUpdate {
			origin: key.origin().to_string(),
			purge_on_shutdown,
		})
	}

	pub(crate) fn stop_tracking(&mut self, key: &StorageKey) {
		if let Some(tracked) = self.origins.get_mut(key.origin()) {
			tracked.keys -= 1;
			if tracked.keys == 0 {
				self.origins.remove(key.origin());
			}
		}
	}

	/// Re-evaluates every tracked origin and returns the ones whose answer changed.
	pub(crate) fn refresh(&mut self, policy: &dyn StoragePolicy) -> Vec<PolicyUpdate> {
		let mut updates = Vec::new();
		for (origin, tracked) in &mut self.origins {
			let purge_on_shutdown = policy.should_purge_on_shutdown(origin);
			if purge_on_shutdown != tracked.purge_on_shutdown {
				tracked.purge_on_shutdown = purge_on_shutdown;
				updates.push(PolicyUpdate {
					origin: origin.clone(),
					purge_on_shutdown,
				});
			}
		}
		updates
	}

	pub(crate) fn clear(&mut self) {
		self.origins.clear();
	}

	pub(crate) fn is_tracking(&self, origin: &str) -> bool {
		self.origins.contains_key(origin)
	}
}
