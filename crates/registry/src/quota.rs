//! Quota collaborator and the notifier that feeds it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use swreg_storage::StorageKey;
use tracing::trace;

/// Storage bucket resolved for a storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketLocator {
	pub id: u64,
	pub storage_key: StorageKey,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
	#[error("bucket unavailable for {0}")]
	BucketUnavailable(StorageKey),
	#[error("quota database error: {0}")]
	Database(String),
}

/// Usage accounting collaborator.
#[async_trait]
pub trait QuotaClient: Send + Sync {
	async fn get_or_create_bucket(&self, key: &StorageKey) -> Result<BucketLocator, QuotaError>;

	fn notify_storage_accessed(&self, key: &StorageKey, at: DateTime<Utc>);

	/// `delta` is in bytes and may be negative.
	fn notify_storage_modified(&self, key: &StorageKey, delta: i64, at: DateTime<Utc>);

	fn notify_write_failed(&self, key: &StorageKey);
}

/// Forwards registry events to an optional [`QuotaClient`].
#[derive(Clone, Default)]
pub(crate) struct QuotaNotifier {
	client: Option<Arc<dyn QuotaClient>>,
}

impl QuotaNotifier {
	pub(crate) fn new(client: Option<Arc<dyn QuotaClient>>) -> Self {
		Self { client }
	}

	/// Resolves the bucket for `key`. Succeeds trivially without a client.
	pub(crate) async fn ensure_bucket(&self, key: &StorageKey) -> Result<(), QuotaError> {
		match &self.client {
			Some(client) => client.get_or_create_bucket(key).await.map(|bucket| {
				trace!(bucket = bucket.id, key = %key, "quota bucket resolved");
			}),
			None => Ok(()),
		}
	}

	pub(crate) fn storage_accessed(&self, key: &StorageKey) {
		if let Some(client) = &self.client {
			client.notify_storage_accessed(key, Utc::now());
		}
	}

	pub(crate) fn storage_modified(&self, key: &StorageKey, delta: i64) {
		if delta == 0 {
			return;
		}
		if let Some(client) = &self.client {
			trace!(key = %key, delta, "quota storage modified");
			client.notify_storage_modified(key, delta, Utc::now());
		}
	}

	pub(crate) fn write_failed(&self, key: &StorageKey) {
		if let Some(client) = &self.client {
			client.notify_write_failed(key);
		}
	}
}
