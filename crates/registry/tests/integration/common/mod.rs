//! Common fixtures for registry integration tests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use swreg_registry::{
	BucketLocator, FetchHandlerExistence, QuotaClient, QuotaError, Registration, RegistrationOptions, Registry, RegistryConfig,
	RegistryObserver, StoragePolicy, Version, VersionStatus,
};
use swreg_storage::{
	MemoryStorage, NavigationPreloadState, RegistrationData, RegistrationId, ResourceId, ResourceRecord, ScriptType, StorageKey, UpdateViaCache,
	VersionId,
};
use url::Url;

pub const ORIGIN: &str = "https://a.test";

pub fn url(s: &str) -> Url {
	Url::parse(s).unwrap()
}

/// `https://a.test` joined with `path`.
pub fn at(path: &str) -> Url {
	url(&format!("{ORIGIN}{path}"))
}

pub fn key() -> StorageKey {
	StorageKey::first_party(&at("/"))
}

/// Durable record for `scope` with a single resource, for seeding storage directly.
pub fn record(id: u64, scope: &str, version: u64, size: u64) -> (RegistrationData, Vec<ResourceRecord>) {
	let data = RegistrationData {
		registration_id: RegistrationId(id),
		scope: at(scope),
		storage_key: key(),
		script: at("/sw.js"),
		script_type: ScriptType::Classic,
		update_via_cache: UpdateViaCache::default(),
		version_id: VersionId(version),
		is_active: true,
		has_fetch_handler: true,
		last_update_check: None,
		used_features: BTreeSet::new(),
		resources_total_size_bytes: size,
		navigation_preload: NavigationPreloadState::default(),
		cross_origin_embedder_policy: None,
		origin_trial_tokens: None,
	};
	let resources = vec![ResourceRecord {
		resource_id: ResourceId(version * 10),
		url: at("/sw.js"),
		size_bytes: size,
		sha256_checksum: None,
	}];
	(data, resources)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaEvent {
	Accessed(StorageKey),
	Modified(StorageKey, i64),
	WriteFailed(StorageKey),
}

#[derive(Default)]
pub struct RecordingQuota {
	events: Mutex<Vec<QuotaEvent>>,
	refuse_buckets: AtomicBool,
}

impl RecordingQuota {
	pub fn refuse_buckets(&self) {
		self.refuse_buckets.store(true, Ordering::SeqCst);
	}

	pub fn events(&self) -> Vec<QuotaEvent> {
		self.events.lock().clone()
	}

	/// Size deltas reported so far, in order.
	pub fn deltas(&self) -> Vec<i64> {
		self.events
			.lock()
			.iter()
			.filter_map(|e| match e {
				QuotaEvent::Modified(_, delta) => Some(*delta),
				_ => None,
			})
			.collect()
	}
}

#[async_trait]
impl QuotaClient for RecordingQuota {
	async fn get_or_create_bucket(&self, key: &StorageKey) -> Result<BucketLocator, QuotaError> {
		if self.refuse_buckets.load(Ordering::SeqCst) {
			return Err(QuotaError::BucketUnavailable(key.clone()));
		}
		Ok(BucketLocator {
			id: 1,
			storage_key: key.clone(),
		})
	}

	fn notify_storage_accessed(&self, key: &StorageKey, _at: DateTime<Utc>) {
		self.events.lock().push(QuotaEvent::Accessed(key.clone()));
	}

	fn notify_storage_modified(&self, key: &StorageKey, delta: i64, _at: DateTime<Utc>) {
		self.events.lock().push(QuotaEvent::Modified(key.clone(), delta));
	}

	fn notify_write_failed(&self, key: &StorageKey) {
		self.events.lock().push(QuotaEvent::WriteFailed(key.clone()));
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
	Stored(RegistrationId),
	AllDeleted(StorageKey),
	Wiped,
}

#[derive(Default)]
pub struct RecordingObserver {
	events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
	pub fn events(&self) -> Vec<Observed> {
		self.events.lock().clone()
	}
}

impl RegistryObserver for RecordingObserver {
	fn on_registration_stored(&self, registration_id: RegistrationId, _scope: &Url, _key: &StorageKey) {
		self.events.lock().push(Observed::Stored(registration_id));
	}

	fn on_all_registrations_deleted_for_storage_key(&self, key: &StorageKey) {
		self.events.lock().push(Observed::AllDeleted(key.clone()));
	}

	fn on_storage_wiped(&self) {
		self.events.lock().push(Observed::Wiped);
	}
}

/// Origins that must be purged on shutdown.
#[derive(Default)]
pub struct SessionOnly(pub Mutex<BTreeSet<String>>);

impl StoragePolicy for SessionOnly {
	fn should_purge_on_shutdown(&self, origin: &str) -> bool {
		self.0.lock().contains(origin)
	}
}

pub struct Harness {
	pub storage: MemoryStorage,
	pub registry: Registry,
	pub quota: Arc<RecordingQuota>,
	pub observer: Arc<RecordingObserver>,
	pub policy: Arc<SessionOnly>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_config(RegistryConfig::default())
	}

	pub fn with_config(config: RegistryConfig) -> Self {
		let _ = tracing_subscriber::fmt().with_test_writer().try_init();
		let storage = MemoryStorage::new();
		let quota = Arc::new(RecordingQuota::default());
		let observer = Arc::new(RecordingObserver::default());
		let policy = Arc::new(SessionOnly::default());
		let registry = Registry::builder(Arc::new(storage.clone()))
			.config(config)
			.quota_client(quota.clone())
			.observer(observer.clone())
			.storage_policy(policy.clone())
			.build();
		Self {
			storage,
			registry,
			quota,
			observer,
			policy,
		}
	}

	pub async fn registration(&self, scope: &str) -> Arc<Registration> {
		self.registry
			.create_new_registration(RegistrationOptions::new(at(scope)), key())
			.await
			.unwrap()
			.expect("registration id")
	}

	/// An activated version whose resources have the given sizes.
	pub async fn version(&self, registration: &Registration, sizes: &[u64]) -> Arc<Version> {
		let version = self
			.registry
			.create_new_version(registration, at("/sw.js"), ScriptType::Classic)
			.await
			.unwrap()
			.expect("version id");
		let mut resources = Vec::new();
		for size in sizes {
			let resource_id = self.registry.get_new_resource_id().await.unwrap();
			self.registry.store_uncommitted_resource_id(resource_id, key()).await.unwrap();
			resources.push(ResourceRecord {
				resource_id,
				url: at("/sw.js"),
				size_bytes: *size,
				sha256_checksum: None,
			});
		}
		version.set_resources(resources);
		version.set_fetch_handler_existence(FetchHandlerExistence::Exists);
		version.set_status(VersionStatus::Activated);
		version
	}

	/// A registration stored with one resource of `size` bytes.
	pub async fn stored(&self, scope: &str, size: u64) -> (Arc<Registration>, Arc<Version>) {
		let registration = self.registration(scope).await;
		let version = self.version(&registration, &[size]).await;
		registration.set_active_version(version.clone());
		self.registry
			.store_registration(registration.clone(), version.clone())
			.await
			.unwrap();
		(registration, version)
	}
}

/// Polls `check` until it holds or a couple of seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
	for _ in 0..1000 {
		if check() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(2)).await;
	}
	panic!("condition never became true");
}
