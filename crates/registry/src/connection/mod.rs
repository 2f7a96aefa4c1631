//! Storage connection manager.
//!
//! Owns the single bound [`StorageControl`] handle and every storage call that
//! has been issued but not yet answered.
//!
//! # Phases
//!
//! | Phase | New calls | Disconnect |
//! |---|---|---|
//! | `Normal` | run immediately | enter `Recovering`, rebind, send `recover` |
//! | `Recovering` | queued | count a retry, rebind, resend `recover` |
//!
//! When `recover` replies, the phase returns to `Normal` and every inflight call
//! (interrupted or queued) is run once more on the new handle, in the order the
//! calls were started.
//!
//! # Invariants
//!
//! - Disconnect signals and recovery replies carry the generation of the handle
//!   they came from; anything older than the current handle is ignored.
//! - A call is removed from the inflight set before its reply is forwarded, and
//!   its reply is forwarded at most once.
//! - More than `max_retries` failed recovery attempts in a row abort the process.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use swreg_storage::{Disconnected, LiveVersionInfo, LiveVersionRef, Remote, StorageBackend, StorageControl};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::live::LiveObjects;
use crate::{RegistryError, Result};

mod call;

use call::{Call, InflightCall};

/// Identifies one inflight call. Allocated in start order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct CallId(u64);

impl fmt::Display for CallId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Normal,
	Recovering,
}

/// A bound handle and the generation it was bound under.
#[derive(Clone)]
pub(crate) struct StorageHandle {
	pub(crate) control: Arc<dyn StorageControl>,
	pub(crate) generation: u64,
	watcher: CancellationToken,
}

/// Recovery statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
	/// Completed recoveries.
	pub recoveries: u64,
	/// Failed attempts preceding each completed recovery, keyed by retry count.
	pub retry_histogram: BTreeMap<u32, u64>,
}

impl ConnectionMetrics {
	fn record_recovery(&mut self, retries: u32) {
		self.recoveries += 1;
		*self.retry_histogram.entry(retries).or_default() += 1;
	}
}

struct ConnectionState {
	handle: Option<StorageHandle>,
	next_generation: u64,
	phase: Phase,
	retries: u32,
	inflight: BTreeMap<CallId, Arc<dyn InflightCall>>,
	next_call_id: u64,
	metrics: ConnectionMetrics,
}

pub(crate) struct Shared {
	backend: Arc<dyn StorageBackend>,
	live: Arc<LiveObjects>,
	max_retries: u32,
	state: Mutex<ConnectionState>,
}

/// Cheap handle to the connection manager.
#[derive(Clone)]
pub(crate) struct ConnectionManager {
	shared: Arc<Shared>,
}

impl ConnectionManager {
	pub(crate) fn new(backend: Arc<dyn StorageBackend>, live: Arc<LiveObjects>, max_retries: u32) -> Self {
		Self {
			shared: Arc::new(Shared {
				backend,
				live,
				max_retries,
				state: Mutex::new(ConnectionState {
					handle: None,
					next_generation: 1,
					phase: Phase::Normal,
					retries: 0,
					inflight: BTreeMap::new(),
					next_call_id: 1,
					metrics: ConnectionMetrics::default(),
				}),
			}),
		}
	}

	/// Returns the bound handle, binding one first if none is held.
	///
	/// The handle may disconnect at any time after this returns.
	pub(crate) fn get_connection(&self) -> StorageHandle {
		let mut state = self.shared.state.lock();
		self.shared.current_handle(&mut state)
	}

	/// Issues one storage call.
	///
	/// The call is registered (and run, unless recovering) before this returns;
	/// the returned future only waits for the reply. `invoker` may run more than
	/// once, each time against a different handle, so it must own copies of its
	/// arguments rather than move them out.
	pub(crate) fn call<R, F>(&self, op: &'static str, invoker: F) -> impl Future<Output = Result<R>> + Send + 'static
	where
		R: Send + 'static,
		F: Fn(Arc<dyn StorageControl>) -> BoxFuture<'static, Remote<R>> + Send + Sync + 'static,
	{
		let (tx, rx) = oneshot::channel();
		Shared::start_call(&self.shared, Arc::new(Call::new(op, invoker, tx)));
		async move { rx.await.map_err(|_| RegistryError::StorageDisconnected) }
	}

	/// Drops the bound handle so the next call binds a fresh one.
	pub(crate) fn reset(&self) {
		let mut state = self.shared.state.lock();
		if let Some(handle) = state.handle.take() {
			handle.watcher.cancel();
			debug!(generation = handle.generation, "storage connection reset");
		}
	}

	pub(crate) fn is_recovering(&self) -> bool {
		self.shared.state.lock().phase == Phase::Recovering
	}

	pub(crate) fn inflight_count(&self) -> usize {
		self.shared.state.lock().inflight.len()
	}

	pub(crate) fn metrics(&self) -> ConnectionMetrics {
		self.shared.state.lock().metrics.clone()
	}
}

impl Shared {
	fn current_handle(self: &Arc<Self>, state: &mut ConnectionState) -> StorageHandle {
		match &state.handle {
			Some(handle) => handle.clone(),
			None => self.bind(state),
		}
	}

	/// Binds a new handle and starts watching it for disconnection.
	fn bind(self: &Arc<Self>, state: &mut ConnectionState) -> StorageHandle {
		if let Some(old) = state.handle.take() {
			old.watcher.cancel();
		}
		let generation = state.next_generation;
		state.next_generation += 1;

		let control = self.backend.connect();
		let watcher = CancellationToken::new();
		let handle = StorageHandle {
			control: Arc::clone(&control),
			generation,
			watcher: watcher.clone(),
		};
		state.handle = Some(handle.clone());
		debug!(generation, "storage connection bound");

		let shared = Arc::downgrade(self);
		tokio::spawn(async move {
			tokio::select! {
				_ = watcher.cancelled() => {}
				_ = control.closed() => {
					if let Some(shared) = shared.upgrade() {
						shared.on_disconnected(generation);
					}
				}
			}
		});
		handle
	}

	fn start_call(self: &Arc<Self>, call: Arc<dyn InflightCall>) {
		let mut state = self.state.lock();
		let id = CallId(state.next_call_id);
		state.next_call_id += 1;
		state.inflight.insert(id, Arc::clone(&call));
		match state.phase {
			Phase::Normal => {
				let handle = self.current_handle(&mut state);
				drop(state);
				debug!(call = %id, op = call.op(), generation = handle.generation, "storage call started");
				call.run(id, handle, Arc::downgrade(self));
			}
			Phase::Recovering => {
				debug!(call = %id, op = call.op(), "storage call queued during recovery");
			}
		}
	}

	/// Removes a call from the inflight set. Safe to call more than once.
	pub(crate) fn finish_call(&self, id: CallId) {
		if self.state.lock().inflight.remove(&id).is_some() {
			trace!(call = %id, "storage call finished");
		}
	}

	pub(crate) fn on_disconnected(self: &Arc<Self>, generation: u64) {
		let handle = {
			let mut state = self.state.lock();
			if state.handle.as_ref().is_none_or(|h| h.generation != generation) {
				trace!(generation, "stale disconnect ignored");
				return;
			}
			warn!(generation, inflight = state.inflight.len(), "storage connection lost");
			match state.phase {
				Phase::Recovering => {
					state.retries += 1;
					if state.retries > self.max_retries {
						error!(
							retries = state.retries,
							max_retries = self.max_retries,
							"storage recovery retry bound exceeded"
						);
						std::process::abort();
					}
				}
				Phase::Normal => state.phase = Phase::Recovering,
			}
			self.bind(&mut state)
		};

		let versions: Vec<LiveVersionInfo> = self.live.recoverable_versions().iter().map(|v| v.live_info()).collect();
		debug!(generation = handle.generation, versions = versions.len(), "storage recovery started");
		let shared = Arc::downgrade(self);
		tokio::spawn(async move {
			let reply = handle.control.recover(versions).await;
			let Some(shared) = shared.upgrade() else {
				return;
			};
			match reply {
				Ok(references) => shared.did_recover(handle, references),
				Err(Disconnected) => shared.on_disconnected(handle.generation),
			}
		});
	}

	fn did_recover(self: &Arc<Self>, handle: StorageHandle, references: Vec<LiveVersionRef>) {
		let calls: Vec<(CallId, Arc<dyn InflightCall>)> = {
			let mut state = self.state.lock();
			if state.phase != Phase::Recovering || state.handle.as_ref().is_none_or(|h| h.generation != handle.generation) {
				trace!(generation = handle.generation, "stale recovery reply ignored");
				return;
			}
			state.phase = Phase::Normal;
			let retries = std::mem::take(&mut state.retries);
			state.metrics.record_recovery(retries);
			info!(
				generation = handle.generation,
				retries,
				replayed = state.inflight.len(),
				"storage connection recovered"
			);
			state.inflight.iter().map(|(id, call)| (*id, Arc::clone(call))).collect()
		};

		self.live.reattach_references(references);
		for (id, call) in calls {
			debug!(call = %id, op = call.op(), "storage call replayed");
			call.run(id, handle.clone(), Arc::downgrade(self));
		}
	}
}

impl Drop for Shared {
	fn drop(&mut self) {
		if let Some(handle) = self.state.get_mut().handle.take() {
			handle.watcher.cancel();
		}
	}
}
