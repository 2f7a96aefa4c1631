use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use swreg_storage::{Disconnected, Remote, StorageControl};
use tokio::sync::oneshot;
use tracing::trace;

use super::{CallId, Shared, StorageHandle};

/// Type-erased view of an inflight call, so calls with different reply types
/// can share one inflight set and be replayed uniformly.
pub(crate) trait InflightCall: Send + Sync {
	fn op(&self) -> &'static str;

	/// Issues the call on `handle`. Runs again for every replay.
	fn run(self: Arc<Self>, id: CallId, handle: StorageHandle, shared: Weak<Shared>);
}

/// One storage request plus the slot its reply is delivered to.
pub(crate) struct Call<R, F> {
	op: &'static str,
	invoker: F,
	reply: Mutex<Option<oneshot::Sender<R>>>,
}

impl<R, F> Call<R, F> {
	pub(crate) fn new(op: &'static str, invoker: F, reply: oneshot::Sender<R>) -> Self {
		Self {
			op,
			invoker,
			reply: Mutex::new(Some(reply)),
		}
	}
}

impl<R, F> InflightCall for Call<R, F>
where
	R: Send + 'static,
	F: Fn(Arc<dyn StorageControl>) -> BoxFuture<'static, Remote<R>> + Send + Sync + 'static,
{
	fn op(&self) -> &'static str {
		self.op
	}

	fn run(self: Arc<Self>, id: CallId, handle: StorageHandle, shared: Weak<Shared>) {
		let reply = (self.invoker)(Arc::clone(&handle.control));
		tokio::spawn(async move {
			match reply.await {
				Ok(value) => {
					// Leave the inflight set before anyone sees the reply.
					if let Some(shared) = shared.upgrade() {
						shared.finish_call(id);
					}
					let Some(sender) = self.reply.lock().take() else {
						trace!(call = %id, op = self.op, "duplicate storage reply dropped");
						return;
					};
					if sender.send(value).is_err() {
						trace!(call = %id, op = self.op, "storage reply receiver gone");
					}
				}
				Err(Disconnected) => {
					trace!(call = %id, op = self.op, generation = handle.generation, "storage call interrupted");
					if let Some(shared) = shared.upgrade() {
						shared.on_disconnected(handle.generation);
					}
				}
			}
		});
	}
}
