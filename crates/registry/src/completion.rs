//! Single-shot replies for registry operations.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::task::JoinHandle;

use crate::{RegistryError, Result};

/// The eventual reply to one registry operation.
///
/// The synchronous part of an operation (validation, the disabled check and any
/// mark-first state change) has already happened by the time a `Completion` is
/// returned. The rest runs on a spawned task, so dropping the `Completion` only
/// discards the reply: the registry's own bookkeeping for the operation still
/// runs to the end.
#[must_use = "a Completion carries the operation's status"]
pub struct Completion<T> {
	state: State<T>,
}

enum State<T> {
	Ready(Option<Result<T>>),
	Spawned(JoinHandle<Result<T>>),
}

impl<T> Unpin for Completion<T> {}

impl<T: Send + 'static> Completion<T> {
	pub(crate) fn ready(result: Result<T>) -> Self {
		Self {
			state: State::Ready(Some(result)),
		}
	}

	pub(crate) fn spawn<F>(work: F) -> Self
	where
		F: Future<Output = Result<T>> + Send + 'static,
	{
		Self {
			state: State::Spawned(tokio::spawn(work)),
		}
	}

	/// True if the reply was decided synchronously, without any storage round-trip.
	pub fn is_immediate(&self) -> bool {
		matches!(self.state, State::Ready(_))
	}
}

impl<T> Future for Completion<T> {
	type Output = Result<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match &mut self.get_mut().state {
			State::Ready(result) => Poll::Ready(result.take().expect("Completion polled after completion")),
			State::Spawned(handle) => match ready!(Pin::new(handle).poll(cx)) {
				Ok(result) => Poll::Ready(result),
				Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
				// Runtime shutting down.
				Err(_) => Poll::Ready(Err(RegistryError::Abort)),
			},
		}
	}
}
