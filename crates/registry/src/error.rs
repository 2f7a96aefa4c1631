use swreg_storage::DatabaseError;

/// A convenient type alias for `Result` with `E` = [`RegistryError`].
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Failure status surfaced to registry callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
	/// No registration (or user data entry) matched the request.
	#[error("not found")]
	NotFound,
	/// Storage is disabled; the request never reached the backend.
	#[error("storage disabled")]
	Abort,
	/// The connection went away for good before the request could complete.
	#[error("storage disconnected")]
	StorageDisconnected,
	/// Database-layer or validation failure.
	#[error("storage operation failed")]
	Failed,
}

impl From<DatabaseError> for RegistryError {
	fn from(err: DatabaseError) -> Self {
		match err {
			DatabaseError::NotFound => Self::NotFound,
			DatabaseError::Disabled => Self::Abort,
			DatabaseError::IoError | DatabaseError::Corrupted | DatabaseError::Failed | DatabaseError::NotSupported => Self::Failed,
		}
	}
}
