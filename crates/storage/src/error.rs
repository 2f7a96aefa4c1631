/// Database-layer status for a reply that made it back over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum DatabaseError {
	/// The requested record does not exist.
	#[error("record not found")]
	NotFound,
	/// The backing store failed to read or write.
	#[error("storage i/o error")]
	IoError,
	/// The backing store detected inconsistent on-disk state.
	#[error("storage corrupted")]
	Corrupted,
	/// Unclassified database failure.
	#[error("storage operation failed")]
	Failed,
	/// The operation is not supported by this backend.
	#[error("operation not supported")]
	NotSupported,
	/// The backend has been disabled and refuses all work until wiped.
	#[error("storage disabled")]
	Disabled,
}

/// The transport dropped before a reply arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("storage connection lost")]
pub struct Disconnected;
