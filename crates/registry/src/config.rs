use serde::Deserialize;

/// Registry tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
	/// Reconnect attempts tolerated while a single recovery is in progress.
	/// Exceeding this aborts the process.
	pub max_recovery_retries: u32,
	/// Report session-only origins to the backend via policy updates.
	pub track_storage_policy: bool,
}

/// Returns the default reconnect bound.
const fn default_max_recovery_retries() -> u32 {
	100
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			max_recovery_retries: default_max_recovery_retries(),
			track_storage_policy: true,
		}
	}
}
