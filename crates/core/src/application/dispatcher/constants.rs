// Dispatcher constants (no magic values)
use std::time::Duration;

/// How long in-flight handlers may run after shutdown is signaled (30s)
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Locks older than this are abandoned and claimable again (15 minutes)
pub const DEFAULT_STALE_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Period of the background stale-lock sweep (60s)
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Error recorded when a claimed job's type has no handler
pub const MISSING_HANDLER_ERROR: &str = "no handler registered for job type";

/// Release reason when the budget governor refuses execution
pub const BUDGET_DENIAL_REASON: &str = "budget";

/// Release reason when the concurrency gate is full
pub const GATE_DENIAL_REASON: &str = "gate_full";
