//! Broker key and channel layout for runs.

use uuid::Uuid;

/// Append-only list of event JSON for a run.
pub fn response_list_key(run_id: Uuid) -> String {
    format!("responses:{run_id}")
}

/// Notification channel: `"new"` after each append, control tokens on
/// terminal transitions.
pub fn new_event_channel(run_id: Uuid) -> String {
    format!("new_event:{run_id}")
}

/// Global control channel for stop signals.
pub fn control_channel(run_id: Uuid) -> String {
    format!("control:{run_id}")
}

/// Instance-scoped control channel; the owning worker subscribes to both.
pub fn instance_control_channel(run_id: Uuid, instance_id: &str) -> String {
    format!("control:{run_id}:{instance_id}")
}

/// Single-flight lock; value is the owning instance id.
pub fn run_lock_key(run_id: Uuid) -> String {
    format!("run_lock:{run_id}")
}

/// Coarse stop flag, polled by the worker alongside the pub/sub path.
pub fn stop_key(run_id: Uuid) -> String {
    format!("stop:{run_id}")
}

/// Worker-liveness marker for a run; refreshed while the run streams.
///
/// Two key families share the `active_run:` prefix: this one, scoped by
/// instance id, and the account-scoped one the scheduler counts for
/// per-account concurrency.
pub fn active_run_key_for_instance(instance_id: &str, run_id: Uuid) -> String {
    format!("active_run:{instance_id}:{run_id}")
}

/// Account-concurrency slot, written at enqueue time and released by the
/// worker on terminal transition.
pub fn active_run_key_for_account(account_id: &str, run_id: Uuid) -> String {
    format!("active_run:{account_id}:{run_id}")
}

/// Pattern matching one account's active-run slots.
pub fn active_run_pattern_for_account(account_id: &str) -> String {
    format!("active_run:{account_id}:*")
}

/// The durable work queue consumed by the worker pool.
pub const RUN_QUEUE_KEY: &str = "agent_run_queue";

/// Channel notified when the queue grows, so idle workers wake promptly.
pub const RUN_QUEUE_CHANNEL: &str = "agent_run_queue:new";

/// Cached MCP tool catalog for a config fingerprint.
pub fn mcp_schema_key(fingerprint: &str) -> String {
    format!("mcp_schema:{fingerprint}")
}
