use std::time::Duration;

/// Field manager name used on every server-side apply / patch this operator issues.
pub const MANAGER_NAME: &str = "vault-operator";

/// Default interval for requeuing a managed resource absent any other trigger.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Health monitor tick interval (§4.7).
pub const MONITOR_TICK: Duration = Duration::from_secs(10);

/// Bounded retry for the etcd cluster readiness wait and similar blocking polls (§5).
pub const BOUNDED_RETRY_ATTEMPTS: u32 = 10;
pub const BOUNDED_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Leader election timing (§4.8).
pub const LEASE_TTL: Duration = Duration::from_secs(15);
pub const LEASE_RENEW_EVERY: Duration = Duration::from_secs(10);
pub const LEASE_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Annotation recording the sha-independent spec generation a created object was stamped from.
pub const ANNOTATION_CREATED_BY: &str = "vault.security.coreos.com/created-by";
