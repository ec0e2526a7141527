//! Cluster Configuration
//!
//! Typed configuration for the gateway and worker tiers with the reference
//! constants as defaults.

use std::time::Duration;

/// Gateway-side configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Fixed timeout enforced on every proxied RPC.
    pub rpc_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
            outbound_queue_capacity: 1024,
        }
    }
}

/// Worker-side configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Capacity of the single outbound queue; a full queue makes producers
    /// wait rather than drop messages.
    pub outbound_queue_capacity: usize,
    /// Safety timeout on locally pending RPCs, covering gateway loss.
    pub rpc_timeout: Duration,
    /// Wait before the first reconnection attempt.
    pub reconnect_backoff: Duration,
    /// Upper bound for the doubling reconnection backoff.
    pub reconnect_max_backoff: Duration,
    /// How long to wait for a registration/subscription acknowledgement.
    pub registration_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 1024,
            rpc_timeout: Duration::from_secs(30),
            reconnect_backoff: Duration::from_millis(200),
            reconnect_max_backoff: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(10),
        }
    }
}
