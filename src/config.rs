/// Tunables for a [`Connection`](crate::connection::Connection).
///
/// Every field has a literal default drawn from the wire/timing budget this
/// transport was designed around; unlike `socket_flow`'s `WebSocketConfig`
/// (which leaves frame/message caps as `Option<usize>` resolved with
/// `unwrap_or_default()` at each call site) these are concrete, since every
/// field here is read on every send-loop tick rather than only at the
/// handshake boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Number of distinct priority levels (1..=16).
    pub priority_levels: u8,
    /// Single-packet MTU in bytes, used to round the byte budget.
    pub single_packet_mtu: usize,
    /// Maximum number of concurrently in-flight outgoing messages (1..=16).
    pub max_concurrent_messages: u8,
    /// Target responsiveness in milliseconds: how often the byte budget resets.
    pub target_responsiveness_ms: u64,
    /// Ring size of the bandwidth moving-average estimators.
    pub bandwidth_estimator_samples: usize,
    /// Steady-state ping interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Ping interval used during the first few pings after connecting.
    pub initial_ping_interval_ms: u64,
    /// Number of consecutive missed pongs before the connection is force-closed.
    pub missed_ping_count: u32,
    /// Percentage (0-100) of the estimated outbound throughput we are willing to use.
    pub max_percent_throughput: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            priority_levels: 16,
            single_packet_mtu: 1398,
            max_concurrent_messages: 16,
            target_responsiveness_ms: 100,
            bandwidth_estimator_samples: 100,
            ping_interval_ms: 15_000,
            initial_ping_interval_ms: 5_000,
            missed_ping_count: 4,
            max_percent_throughput: 75,
        }
    }
}

impl TransportConfig {
    /// Clamps user-supplied values into the ranges the wire protocol and
    /// component contracts require (message numbers are a 4-bit field, so
    /// concurrency caps above 16 are meaningless).
    pub fn normalized(mut self) -> Self {
        self.priority_levels = self.priority_levels.clamp(1, 16);
        self.max_concurrent_messages = self.max_concurrent_messages.clamp(1, 16);
        self.max_percent_throughput = self.max_percent_throughput.min(100);
        self
    }
}
