use std::time::Duration;

/// Ping interval once some connection is writable. Pings are about 60 bytes,
/// this keeps them near 1 kbps.
pub(crate) const WRITABLE_PING_DELAY: Duration = Duration::from_millis(480);

/// Ping interval while nothing is writable, about 10 kbps.
pub(crate) const UNWRITABLE_PING_DELAY: Duration = Duration::from_millis(50);

/// The best writable connection is pinged at least this often.
pub(crate) const MAX_CURRENT_WRITABLE_DELAY: Duration = Duration::from_millis(900);

/// A fresh allocator session is requested after this long without becoming
/// writable.
pub(crate) const ALLOCATE_PERIOD: Duration = Duration::from_secs(20);

/// Round trip improvement that justifies switching between connections of
/// equal preference.
pub(crate) const MIN_RTT_IMPROVEMENT: Duration = Duration::from_millis(10);

/// Collects the arguments to [`Transport`](super::Transport) construction
/// into a single structure.
#[derive(Default, Debug, Clone)]
pub struct TransportConfig {
    /// Defaults to 480ms.
    pub writable_ping_interval: Option<Duration>,
    /// Defaults to 50ms.
    pub unwritable_ping_interval: Option<Duration>,
    /// Defaults to 900ms.
    pub max_current_writable_delay: Option<Duration>,
    /// Defaults to 20 seconds.
    pub allocate_period: Option<Duration>,
}
