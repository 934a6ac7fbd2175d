use std::net::SocketAddr;

use super::*;
use crate::port::ProtocolAddress;
use crate::socket::ProxyInfo;

/// A relay server: the addresses it can be reached at and how much less its
/// candidates are preferred than the primary one's.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayServerConfig {
    pub addresses: Vec<ProtocolAddress>,
    /// [`RELAY_PRIMARY_PREF_MODIFIER`] or [`RELAY_BACKUP_PREF_MODIFIER`].
    pub pref_modifier: f32,
}

/// Collects the arguments to [`BasicPortAllocator`] construction into a
/// single structure.
#[derive(Default, Debug, Clone)]
pub struct AllocatorConfig {
    pub disable_udp: bool,
    pub disable_stun: bool,
    pub disable_tcp: bool,
    pub disable_relay: bool,

    /// Periodically destroys every connection of ready ports, to exercise
    /// recovery.
    pub enable_shaker: bool,

    /// Outbound proxy for TCP based ports.
    pub proxy: ProxyInfo,
    /// User agent presented to HTTPS proxies.
    pub user_agent: String,

    pub stun_server: Option<SocketAddr>,

    pub relay_servers: Vec<RelayServerConfig>,
    /// Shared relay credentials. Random ones are generated per session when
    /// empty.
    pub relay_username: String,
    pub relay_password: String,
    /// Defaults to the standard relay magic cookie when empty.
    pub magic_cookie: Vec<u8>,
}
