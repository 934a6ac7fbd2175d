use std::net::SocketAddr;

use super::allocator_config::AllocatorConfig;
use crate::candidate::ProtocolType;
use crate::port::ProtocolAddress;
use crate::rand::{generate_pwd, generate_ufrag};
use stun::data::DEFAULT_MAGIC_COOKIE;

/// A relay server of a [`PortConfiguration`].
#[derive(Debug, Clone, PartialEq)]
pub struct RelayServer {
    pub ports: Vec<ProtocolAddress>,
    pub pref_modifier: f32,
}

impl RelayServer {
    /// Whether the server can be reached with `protocol`.
    pub fn supports_protocol(&self, protocol: ProtocolType) -> bool {
        self.ports.iter().any(|port| port.protocol == protocol)
    }
}

/// PortConfiguration is the server setup one allocator session creates its
/// ports with.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfiguration {
    pub stun_address: Option<SocketAddr>,
    pub username: String,
    pub password: String,
    pub magic_cookie: Vec<u8>,
    pub relays: Vec<RelayServer>,
}

impl PortConfiguration {
    pub fn new(
        stun_address: Option<SocketAddr>,
        username: String,
        password: String,
        magic_cookie: Vec<u8>,
    ) -> Self {
        Self {
            stun_address,
            username,
            password,
            magic_cookie,
            relays: vec![],
        }
    }

    /// Snapshot of the allocator's server setup, filling in relay
    /// credentials and cookie where none are configured.
    pub(crate) fn from_config(config: &AllocatorConfig) -> Self {
        let username = if config.relay_username.is_empty() {
            generate_ufrag()
        } else {
            config.relay_username.clone()
        };
        let password = if config.relay_password.is_empty() {
            generate_pwd()
        } else {
            config.relay_password.clone()
        };
        let magic_cookie = if config.magic_cookie.is_empty() {
            DEFAULT_MAGIC_COOKIE.to_vec()
        } else {
            config.magic_cookie.clone()
        };

        let mut port_config =
            PortConfiguration::new(config.stun_server, username, password, magic_cookie);
        for relay in &config.relay_servers {
            port_config.add_relay(relay.addresses.clone(), relay.pref_modifier);
        }
        port_config
    }

    pub fn add_relay(&mut self, ports: Vec<ProtocolAddress>, pref_modifier: f32) {
        self.relays.push(RelayServer {
            ports,
            pref_modifier,
        });
    }

    /// Whether any relay server can be reached with `protocol`.
    pub fn supports_protocol(&self, protocol: ProtocolType) -> bool {
        self.relays
            .iter()
            .any(|relay| relay.supports_protocol(protocol))
    }
}
