#[cfg(test)]
mod candidate_test;

use serde::{Deserialize, Serialize};
use shared::TransportProtocol;
use shared::error::*;
use shared::util::is_base64;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use url::form_urlencoded;

use crate::rand::LEN_CREDENTIAL;

/// Transport protocol of a candidate.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    #[default]
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "ssltcp")]
    SslTcp,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ProtocolType::Udp => "udp",
            ProtocolType::Tcp => "tcp",
            ProtocolType::SslTcp => "ssltcp",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ProtocolType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "udp" => Ok(ProtocolType::Udp),
            "tcp" => Ok(ProtocolType::Tcp),
            "ssltcp" => Ok(ProtocolType::SslTcp),
            _ => Err(Error::ErrUnknownProtocolType),
        }
    }
}

impl ProtocolType {
    /// Socket level protocol carrying this candidate protocol.
    pub fn transport_protocol(&self) -> TransportProtocol {
        match *self {
            ProtocolType::Udp => TransportProtocol::UDP,
            ProtocolType::Tcp | ProtocolType::SslTcp => TransportProtocol::TCP,
        }
    }
}

/// Mechanism that produced a candidate.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Address of a local socket.
    #[default]
    #[serde(rename = "local")]
    Local,
    /// Public address learned from a STUN server.
    #[serde(rename = "stun")]
    Stun,
    /// Address allocated on a relay server.
    #[serde(rename = "relay")]
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Local => "local",
            CandidateType::Stun => "stun",
            CandidateType::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(CandidateType::Local),
            "stun" => Ok(CandidateType::Stun),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(Error::ErrUnknownCandidateType),
        }
    }
}

/// Fields of a [`Candidate`].
#[derive(Debug, Clone)]
pub struct CandidateConfig {
    pub name: String,
    pub candidate_type: CandidateType,
    pub protocol: ProtocolType,
    pub address: SocketAddr,
    pub preference: f32,
    pub username: String,
    pub password: String,
    pub network_name: String,
    pub generation: u32,
}

/// Candidate is an advertised transport address plus the metadata a peer
/// needs to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) candidate_type: CandidateType,
    pub(crate) protocol: ProtocolType,
    pub(crate) address: SocketAddr,
    pub(crate) preference: f32,
    pub(crate) username: String,
    pub(crate) password: String,
    #[serde(rename = "network")]
    pub(crate) network_name: String,
    pub(crate) generation: u32,
}

impl From<CandidateConfig> for Candidate {
    fn from(config: CandidateConfig) -> Self {
        Candidate {
            name: config.name,
            candidate_type: config.candidate_type,
            protocol: config.protocol,
            address: config.address,
            preference: config.preference,
            username: config.username,
            password: config.password,
            network_name: config.network_name,
            generation: config.generation,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cand[{}:{}:{}:{}:{}:{}:{}]",
            self.name,
            self.candidate_type,
            self.protocol,
            self.address,
            self.preference,
            self.username,
            self.generation
        )
    }
}

impl Candidate {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn preference(&self) -> f32 {
        self.preference
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Copy of this candidate reached at another address.
    pub(crate) fn with_address(&self, address: SocketAddr) -> Candidate {
        Candidate {
            address,
            ..self.clone()
        }
    }

    /// Determines whether two candidates describe the same endpoint; the
    /// network name is informational only and not compared.
    pub fn is_equivalent(&self, other: &Candidate) -> bool {
        self.name == other.name
            && self.candidate_type == other.candidate_type
            && self.protocol == other.protocol
            && self.address == other.address
            && self.preference == other.preference
            && self.username == other.username
            && self.password == other.password
            && self.generation == other.generation
    }

    /// Checks a candidate received from a peer before it is used.
    pub fn validate_remote(&self) -> Result<()> {
        let ip = self.address.ip();
        if ip.is_unspecified() {
            return Err(Error::ErrCandidateUnspecifiedAddress);
        }
        if ip.is_loopback() {
            return Err(Error::ErrCandidateLocalAddress);
        }

        let port = self.address.port();
        if port < 1024 && ((port != 80 && port != 443) || is_private_ip(&ip)) {
            return Err(Error::ErrCandidateRestrictedPort);
        }

        if self.username.len() > LEN_CREDENTIAL {
            return Err(Error::ErrCandidateUsernameTooLong);
        }
        if !is_base64(&self.username) {
            return Err(Error::ErrCandidateUsernameInvalid);
        }

        Ok(())
    }

    /// marshal returns the external form-encoded attribute list of the candidate.
    pub fn marshal(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("name", &self.name)
            .append_pair("address", &self.address.ip().to_string())
            .append_pair("port", &self.address.port().to_string())
            .append_pair("protocol", &self.protocol.to_string())
            .append_pair("type", &self.candidate_type.to_string())
            .append_pair("preference", &self.preference.to_string())
            .append_pair("username", &self.username)
            .append_pair("password", &self.password)
            .append_pair("network", &self.network_name)
            .append_pair("generation", &self.generation.to_string())
            .finish()
    }
}

/// unmarshal_candidate parses the form produced by [`Candidate::marshal`].
///
/// `password`, `type` and `network` are optional; unknown keys are ignored.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let attrs: HashMap<String, String> = form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect();
    let required = |key: &str| required_attr(&attrs, key);

    let ip: IpAddr = required("address")?.parse()?;
    let port: u16 = required("port")?.parse()?;
    let candidate_type = match attrs.get("type") {
        Some(t) => t.parse()?,
        None => CandidateType::default(),
    };

    Ok(Candidate {
        name: required("name")?.clone(),
        candidate_type,
        protocol: required("protocol")?.parse()?,
        address: SocketAddr::new(ip, port),
        preference: required("preference")?.parse()?,
        username: required("username")?.clone(),
        password: attrs.get("password").cloned().unwrap_or_default(),
        network_name: attrs.get("network").cloned().unwrap_or_default(),
        generation: required("generation")?.parse()?,
    })
}

fn required_attr<'a>(attrs: &'a HashMap<String, String>, key: &str) -> Result<&'a String> {
    attrs
        .get(key)
        .ok_or_else(|| Error::ErrCandidateMissingAttribute(key.to_owned()))
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_private(),
        IpAddr::V6(ip) => (ip.segments()[0] & 0xfe00) == 0xfc00,
    }
}
