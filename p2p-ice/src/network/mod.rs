use std::fmt;
use std::net::IpAddr;

/// Network is one local interface address, as reported by the network
/// enumeration that runs outside the event loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Network {
    name: String,
    ip: IpAddr,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Net[{}:{}]", self.name, self.ip)
    }
}

impl Network {
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}
