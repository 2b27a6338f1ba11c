use std::fmt;
use std::net::IpAddr;
use serde::{Serialize, Deserialize};

/// A discovered service instance, resolved down to a single address.
/// This is the canonical data model used by the browser, the API, and consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Instance name, e.g. "myserver"
    pub name: String,

    /// Service type without the trailing dot, e.g. "_http._tcp"
    pub service_type: String,

    /// Domain without the trailing dot, e.g. "local"
    pub domain: String,

    /// Hostname as reported by the resolver, e.g. "myserver.local."
    pub hostname: String,

    /// Resolved address
    pub address: IpAddr,

    /// Service port, host byte order
    pub port: u16,

    /// Address family of `address`
    pub family: AddressFamily,

    /// TXT tokens in record order, each either "key=value" or a bare "key"
    pub txt: Vec<String>,

    /// Reserved flags
    #[serde(default)]
    pub flags: EntryFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

/// Currently always false. Kept on the wire so link-local and cache
/// semantics can be reported later without a format change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlags {
    pub ipv6: bool,
    pub link_local: bool,
    pub cached: bool,
    pub wide_area: bool,
    pub loopback: bool,
}

/// How discovered instances collapse into table entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupMode {
    /// `name.type@ifindex`: the same instance seen on two interfaces is two entries
    #[default]
    Interface,
    /// Instance name only. Deprecated: merges instances across interfaces.
    Name,
}

/// Identity of a table entry. Derived from the instance, never stored on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(mode: DedupMode, name: &str, service_type: &str, interface_index: u32) -> Self {
        match mode {
            DedupMode::Interface => {
                DedupKey(format!("{}.{}@{}", name, service_type, interface_index))
            }
            DedupMode::Name => DedupKey(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A port as it crosses the engine boundary: big-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkPort([u8; 2]);

impl NetworkPort {
    pub fn from_host(port: u16) -> Self {
        NetworkPort(port.to_be_bytes())
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        NetworkPort(bytes)
    }

    pub fn to_host(self) -> u16 {
        u16::from_be_bytes(self.0)
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0
    }
}

/// Strip one trailing DNS label separator: "_http._tcp." -> "_http._tcp"
pub fn trim_trailing_dot(value: &str) -> &str {
    value.strip_suffix('.').unwrap_or(value)
}
