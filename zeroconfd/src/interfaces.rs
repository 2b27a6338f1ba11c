use std::io;
use std::net::IpAddr;
use if_addrs::IfAddr;
use shared::protocol::ALL_INTERFACES;

/// One address configured on a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub index: u32,
    pub address: IpAddr,
    pub netmask: IpAddr,
}

impl LocalInterface {
    /// Whether `address` lies in this interface's subnet.
    pub fn contains(&self, address: &IpAddr) -> bool {
        match (self.address, self.netmask, address) {
            (IpAddr::V4(ip), IpAddr::V4(mask), IpAddr::V4(other)) => {
                let mask = u32::from(mask);
                u32::from(ip) & mask == u32::from(*other) & mask
            }
            (IpAddr::V6(ip), IpAddr::V6(mask), IpAddr::V6(other)) => {
                let mask = u128::from(mask);
                u128::from(ip) & mask == u128::from(*other) & mask
            }
            _ => false,
        }
    }
}

pub trait InterfaceSource {
    fn interfaces(&self) -> io::Result<Vec<LocalInterface>>;
}

/// The host's interfaces, via `getifaddrs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<LocalInterface>> {
        let ifaces = if_addrs::get_if_addrs()?;
        Ok(ifaces
            .into_iter()
            .filter_map(|iface| {
                let index = iface.index?;
                let (address, netmask) = match &iface.addr {
                    IfAddr::V4(v4) => (IpAddr::V4(v4.ip), IpAddr::V4(v4.netmask)),
                    IfAddr::V6(v6) => (IpAddr::V6(v6.ip), IpAddr::V6(v6.netmask)),
                };
                Some(LocalInterface {
                    name: iface.name,
                    index,
                    address,
                    netmask,
                })
            })
            .collect())
    }
}

/// Pick the interface whose subnet holds `bind_address`. The wildcard address,
/// an unmatched address, or an unreadable interface list all select every
/// interface.
pub fn interface_for(source: &dyn InterfaceSource, bind_address: &IpAddr) -> u32 {
    if bind_address.is_unspecified() {
        return ALL_INTERFACES;
    }

    let interfaces = match source.interfaces() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!("Could not enumerate interfaces: {}", e);
            return ALL_INTERFACES;
        }
    };

    match interfaces.iter().find(|iface| iface.contains(bind_address)) {
        Some(iface) => {
            tracing::debug!("{} is on interface {} ({})", bind_address, iface.name, iface.index);
            iface.index
        }
        None => {
            tracing::debug!("No interface subnet holds {}, using all interfaces", bind_address);
            ALL_INTERFACES
        }
    }
}

#[cfg(test)]
pub(crate) struct StaticInterfaces(pub Vec<LocalInterface>);

#[cfg(test)]
impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self) -> io::Result<Vec<LocalInterface>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
pub(crate) fn lan_interfaces() -> StaticInterfaces {
    StaticInterfaces(vec![
        LocalInterface {
            name: "lo".to_string(),
            index: 1,
            address: "127.0.0.1".parse().unwrap(),
            netmask: "255.0.0.0".parse().unwrap(),
        },
        LocalInterface {
            name: "eth0".to_string(),
            index: 2,
            address: "192.168.1.10".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        },
        LocalInterface {
            name: "wlan0".to_string(),
            index: 3,
            address: "10.0.0.7".parse().unwrap(),
            netmask: "255.255.0.0".parse().unwrap(),
        },
    ])
}
