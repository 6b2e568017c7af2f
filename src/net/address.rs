//! IPv4 addresses as the 32-bit host-byte-order integers the wire protocol carries.

use std::fmt;
use std::net::Ipv4Addr;

/// An IPv4 address in host byte order, the representation used on the wire and as
/// the registry key. Ordering of octets matches [`Ipv4Addr::from`]'s big-endian
/// `u32` convention inverted so that `to_dotted_quad` round-trips through
/// [`Ipv4Addr`] without surprises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u32);

impl Address {
    pub fn from_ipv4(ip: Ipv4Addr) -> Self {
        Self(u32::from_be_bytes(ip.octets()))
    }

    pub fn to_ipv4(self) -> Ipv4Addr {
        Ipv4Addr::from(self.0.to_be_bytes())
    }

    pub fn to_dotted_quad(self) -> String {
        self.to_ipv4().to_string()
    }

    pub const LOCALHOST: Address = Address(0x7f00_0001); // 127.0.0.1
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_dotted_quad())
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self::from_ipv4(ip)
    }
}

impl From<Address> for Ipv4Addr {
    fn from(addr: Address) -> Self {
        addr.to_ipv4()
    }
}
