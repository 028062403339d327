use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use bytes::{Buf, BufMut};

/// A device's hardware address. The MAC is the device's stable identity
///  across reboots; the collector keys its registry on it.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const WIRE_LEN: usize = 6;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MacAddr> {
        if buf.remaining() < Self::WIRE_LEN {
            return Err(anyhow!("buffer too short for a MAC address"));
        }
        let mut octets = [0u8; 6];
        buf.copy_to_slice(&mut octets);
        Ok(MacAddr(octets))
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}
impl Debug for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    /// accepts the usual `AA:BB:CC:DD:EE:FF` notation (case insensitive,
    ///  `-` works as a separator too)
    fn from_str(s: &str) -> Result<MacAddr, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow!("MAC address has fewer than 6 octets: {:?}", s))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| anyhow!("invalid MAC address octet {:?} in {:?}", part, s))?;
        }
        if parts.next().is_some() {
            return Err(anyhow!("MAC address has more than 6 octets: {:?}", s));
        }
        Ok(MacAddr(octets))
    }
}
