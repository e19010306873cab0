use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::VirshboxError;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The locally administered OUI libvirt reserves for QEMU guests.
pub const QEMU_MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// The tail handed out by the previous [`MacAddress::generate`]; `u32::MAX` before the first.
static LAST_TAIL: AtomicU32 = AtomicU32::new(u32::MAX);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MacAddress {
    /// Generates a random address under [`QEMU_MAC_PREFIX`]. Two successive calls never
    /// return the same address.
    pub fn generate() -> Self {
        let tail = loop {
            let tail = rand::random::<u32>() & 0x00ff_ffff;
            if LAST_TAIL.swap(tail, Ordering::Relaxed) != tail {
                break tail;
            }
        };

        let [_, a, b, c] = tail.to_be_bytes();
        Self([
            QEMU_MAC_PREFIX[0],
            QEMU_MAC_PREFIX[1],
            QEMU_MAC_PREFIX[2],
            a,
            b,
            c,
        ])
    }

    /// The raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether the address carries the QEMU prefix.
    pub fn is_qemu(&self) -> bool {
        self.0[..3] == QEMU_MAC_PREFIX
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Accepts colon or hyphen separated octets of one or two hex digits, as printed by `arp`.
impl FromStr for MacAddress {
    type Err = VirshboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VirshboxError::InvalidArgument(format!("invalid mac address: {s:?}"));

        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = VirshboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
