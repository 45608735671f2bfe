use std::fmt;
use std::str::FromStr;

use crate::error::WakeError;

/// Hardware address of a wake target, always exactly 6 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Parses a loosely formatted address. `-` and `:` separators are
    /// dropped and case is ignored; the rest must be exactly 12 hex digits.
    pub fn normalize(raw: &str) -> Result<Self, WakeError> {
        let hex: String = raw
            .chars()
            .filter(|c| !matches!(c, '-' | ':'))
            .map(|c| c.to_ascii_lowercase())
            .collect();

        if hex.len() != 12 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(WakeError::InvalidMacFormat(raw.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| WakeError::InvalidMacFormat(raw.to_string()))?;
        }

        Ok(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = WakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
