use std::str::FromStr;

use serde::Deserialize;

use crate::error::WakeError;
use crate::mac::MacAddress;
use crate::plan::{DEFAULT_PORT, GLOBAL_BROADCAST};

/// One entry of an explicit delivery plan.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub address: String,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub attempts: Option<u32>,
}

/// Parses `address` or `address:port`. IPv6 literals are rejected, the
/// transport only speaks IPv4.
impl FromStr for TargetConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('[') || s.matches(':').count() > 1 {
            return Err(format!("IPv6 target '{}' is not supported", s));
        }

        let (address, port) = match s.rsplit_once(':') {
            Some((address, port)) => {
                let port = port.parse().map_err(|_| format!("invalid port in target '{}'", s))?;
                (address, Some(port))
            },
            None => (s, None),
        };
        if address.is_empty() {
            return Err(format!("missing address in target '{}'", s));
        }
        Ok(Self { address: address.to_string(), port, attempts: None })
    }
}

/// A registered machine. Only `mac_address` and `port` are validated, and
/// only when a wake request is built from it.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub name: String,
    pub mac_address: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub broadcast_ip: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
    /// Replaces the derived plan when set.
    #[serde(default)]
    pub targets: Option<Vec<TargetConfig>>,
}

impl Device {
    pub fn new(name: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mac_address: mac_address.into(),
            ip_address: None,
            broadcast_ip: None,
            port: None,
            targets: None,
        }
    }

    pub fn broadcast_ip(&self) -> String {
        self.broadcast_ip
            .clone()
            .unwrap_or_else(|| GLOBAL_BROADCAST.to_string())
    }

    pub fn port(&self) -> i64 {
        self.port.unwrap_or(DEFAULT_PORT as i64)
    }
}

pub struct Registry {
    devices: Vec<Device>,
}

impl Registry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Result<&Device, WakeError> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| WakeError::UnknownDevice(name.to_string()))
    }

    /// Devices with an unparsable MAC never match.
    pub fn find_by_mac(&self, mac: &MacAddress) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| MacAddress::normalize(&d.mac_address).ok().as_ref() == Some(mac))
    }

    /// Registered device for a raw MAC string, in any accepted format.
    pub fn find_by_raw_mac(&self, raw: &str) -> Result<&Device, WakeError> {
        let mac = MacAddress::normalize(raw)?;
        self.find_by_mac(&mac)
            .ok_or_else(|| WakeError::UnknownDevice(mac.to_string()))
    }

    /// Registered record for `raw`, or a bare device with default
    /// delivery settings when nothing matches.
    pub fn device_for_mac(&self, raw: &str) -> Result<Device, WakeError> {
        match self.find_by_raw_mac(raw) {
            Ok(device) => Ok(device.clone()),
            Err(WakeError::UnknownDevice(mac)) => Ok(Device::new(mac, raw)),
            Err(e) => Err(e),
        }
    }
}
