use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

use crate::device::Device;

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/wol-wake/config.yml";

/// Deserializes an absent field as None and an unset field as T::default.
///
/// This avoid having Option<Option<T>> as in serde_with::rust::double_option
pub fn deserialize_absent_or_null<'de, D, T: Default>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.or(Some(T::default())))
}


/// How a delivery plan is derived and paced.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub primary_attempts: u32,
    pub fallback_attempts: u32,
    pub delay_ms: u64,
    /// Also send straight to the device's own IP before the global broadcast.
    pub unicast_fallback: bool,
    /// Local interfaces whose IPv4 broadcast addresses join every derived plan.
    pub interfaces: Vec<String>,
}

impl DeliveryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            primary_attempts: 3,
            fallback_attempts: 1,
            delay_ms: 1000,
            unicast_fallback: false,
            interfaces: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    pub cooldown_secs: u64,
}

impl RelayConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            listen_port: 9,
            cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default, deserialize_with = "deserialize_absent_or_null")]
    pub relay: Option<RelayConfig>,
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yml::from_str(content).context("invalid configuration")
    }

    /// Loads the config at `path`, or at [`DEFAULT_CONFIG_PATH`] when none is given.
    /// A missing default file yields an empty config; a missing explicit one is an error.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let raw = path.unwrap_or(DEFAULT_CONFIG_PATH);
        let expanded = shellexpand::full(raw)
            .with_context(|| format!("cannot expand config path '{}'", raw))?;
        let file = Path::new(expanded.as_ref());

        if path.is_none() && !file.exists() {
            log::debug!("[config] no config at '{}', using defaults", file.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(file)
            .with_context(|| format!("cannot read config '{}'", file.display()))?;
        log::debug!("[config] loaded '{}'", file.display());
        Self::from_yaml(&content).with_context(|| format!("in '{}'", file.display()))
    }
}
