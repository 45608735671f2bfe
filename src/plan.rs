use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::config::DeliveryConfig;
use crate::device::{Device, TargetConfig};
use crate::error::WakeError;
use crate::mac::MacAddress;

pub const DEFAULT_PORT: u16 = 9;
pub const GLOBAL_BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;

pub fn validate_port(port: i64) -> Result<u16, WakeError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(WakeError::InvalidPort(port))
}

/// Destination of one magic packet datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastTarget {
    pub address: String,
    pub port: u16,
}

impl BroadcastTarget {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port }
    }

    pub fn global(port: u16) -> Self {
        Self::new(GLOBAL_BROADCAST.to_string(), port)
    }

    pub fn is_global(&self) -> bool {
        self.address.parse::<Ipv4Addr>().map_or(false, |ip| ip == GLOBAL_BROADCAST)
    }
}

impl fmt::Display for BroadcastTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub target: BroadcastTarget,
    pub attempts: u32,
}

impl PlanEntry {
    /// Every entry is tried at least once.
    pub fn new(target: BroadcastTarget, attempts: u32) -> Self {
        Self { target, attempts: attempts.max(1) }
    }
}

/// One wake call: built per request, consumed by the dispatcher, then dropped.
#[derive(Debug, Clone)]
pub struct WakeRequest {
    pub mac: MacAddress,
    pub plan: Vec<PlanEntry>,
    /// Port of the global broadcast fallback.
    pub port: u16,
    pub delay: Duration,
}

impl WakeRequest {
    pub fn new(mac: MacAddress, plan: Vec<PlanEntry>, port: u16, delay: Duration) -> Self {
        Self { mac, plan, port, delay }
    }

    /// Validates the device's MAC and port, then builds its delivery plan.
    /// Nothing touches the network before both checks pass.
    pub fn for_device(device: &Device, policy: &DeliveryConfig) -> Result<Self, WakeError> {
        let mac = MacAddress::normalize(&device.mac_address)?;
        let port = validate_port(device.port())?;

        let plan = match &device.targets {
            Some(targets) => explicit_plan(targets, port, policy)?,
            None => derived_plan(device, port, policy),
        };

        Ok(Self::new(mac, plan, port, policy.delay()))
    }

    /// Upper bound on the time spent pausing between attempts.
    pub fn max_pacing(&self) -> Duration {
        let attempts = self.plan.iter().fold(0u32, |acc, e| acc.saturating_add(e.attempts));
        self.delay.saturating_mul(attempts)
    }
}

/// The `/24` broadcast address of `ip`.
pub fn subnet_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// IPv4 broadcast addresses of the named interfaces that are up and not loopback.
pub fn interface_broadcasts(names: &[String]) -> Vec<Ipv4Addr> {
    pnet::datalink::interfaces()
        .into_iter()
        .filter(|iface| names.contains(&iface.name))
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .flat_map(|iface| {
            log::trace!("[plan] using interface '{}' ({} networks)", iface.name, iface.ips.len());
            iface.ips.into_iter()
        })
        .filter_map(|net| match net.broadcast() {
            IpAddr::V4(addr) if addr != net.ip() => Some(addr),
            _ => None,
        })
        .collect()
}

fn explicit_plan(targets: &[TargetConfig], port: u16, policy: &DeliveryConfig) -> Result<Vec<PlanEntry>, WakeError> {
    targets
        .iter()
        .enumerate()
        .map(|(i, t)| -> Result<PlanEntry, WakeError> {
            let port = t.port.map(validate_port).transpose()?.unwrap_or(port);
            let attempts = t.attempts.unwrap_or(if i == 0 {
                policy.primary_attempts
            } else {
                policy.fallback_attempts
            });
            Ok(PlanEntry::new(BroadcastTarget::new(t.address.clone(), port), attempts))
        })
        .collect()
}

fn derived_plan(device: &Device, port: u16, policy: &DeliveryConfig) -> Vec<PlanEntry> {
    let host = device.ip_address.as_deref().and_then(|ip| match ip.parse::<Ipv4Addr>() {
        Ok(ip) => Some(ip),
        Err(_) => {
            log::warn!("[plan][{}] ignoring non-IPv4 address '{}'", device.name, ip);
            None
        }
    });

    let mut plan = Vec::new();

    let primary = match host {
        Some(ip) => subnet_broadcast(ip).to_string(),
        None => device.broadcast_ip(),
    };
    push_unique(&mut plan, BroadcastTarget::new(primary, port), policy.primary_attempts);

    if let (true, Some(ip)) = (policy.unicast_fallback, host) {
        push_unique(&mut plan, BroadcastTarget::new(ip.to_string(), port), policy.fallback_attempts);
    }

    if !policy.interfaces.is_empty() {
        for addr in interface_broadcasts(&policy.interfaces) {
            push_unique(&mut plan, BroadcastTarget::new(addr.to_string(), port), policy.fallback_attempts);
        }
    }

    push_unique(&mut plan, BroadcastTarget::global(port), policy.fallback_attempts);
    plan
}

fn push_unique(plan: &mut Vec<PlanEntry>, target: BroadcastTarget, attempts: u32) {
    if plan.iter().any(|e| e.target == target) { return; }
    plan.push(PlanEntry::new(target, attempts));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(req: &WakeRequest) -> Vec<(String, u32)> {
        req.plan
            .iter()
            .map(|e| (e.target.to_string(), e.attempts))
            .collect()
    }

    #[test]
    fn port_bounds() {
        assert_eq!(validate_port(9), Ok(9));
        assert_eq!(validate_port(1), Ok(1));
        assert_eq!(validate_port(65535), Ok(65535));
        assert_eq!(validate_port(0), Err(WakeError::InvalidPort(0)));
        assert_eq!(validate_port(-7), Err(WakeError::InvalidPort(-7)));
        assert_eq!(validate_port(65536), Err(WakeError::InvalidPort(65536)));
    }

    #[test]
    fn derives_subnet_then_global_from_ip() {
        let mut dev = Device::new("desktop", "AA-BB-CC-DD-EE-FF");
        dev.ip_address = Some("10.7.123.9".to_string());

        let req = WakeRequest::for_device(&dev, &DeliveryConfig::default()).unwrap();
        assert_eq!(req.mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(req.port, 9);
        assert_eq!(req.delay, Duration::from_secs(1));
        assert_eq!(
            targets(&req),
            vec![("10.7.123.255:9".to_string(), 3), ("255.255.255.255:9".to_string(), 1)]
        );
    }

    #[test]
    fn falls_back_to_broadcast_ip_without_host() {
        let mut dev = Device::new("nas", "001122334455");
        dev.broadcast_ip = Some("192.168.1.255".to_string());
        dev.port = Some(7);

        let req = WakeRequest::for_device(&dev, &DeliveryConfig::default()).unwrap();
        assert_eq!(
            targets(&req),
            vec![("192.168.1.255:7".to_string(), 3), ("255.255.255.255:7".to_string(), 1)]
        );

        dev.ip_address = Some("fe80::1".to_string());
        let req = WakeRequest::for_device(&dev, &DeliveryConfig::default()).unwrap();
        assert_eq!(req.plan[0].target.address, "192.168.1.255");
    }

    #[test]
    fn global_primary_is_not_repeated() {
        let dev = Device::new("desktop", "AA-BB-CC-DD-EE-FF");
        let req = WakeRequest::for_device(&dev, &DeliveryConfig::default()).unwrap();
        assert_eq!(targets(&req), vec![("255.255.255.255:9".to_string(), 3)]);
    }

    #[test]
    fn unicast_fallback_precedes_global() {
        let mut dev = Device::new("desktop", "AA-BB-CC-DD-EE-FF");
        dev.ip_address = Some("192.168.86.39".to_string());
        let policy = DeliveryConfig { unicast_fallback: true, ..Default::default() };

        let req = WakeRequest::for_device(&dev, &policy).unwrap();
        assert_eq!(
            targets(&req),
            vec![
                ("192.168.86.255:9".to_string(), 3),
                ("192.168.86.39:9".to_string(), 1),
                ("255.255.255.255:9".to_string(), 1),
            ]
        );
    }

    #[test]
    fn explicit_targets_are_used_verbatim() {
        let mut dev = Device::new("desktop", "AA-BB-CC-DD-EE-FF");
        dev.ip_address = Some("10.7.123.9".to_string());
        dev.targets = Some(vec![
            TargetConfig { address: "10.0.0.255".to_string(), port: None, attempts: None },
            TargetConfig { address: "10.0.0.7".to_string(), port: Some(4000), attempts: Some(2) },
        ]);

        let req = WakeRequest::for_device(&dev, &DeliveryConfig::default()).unwrap();
        assert_eq!(
            targets(&req),
            vec![("10.0.0.255:9".to_string(), 3), ("10.0.0.7:4000".to_string(), 2)]
        );
    }

    #[test]
    fn validation_errors_reject_request() {
        let dev = Device::new("desktop", "AA-BB-CC-DD-EE");
        assert_eq!(
            WakeRequest::for_device(&dev, &DeliveryConfig::default()).unwrap_err(),
            WakeError::InvalidMacFormat("AA-BB-CC-DD-EE".to_string())
        );

        let mut dev = Device::new("desktop", "AA-BB-CC-DD-EE-FF");
        dev.port = Some(70000);
        assert_eq!(
            WakeRequest::for_device(&dev, &DeliveryConfig::default()).unwrap_err(),
            WakeError::InvalidPort(70000)
        );

        dev.port = None;
        dev.targets = Some(vec![TargetConfig { address: "10.0.0.255".to_string(), port: Some(0), attempts: None }]);
        assert_eq!(
            WakeRequest::for_device(&dev, &DeliveryConfig::default()).unwrap_err(),
            WakeError::InvalidPort(0)
        );
    }

    #[test]
    fn loopback_interface_adds_nothing() {
        let mut dev = Device::new("desktop", "AA-BB-CC-DD-EE-FF");
        dev.ip_address = Some("10.7.123.9".to_string());
        let policy = DeliveryConfig { interfaces: vec!["lo".into()], ..Default::default() };

        assert!(interface_broadcasts(&policy.interfaces).is_empty());
        let req = WakeRequest::for_device(&dev, &policy).unwrap();
        assert_eq!(
            targets(&req),
            vec![("10.7.123.255:9".to_string(), 3), ("255.255.255.255:9".to_string(), 1)]
        );
    }

    #[test]
    fn unknown_interface_adds_nothing() {
        let mut dev = Device::new("desktop", "AA-BB-CC-DD-EE-FF");
        dev.ip_address = Some("10.7.123.9".to_string());
        let policy = DeliveryConfig { interfaces: vec!["wolwake-missing0".into()], ..Default::default() };

        assert!(interface_broadcasts(&policy.interfaces).is_empty());
        let req = WakeRequest::for_device(&dev, &policy).unwrap();
        assert_eq!(req.plan.len(), 2);
        assert_eq!(req.plan[1].target, BroadcastTarget::global(9));
    }

    #[test]
    fn max_pacing_saturates() {
        let plan = vec![
            PlanEntry::new(BroadcastTarget::new("10.7.123.255", 9), u32::MAX),
            PlanEntry::new(BroadcastTarget::global(9), 1),
        ];
        let mac = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        let req = WakeRequest::new(mac, plan.clone(), 9, Duration::from_millis(u64::MAX));
        assert_eq!(req.max_pacing(), Duration::MAX);

        let req = WakeRequest::new(mac, plan[1..].to_vec(), 9, Duration::from_secs(1));
        assert_eq!(req.max_pacing(), Duration::from_secs(1));
    }

    #[test]
    fn recognises_global_target() {
        assert!(BroadcastTarget::global(9).is_global());
        assert!(!BroadcastTarget::new("10.7.123.255", 9).is_global());
        assert!(!BroadcastTarget::new("wol.example", 9).is_global());
        assert_eq!(PlanEntry::new(BroadcastTarget::global(9), 0).attempts, 1);
    }
}
