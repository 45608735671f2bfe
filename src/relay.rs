use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::{DeliveryConfig, RelayConfig};
use crate::device::Registry;
use crate::dispatch::Dispatcher;
use crate::mac::MacAddress;
use crate::packet;
use crate::plan::WakeRequest;

/// Remembers recently relayed targets so duplicates (including our own
/// broadcasts looping back) are dropped.
pub struct Cooldown {
    period: Duration,
    seen: HashMap<MacAddress, Instant>,
}

impl Cooldown {
    pub fn new(period: Duration) -> Self {
        Self { period, seen: HashMap::new() }
    }

    /// Returns false if `mac` was admitted less than one period before `now`.
    pub fn admit(&mut self, mac: MacAddress, now: Instant) -> bool {
        let period = self.period;
        self.seen.retain(|_, t| now.saturating_duration_since(*t) < period);

        if self.seen.contains_key(&mac) {
            return false;
        }
        self.seen.insert(mac, now);
        true
    }
}

/// Paces retries after failed receives and gives up once they keep failing.
#[derive(Debug, Default)]
pub struct RecvBackoff {
    failures: u32,
}

impl RecvBackoff {
    pub const MAX_FAILURES: u32 = 10;
    const STEP: Duration = Duration::from_millis(100);

    pub fn new() -> Self {
        Self { failures: 0 }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay before the next receive, or None after too many failures in a row.
    pub fn failed(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= Self::MAX_FAILURES {
            return None;
        }
        Some(Self::STEP * self.failures)
    }
}

pub async fn l4_worker(
    cfg: RelayConfig,
    registry: Arc<Registry>,
    policy: Arc<DeliveryConfig>,
    token: CancellationToken,
) -> Result<()> {
    let socket = UdpSocket::bind((cfg.listen_addr, cfg.listen_port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", cfg.listen_addr, cfg.listen_port))?;
    log::info!("[relay] listening on {}", socket.local_addr()?);

    relay_loop(socket, Cooldown::new(cfg.cooldown()), registry, policy, token).await
}

async fn relay_loop(
    socket: UdpSocket,
    mut cooldown: Cooldown,
    registry: Arc<Registry>,
    policy: Arc<DeliveryConfig>,
    token: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; 1500];
    let mut backoff = RecvBackoff::new();

    loop {
        let res = tokio::select! {
            _ = token.cancelled() => { log::trace!("[relay] exit"); break; }
            res = socket.recv_from(&mut buf) => res,
        };

        let (len, src) = match res {
            Ok(received) => {
                backoff.reset();
                received
            },
            Err(e) => {
                let Some(delay) = backoff.failed() else {
                    return Err(e).context("receive keeps failing");
                };
                log::warn!("[relay] receive failed, retrying in {:?}: {}", delay, e);
                tokio::select! {
                    _ = token.cancelled() => { log::trace!("[relay] exit"); break; }
                    _ = tokio::time::sleep(delay) => continue,
                }
            },
        };

        let Some(target) = packet::wol_payload_get_target_mac(&buf[..len]) else {
            log::trace!("[relay] ignoring {} byte datagram from {}", len, src);
            continue;
        };

        if !cooldown.admit(target, Instant::now()) {
            log::trace!("[relay] {} is cooling down", target);
            continue;
        }

        let Some(device) = registry.find_by_mac(&target) else {
            log::info!("[relay] no device registered for {}, ignoring", target);
            continue;
        };

        let request = match WakeRequest::for_device(device, &policy) {
            Ok(request) => request,
            Err(e) => {
                log::error!("[relay][{}] {}", device.name, e);
                continue;
            }
        };

        log::info!("[relay] waking '{}' on behalf of {}", device.name, src);

        let name = device.name.clone();
        tokio::task::spawn_blocking(move || {
            let report = Dispatcher::new().dispatch(&request);
            if report.delivered() {
                log::info!("[relay][{}] {}", name, report);
            } else {
                log::warn!("[relay][{}] {}", name, report);
            }
        });
    }

    Ok(())
}
