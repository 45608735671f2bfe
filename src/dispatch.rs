use std::fmt;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use crate::error::TransmissionError;
use crate::mac::MacAddress;
use crate::packet::MagicPacket;
use crate::plan::{BroadcastTarget, PlanEntry, WakeRequest};

/// Puts one datagram on the wire.
pub trait Transport {
    fn send(&self, payload: &[u8], target: &BroadcastTarget) -> io::Result<()>;
}

/// Opens a fresh broadcast-enabled socket for every send and closes it on return.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport;

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8], target: &BroadcastTarget) -> io::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.send_to(payload, (target.address.as_str(), target.port))?;
        Ok(())
    }
}

/// Waits between two attempts.
pub trait Pacer {
    fn pause(&self, delay: Duration);
}

/// Blocks the calling thread only.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Sent,
    Failed(TransmissionError),
}

impl AttemptOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

#[derive(Debug)]
pub struct TargetReport {
    pub target: BroadcastTarget,
    /// Appended by the dispatcher because the plan had no global broadcast.
    pub implicit: bool,
    pub attempts: Vec<AttemptOutcome>,
}

impl TargetReport {
    pub fn delivered(&self) -> bool {
        self.attempts.iter().any(AttemptOutcome::is_sent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// At least one datagram left the host.
    Delivered,
    /// Every attempt on every target failed.
    ExhaustedPlan,
}

#[derive(Debug)]
pub struct DispatchReport {
    pub mac: MacAddress,
    pub targets: Vec<TargetReport>,
}

impl DispatchReport {
    pub fn delivered(&self) -> bool {
        self.targets.iter().any(TargetReport::delivered)
    }

    pub fn outcome(&self) -> Outcome {
        if self.delivered() { Outcome::Delivered } else { Outcome::ExhaustedPlan }
    }

    pub fn attempts_issued(&self) -> usize {
        self.targets.iter().map(|t| t.attempts.len()).sum()
    }

    pub fn attempts_sent(&self) -> usize {
        self.targets
            .iter()
            .flat_map(|t| t.attempts.iter())
            .filter(|a| a.is_sent())
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TransmissionError> {
        self.targets
            .iter()
            .flat_map(|t| t.attempts.iter())
            .filter_map(|a| match a {
                AttemptOutcome::Failed(err) => Some(err),
                AttemptOutcome::Sent => None,
            })
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "magic packet for {}: {}/{} datagrams sent via",
            self.mac,
            self.attempts_sent(),
            self.attempts_issued()
        )?;
        for (i, t) in self.targets.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            let status = if t.delivered() { "ok" } else { "failed" };
            let kind = if t.implicit { ", fallback" } else { "" };
            write!(f, "{}{} ({}{})", sep, t.target, status, kind)?;
        }
        Ok(())
    }
}

/// Sends the magic packet of a [`WakeRequest`] along its delivery plan.
pub struct Dispatcher<T = UdpTransport, P = ThreadPacer> {
    transport: T,
    pacer: P,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { transport: UdpTransport, pacer: ThreadPacer }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport, P: Pacer> Dispatcher<T, P> {
    pub fn with(transport: T, pacer: P) -> Self {
        Self { transport, pacer }
    }

    /// Walks the plan front to back, `attempts` sends per target, pausing
    /// `request.delay` after every send but the last. Failed sends are
    /// recorded and never stop the walk. The global broadcast on
    /// `request.port` is always tried, appended if the plan lacks it.
    pub fn dispatch(&self, request: &WakeRequest) -> DispatchReport {
        let packet = MagicPacket::new(request.mac);

        let mut plan: Vec<(PlanEntry, bool)> = request
            .plan
            .iter()
            .cloned()
            .map(|entry| (entry, false))
            .collect();
        let has_global = plan
            .iter()
            .any(|(e, _)| e.target.is_global() && e.target.port == request.port);
        if !has_global {
            log::debug!("[dispatch][{}] appending global broadcast fallback", request.mac);
            plan.push((PlanEntry::new(BroadcastTarget::global(request.port), 1), true));
        }

        let total: u64 = plan.iter().map(|(e, _)| u64::from(e.attempts)).sum();
        let mut issued: u64 = 0;
        let mut targets = Vec::with_capacity(plan.len());

        for (entry, implicit) in plan {
            let mut attempts = Vec::with_capacity(entry.attempts as usize);

            for n in 1..=entry.attempts {
                let outcome = match self.transport.send(packet.as_bytes(), &entry.target) {
                    Ok(()) => {
                        log::debug!("[dispatch][{}] sent to {} ({}/{})",
                            request.mac, entry.target, n, entry.attempts);
                        AttemptOutcome::Sent
                    },
                    Err(source) => {
                        let err = TransmissionError { target: entry.target.clone(), source };
                        log::warn!("[dispatch][{}] attempt {}/{}: {} ({:?})",
                            request.mac, n, entry.attempts, err, err.kind());
                        AttemptOutcome::Failed(err)
                    },
                };
                attempts.push(outcome);

                issued += 1;
                if issued < total {
                    self.pacer.pause(request.delay);
                }
            }

            targets.push(TargetReport { target: entry.target, implicit, attempts });
        }

        let report = DispatchReport { mac: request.mac, targets };
        if report.outcome() == Outcome::ExhaustedPlan {
            log::warn!("[dispatch][{}] exhausted delivery plan, no datagram was sent", request.mac);
        }
        report
    }
}
