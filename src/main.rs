use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use tokio_util::sync::CancellationToken;

mod config;
mod device;
mod dispatch;
mod error;
mod mac;
mod packet;
mod plan;
mod relay;

use config::{Config, DeliveryConfig};
use device::{Device, Registry, TargetConfig};
use dispatch::Dispatcher;
use mac::MacAddress;
use plan::WakeRequest;

#[derive(Parser)]
#[command(author, version, about = "Wake network devices with Wake-on-LAN magic packets")]
struct Cli {
    /// YAML configuration file [default: ~/.config/wol-wake/config.yml]
    #[arg(short, long)]
    config: Option<String>,

    /// Log more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wake a machine by MAC address, using its registered record when there is one
    Wake {
        mac: String,

        /// Host IP; its /24 broadcast address becomes the primary target
        #[arg(long)]
        ip: Option<String>,

        /// Primary target when no IP is given
        #[arg(long)]
        broadcast: Option<String>,

        #[arg(short, long)]
        port: Option<i64>,

        /// Explicit IPv4 target `address[:port]`, repeatable; replaces the derived plan
        #[arg(short, long = "target")]
        targets: Vec<TargetConfig>,

        /// Pause between attempts in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Wake configured devices by name or MAC
    Device {
        #[arg(required_unless_present = "macs")]
        names: Vec<String>,

        /// Registered device MAC, any format, repeatable
        #[arg(long = "mac")]
        macs: Vec<String>,
    },

    /// List configured devices
    List,

    /// Forward incoming magic packets along the configured devices' plans
    Relay {
        #[arg(long)]
        listen_addr: Option<IpAddr>,

        #[arg(long)]
        listen_port: Option<u16>,
    },
}

/// Runs one blocking dispatch per device; requests share nothing and run concurrently.
async fn wake_all(devices: Vec<Device>, policy: &DeliveryConfig) -> Result<()> {
    let total = devices.len();
    let mut failures = 0;
    let mut handles = Vec::with_capacity(total);

    for device in devices {
        let request = match WakeRequest::for_device(&device, policy) {
            Ok(request) => request,
            Err(e) => {
                log::error!("[wake][{}] {}", device.name, e);
                failures += 1;
                continue;
            }
        };
        log::debug!("[wake][{}] {} targets, up to {:?} of pacing",
            device.name, request.plan.len(), request.max_pacing());

        let h = tokio::task::spawn_blocking(move || Dispatcher::new().dispatch(&request));
        handles.push((device.name, h));
    }

    for (name, h) in handles {
        let report = h.await.context("dispatch task failed")?;
        log::info!("[wake][{}] {}", name, report);

        if report.delivered() {
            println!("Wake-on-LAN packet sent to {}", name);
        } else {
            eprintln!("No Wake-on-LAN packet could be sent to {}", name);
            for err in report.failures() {
                eprintln!("  {} ({:?})", err, err.kind());
            }
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{} of {} wake requests failed", failures, total);
    }
    Ok(())
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    simple_logger::SimpleLogger::new().with_level(log_level(cli.verbose)).init()?;

    let mut cfg = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Wake { mac, ip, broadcast, port, targets, delay_ms } => {
            let overridden = ip.is_some() || broadcast.is_some() || port.is_some() || !targets.is_empty();
            let device = if overridden {
                let mut device = Device::new(mac.clone(), mac);
                device.ip_address = ip;
                device.broadcast_ip = broadcast;
                device.port = port;
                if !targets.is_empty() {
                    device.targets = Some(targets);
                }
                device
            } else {
                let device = Registry::new(cfg.devices).device_for_mac(&mac)?;
                log::debug!("[wake] {} resolved to '{}'", mac, device.name);
                device
            };
            if let Some(delay_ms) = delay_ms {
                cfg.delivery.delay_ms = delay_ms;
            }
            wake_all(vec![device], &cfg.delivery).await
        },
        Command::Device { names, macs } => {
            let registry = Registry::new(cfg.devices);
            let by_name = names.iter().map(|name| registry.find_by_name(name));
            let by_mac = macs.iter().map(|mac| registry.find_by_raw_mac(mac));
            let devices = by_name
                .chain(by_mac)
                .map(|found| found.cloned())
                .collect::<Result<Vec<_>, _>>()?;
            wake_all(devices, &cfg.delivery).await
        },
        Command::List => {
            let registry = Registry::new(cfg.devices);
            for d in registry.iter() {
                let mac = MacAddress::normalize(&d.mac_address)
                    .map_or_else(|_| format!("{} (invalid)", d.mac_address), |m| m.to_string());
                println!("{}\t{}\t{}\t{}", d.name, mac,
                    d.ip_address.as_deref().unwrap_or("-"), d.port());
            }
            Ok(())
        },
        Command::Relay { listen_addr, listen_port } => {
            let mut relay_cfg = cfg.relay.unwrap_or_default();
            if let Some(addr) = listen_addr { relay_cfg.listen_addr = addr; }
            if let Some(port) = listen_port { relay_cfg.listen_port = port; }

            let cancel_token = CancellationToken::new();
            let sigint_token = cancel_token.clone();

            ctrlc::set_handler(move || {
                log::info!("received SIGINT");
                sigint_token.cancel();
            }).context("failed to install SIGINT handler")?;

            relay::l4_worker(
                relay_cfg,
                Arc::new(Registry::new(cfg.devices)),
                Arc::new(cfg.delivery),
                cancel_token,
            ).await
        },
    }
}
