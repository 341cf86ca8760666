//! usbstord - host-side USB bulk storage driver daemon
//!
//! Watches the bus for devices carrying the configured (vendor, product)
//! identity, attaches each one as a `storage<N>` session, and tears sessions
//! down again when the device leaves.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use tracing::{debug, info, warn};

use storage::config::DriverConfig;
use storage::controller::AttachmentController;
use storage::host::{UsbDevice, UsbTransport};
use storage::registry::SessionRegistry;

#[derive(Parser, Debug)]
#[command(name = "usbstord", version, about = "Host-side USB bulk storage driver daemon")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

enum DeviceEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

/// Forwards libusb hotplug callbacks into the async event loop.
struct HotplugForwarder {
    events: async_channel::Sender<DeviceEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        let _ = self.events.send_blocking(DeviceEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        let _ = self.events.send_blocking(DeviceEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = DriverConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    common::setup_logging(log_level).context("initializing logging")?;

    info!(
        vendor = format_args!("{:#06x}", config.device.vendor_id),
        product = format_args!("{:#06x}", config.device.product_id),
        "usbstord starting"
    );

    run(config).await
}

async fn run(config: DriverConfig) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let controller = AttachmentController::new(Arc::clone(&registry), config.write_policy());

    let context = Context::new().context("creating USB context")?;
    let (event_tx, event_rx) = async_channel::bounded(64);

    // Pick up devices already on the bus before hotplug kicks in.
    for device in context
        .devices()
        .context("enumerating USB devices")?
        .iter()
    {
        let _ = event_tx.send(DeviceEvent::Arrived(device)).await;
    }

    let _registration = if rusb::has_hotplug() {
        let forwarder = HotplugForwarder {
            events: event_tx.clone(),
        };
        Some(
            HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(forwarder))
                .context("registering hotplug callbacks")?,
        )
    } else {
        warn!("hotplug not supported on this platform; only present devices are attached");
        None
    };

    // libusb needs its event loop pumped for hotplug callbacks to fire.
    let running = Arc::new(AtomicBool::new(true));
    let events_thread = {
        let context = context.clone();
        let running = Arc::clone(&running);
        std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    if let Err(e) = context.handle_events(Some(Duration::from_millis(100))) {
                        warn!("error handling USB events: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            })
            .context("spawning USB event thread")?
    };

    let mut attached: HashMap<(u8, u8), u32> = HashMap::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = event_rx.recv() => {
                match event {
                    Ok(DeviceEvent::Arrived(device)) => {
                        handle_arrival(&controller, &config, device, &mut attached);
                    }
                    Ok(DeviceEvent::Left { bus, address }) => {
                        if let Some(slot) = attached.remove(&(bus, address)) {
                            if let Err(e) = controller.detach(slot) {
                                warn!(slot, "detach failed: {}", e);
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    for (_, slot) in attached.drain() {
        let _ = controller.detach(slot);
    }
    running.store(false, Ordering::Release);
    let _ = events_thread.join();

    Ok(())
}

fn handle_arrival(
    controller: &AttachmentController,
    config: &DriverConfig,
    device: Device<Context>,
    attached: &mut HashMap<(u8, u8), u32>,
) {
    let key = (device.bus_number(), device.address());
    if attached.contains_key(&key) {
        return;
    }

    match attach_device(controller, config, device) {
        Ok(Some(slot)) => {
            attached.insert(key, slot);
        }
        Ok(None) => {
            // Not our device.
        }
        Err(e) => {
            warn!(bus = key.0, address = key.1, "attach failed: {}", e);
        }
    }
}

/// Attach one discovered device if it matches the configured identity.
fn attach_device(
    controller: &AttachmentController,
    config: &DriverConfig,
    device: Device<Context>,
) -> common::Result<Option<u32>> {
    let usb = UsbDevice::new(device).map_err(|e| common::Error::Usb(e.to_string()))?;
    if !usb.matches(&config.device) {
        debug!(
            vendor = format_args!("{:#06x}", usb.vendor_id()),
            product = format_args!("{:#06x}", usb.product_id()),
            "ignoring non-matching device"
        );
        return Ok(None);
    }

    let (interface, endpoints) = usb.endpoints()?;
    let handle = usb.open(interface)?;
    let transport = Arc::new(UsbTransport::spawn(handle, config.transfer.timeout())?);

    let slot = controller.attach(transport, &endpoints)?;
    info!(
        bus = usb.bus_number(),
        address = usb.address(),
        node = format_args!("storage{}", slot),
        "device attached"
    );
    Ok(Some(slot))
}
