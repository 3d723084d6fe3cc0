//! CLI Entry Point for labdev
//!
//! Provides command-line access to configured instruments:
//! - Listing the built-in driver catalog
//! - Enumerating attached serial adapters
//! - Reading and writing attributes
//! - Streaming from polling instruments
//!
//! # Usage
//!
//! ```bash
//! labdev --config config/labdev.toml get att1 attenuation
//! labdev set att1 attenuation 10.5
//! labdev --simulate stream gps --seconds 5
//! labdev discover --hwid "USB VID:PID=0403:6014"
//! ```
//!
//! Results go to stdout as JSON; logs go to stderr.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use lab_devices::backend::{ConnectionParams, SimulatedParams};
use lab_devices::config::{LabConfig, DEFAULT_CONFIG_PATH};
use lab_devices::discovery::{self, Discovery, HardwareId, ResourceCandidate};
use lab_devices::drivers::{self, iperf};
use lab_devices::{logging, Device, Value};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "labdev")]
#[command(about = "Control laboratory instruments from the command line", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Replace every device connection with its simulator
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List built-in drivers
    Drivers,

    /// List attached serial adapters
    Discover {
        /// Only show adapters matching this hardware id
        #[arg(long)]
        hwid: Option<String>,
    },

    /// Read attributes (all readable ones when none are named)
    Get {
        /// Device id from the configuration
        device: String,
        /// Attribute names
        attributes: Vec<String>,
    },

    /// Write one attribute
    Set {
        /// Device id from the configuration
        device: String,
        /// Attribute name
        attribute: String,
        /// New value, parsed according to the attribute's type
        value: String,
    },

    /// Run a named action
    Invoke {
        /// Device id from the configuration
        device: String,
        /// Action name
        action: String,
    },

    /// Stream results from a polling device
    Stream {
        /// Device id from the configuration
        device: String,
        /// How long to stream
        #[arg(long, default_value = "10")]
        seconds: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.simulate {
        for device in &mut config.devices {
            device.connection = ConnectionParams::Simulated(SimulatedParams::default());
        }
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Drivers => list_drivers(),
        Commands::Discover { hwid } => discover(hwid.as_deref()).await,
        Commands::Get { device, attributes } => get(&config, &device, &attributes).await,
        Commands::Set {
            device,
            attribute,
            value,
        } => set(&config, &device, &attribute, &value).await,
        Commands::Invoke { device, action } => invoke(&config, &device, &action).await,
        Commands::Stream { device, seconds } => stream(&config, &device, seconds).await,
    }
}

fn list_drivers() -> Result<()> {
    for factory in drivers::catalog() {
        let device_type = factory.device_type()?;
        let attributes = device_type.registry().names();
        println!(
            "{}",
            json!({
                "driver": factory.driver_type(),
                "name": factory.name(),
                "model": device_type.model(),
                "transports": device_type.accepts(),
                "attributes": attributes,
            })
        );
    }
    Ok(())
}

async fn discover(hwid: Option<&str>) -> Result<()> {
    let source = serial_discovery()?;
    let candidates: Vec<ResourceCandidate> = match hwid {
        Some(text) => {
            let filter: HardwareId = text.parse()?;
            discovery::find(source.as_ref(), &filter).await?
        }
        None => source.candidates().await?,
    };
    if candidates.is_empty() {
        warn!("no serial adapters found");
    }
    for candidate in &candidates {
        println!("{}", serde_json::to_string(candidate)?);
    }
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn serial_discovery() -> Result<Box<dyn Discovery>> {
    Ok(Box::new(discovery::SerialDiscovery))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_discovery() -> Result<Box<dyn Discovery>> {
    bail!("serial support is disabled (build with feature 'instrument_serial')")
}

/// Build, connect and configure a device from its configuration entry.
async fn open(config: &LabConfig, id: &str) -> Result<Device> {
    let entry = config
        .device(id)
        .ok_or_else(|| anyhow!("no device '{id}' in configuration"))?;
    if !entry.enabled {
        bail!("device '{id}' is disabled");
    }
    let mut device = config.build_device(entry)?;
    let settings = entry.settings_for(device.device_type())?;

    device.connect().await?;
    if !settings.is_empty() {
        info!(device = id, count = settings.len(), "applying configured settings");
        if let Err(e) = device.setup(settings).await {
            device.disconnect().await;
            return Err(e.into());
        }
    }
    Ok(device)
}

async fn get(config: &LabConfig, id: &str, attributes: &[String]) -> Result<()> {
    let mut device = open(config, id).await?;
    let result = read_attributes(&mut device, attributes).await;
    device.disconnect().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn read_attributes(
    device: &mut Device,
    attributes: &[String],
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let names: Vec<String> = if attributes.is_empty() {
        device
            .attributes()
            .filter(|d| d.access.readable() && (!d.is_local() || device.cached(&d.name).is_some()))
            .map(|d| d.name.clone())
            .collect()
    } else {
        attributes.to_vec()
    };

    let mut values = serde_json::Map::new();
    for name in names {
        let value = device.get(&name).await?;
        values.insert(name, serde_json::to_value(value)?);
    }
    Ok(values)
}

async fn set(config: &LabConfig, id: &str, attribute: &str, text: &str) -> Result<()> {
    let mut device = open(config, id).await?;
    let result = async {
        let descriptor = device
            .descriptor(attribute)
            .ok_or_else(|| anyhow!("'{id}' has no attribute '{attribute}'"))?;
        let value: Value = descriptor.parse_text(text)?;
        device.set(attribute, value).await?;
        Ok::<_, anyhow::Error>(device.cached(attribute))
    }
    .await;
    device.disconnect().await;

    let applied = result?;
    println!("{}", json!({ attribute: applied }));
    Ok(())
}

async fn invoke(config: &LabConfig, id: &str, action: &str) -> Result<()> {
    let mut device = open(config, id).await?;
    let result = device.invoke(action).await;
    device.disconnect().await;
    result?;
    info!(device = id, action, "action completed");
    Ok(())
}

async fn stream(config: &LabConfig, id: &str, seconds: f64) -> Result<()> {
    if !(seconds.is_finite() && seconds > 0.0) {
        bail!("--seconds must be positive");
    }
    let is_iperf = config
        .device(id)
        .and_then(|d| d.driver.as_deref())
        .is_some_and(|d| d.eq_ignore_ascii_case("iperf"));

    let mut device = open(config, id).await?;
    let started = if is_iperf {
        iperf::start(&mut device).await
    } else {
        device.start().await
    };
    if let Err(e) = started {
        device.disconnect().await;
        return Err(e.into());
    }

    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    let outcome = async {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            for result in device.fetch(Some(remaining)).await? {
                println!("{}", serde_json::to_string(&result)?);
            }
            if !device.is_running() {
                break;
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    let stopped = device.stop().await;
    if device.dropped_results() > 0 {
        warn!(device = id, dropped = device.dropped_results(), "results were dropped");
    }
    device.disconnect().await;
    outcome?;
    stopped?;
    Ok(())
}
