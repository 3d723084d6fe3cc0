//! Mini-Circuits programmable attenuators and RF switches.
//!
//! Both families speak the same ASCII command set over their serial/Ethernet interfaces
//! (and through the vendor USB library), acknowledging every write with `1`.

use super::{shared, DriverFactory, TypeCell};
use crate::backend::{BackendKind, SimulatedInstrument};
use crate::device::DeviceType;
use crate::error::DeviceResult;
use crate::state::StateDescriptor;
use crate::translator::{CommandSpec, DecodeRule, TemplateTranslator};
use parking_lot::Mutex;
use std::sync::{Arc, LazyLock};

/// Reply to a successful write.
const ACK: &str = "1";

fn tagged(prefix: &str) -> DecodeRule {
    DecodeRule::Pattern {
        regex: format!(r"^{prefix}=(?P<value>.+)$"),
    }
}

fn translator() -> TemplateTranslator {
    TemplateTranslator::new().with_ack(ACK)
}

fn identity() -> [StateDescriptor; 2] {
    [
        StateDescriptor::string("model")
            .read_only()
            .cached()
            .with_command(CommandSpec::query(":MN?").with_decode(tagged("MN")))
            .with_help("model number"),
        StateDescriptor::string("serial_number")
            .read_only()
            .cached()
            .with_command(CommandSpec::query(":SN?").with_decode(tagged("SN")))
            .with_help("serial number"),
    ]
}

// =============================================================================
// RCDAT attenuator
// =============================================================================

static RCDAT: TypeCell = LazyLock::new(|| build_rcdat().map_err(|e| e.to_string()));

fn build_rcdat() -> DeviceResult<Arc<DeviceType>> {
    DeviceType::builder("Mini-Circuits RCDAT")
        .accepts(BackendKind::Serial)
        .accepts(BackendKind::Visa)
        .accepts(BackendKind::Library)
        .translator(translator())
        .acknowledged()
        .attributes(identity())
        .attribute(
            StateDescriptor::float("attenuation")
                .with_range(0.0, 115.0)
                .with_step(0.25)
                .with_unit("dB")
                .with_command(CommandSpec::new(":ATT?", ":SETATT=${value}"))
                .with_help("uncalibrated attenuation"),
        )
        .build()
}

/// Catalog entry for the RCDAT attenuator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcdatFactory;

impl DriverFactory for RcdatFactory {
    fn driver_type(&self) -> &'static str {
        "minicircuits_rcdat"
    }

    fn name(&self) -> &'static str {
        "Mini-Circuits RCDAT programmable attenuator"
    }

    fn device_type(&self) -> DeviceResult<Arc<DeviceType>> {
        shared(&RCDAT)
    }

    fn simulator(&self) -> SimulatedInstrument {
        SimulatedInstrument::new()
            .with_alias(":SETATT", ":ATT")
            .with_register(":ATT", "0")
            .with_register(":MN", "MN=RCDAT-6000-110")
            .with_register(":SN", "SN=12208250156")
            .with_ack(ACK)
    }
}

// =============================================================================
// SP4T switch
// =============================================================================

static SWITCH: TypeCell = LazyLock::new(|| build_switch().map_err(|e| e.to_string()));

fn build_switch() -> DeviceResult<Arc<DeviceType>> {
    DeviceType::builder("Mini-Circuits USB-SP4T")
        .accepts(BackendKind::Serial)
        .accepts(BackendKind::Visa)
        .accepts(BackendKind::Library)
        .translator(translator())
        .acknowledged()
        .attributes(identity())
        .attribute(
            StateDescriptor::int("port")
                .with_range(1.0, 4.0)
                .with_command(CommandSpec::new("SP4TA:STATE?", "SP4TA:STATE:${value}"))
                .with_help("RF port connected to COM"),
        )
        .build()
}

/// Catalog entry for the SP4T switch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchFactory;

impl DriverFactory for SwitchFactory {
    fn driver_type(&self) -> &'static str {
        "minicircuits_switch"
    }

    fn name(&self) -> &'static str {
        "Mini-Circuits USB-SP4T RF switch"
    }

    fn device_type(&self) -> DeviceResult<Arc<DeviceType>> {
        shared(&SWITCH)
    }

    fn simulator(&self) -> SimulatedInstrument {
        // The switch command embeds the port after a colon, which the register
        // dialect cannot parse.
        let port = Arc::new(Mutex::new(1u8));
        SimulatedInstrument::new()
            .with_register(":MN", "MN=USB-SP4T-63")
            .with_register(":SN", "SN=11910100021")
            .with_ack(ACK)
            .with_responder(move |command| {
                if command == "SP4TA:STATE?" {
                    return Some(port.lock().to_string());
                }
                let requested = command.strip_prefix("SP4TA:STATE:")?;
                match requested.parse::<u8>() {
                    Ok(n) if (1..=4).contains(&n) => {
                        *port.lock() = n;
                        Some(ACK.to_string())
                    }
                    _ => Some("0".to_string()),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionParams, SimulatedParams};
    use crate::device::Device;
    use crate::error::DeviceError;
    use crate::value::Value;

    fn simulated(factory: &dyn DriverFactory) -> (Device, SimulatedInstrument) {
        let sim = factory.simulator();
        let device = Device::new(
            factory.driver_type(),
            factory.device_type().unwrap(),
            ConnectionParams::Simulated(SimulatedParams::new(sim.clone())),
        );
        (device, sim)
    }

    #[tokio::test]
    async fn test_attenuator_identity_and_setting() {
        let (mut att, sim) = simulated(&RcdatFactory);
        att.connect().await.unwrap();

        assert_eq!(att.get("model").await.unwrap(), Value::from("RCDAT-6000-110"));
        assert_eq!(att.get("serial_number").await.unwrap(), Value::from("12208250156"));

        att.set("attenuation", 31.75).await.unwrap();
        assert_eq!(sim.register(":ATT").as_deref(), Some("31.75"));
        assert_eq!(att.get("attenuation").await.unwrap(), Value::Float(31.75));
    }

    #[tokio::test]
    async fn test_attenuator_snaps_to_quarter_db() {
        let (mut att, sim) = simulated(&RcdatFactory);
        att.connect().await.unwrap();
        att.set("attenuation", 10.3).await.unwrap();
        assert_eq!(sim.register(":ATT").as_deref(), Some("10.25"));
    }

    #[tokio::test]
    async fn test_switch_ports() {
        let (mut switch, _sim) = simulated(&SwitchFactory);
        switch.connect().await.unwrap();

        switch.set("port", 3).await.unwrap();
        assert_eq!(switch.get("port").await.unwrap(), Value::Int(3));
        assert!(matches!(
            switch.set("port", 5).await,
            Err(DeviceError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_write_is_command_error() {
        let sim = SwitchFactory.simulator().with_ack("0");
        let mut switch = Device::new(
            "sw",
            SwitchFactory.device_type().unwrap(),
            ConnectionParams::Simulated(SimulatedParams::new(sim)),
        );
        switch.connect().await.unwrap();
        // The responder still answers the port command itself.
        switch.set("port", 2).await.unwrap();

        let sim = RcdatFactory.simulator().with_ack("0");
        let mut att = Device::new(
            "att",
            RcdatFactory.device_type().unwrap(),
            ConnectionParams::Simulated(SimulatedParams::new(sim)),
        );
        att.connect().await.unwrap();
        assert!(matches!(
            att.set("attenuation", 5.0).await,
            Err(DeviceError::Command { .. })
        ));
    }
}
