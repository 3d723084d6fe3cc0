//! End-to-end attribute behaviour against simulated instruments.

use lab_devices::backend::{SimulatedInstrument, SimulatedParams};
use lab_devices::drivers::{self, DriverFactory};
use lab_devices::{
    CommandSpec, ConnectionParams, Device, DeviceError, DeviceState, DeviceType, StateDescriptor,
    Value,
};
use std::sync::Arc;

fn supply_type() -> Arc<DeviceType> {
    DeviceType::builder("Bench supply")
        .attributes([
            StateDescriptor::float("voltage")
                .with_range(0.0, 30.0)
                .with_unit("V")
                .with_command(CommandSpec::scpi("VOLT")),
            StateDescriptor::string("identity")
                .read_only()
                .with_command(CommandSpec::query("*IDN?")),
            StateDescriptor::int("trigger_delay")
                .write_only()
                .with_range(0.0, 1000.0)
                .with_command(CommandSpec::write("TRIG:DEL ${value}")),
        ])
        .build()
        .unwrap()
}

fn simulated(sim: &SimulatedInstrument) -> ConnectionParams {
    ConnectionParams::Simulated(SimulatedParams::new(sim.clone()))
}

#[tokio::test]
async fn read_only_write_only_and_read_write_attributes() {
    let sim = SimulatedInstrument::new()
        .with_register("*IDN", "ACME,PS-30,0001,2.1")
        .with_register("VOLT", "0");
    let mut supply = Device::new("psu", supply_type(), simulated(&sim));
    supply.connect().await.unwrap();

    let identity = supply.get("identity").await.unwrap();
    let err = supply.set("identity", "other").await.unwrap_err();
    assert!(matches!(err, DeviceError::Access { .. }));
    assert_eq!(supply.cached("identity"), Some(identity));

    assert!(matches!(
        supply.get("trigger_delay").await,
        Err(DeviceError::Access { .. })
    ));
    supply.set("trigger_delay", 250).await.unwrap();
    assert!(sim.command_log().contains(&"TRIG:DEL 250".to_string()));

    supply.set("voltage", 12.5).await.unwrap();
    assert_eq!(sim.register("VOLT").as_deref(), Some("12.5"));
    assert_eq!(supply.get("voltage").await.unwrap(), Value::Float(12.5));

    supply.disconnect().await;
}

#[tokio::test]
async fn attenuation_round_trips_across_the_whole_grid() {
    let factory = drivers::lookup("minicircuits_rcdat").unwrap();
    let sim = factory.simulator();
    let mut attenuator = Device::new("att", factory.device_type().unwrap(), simulated(&sim));
    attenuator.connect().await.unwrap();

    for step in 0..=460u32 {
        let db = f64::from(step) * 0.25;
        attenuator.set("attenuation", db).await.unwrap();
        assert_eq!(attenuator.get("attenuation").await.unwrap(), Value::Float(db), "at {db} dB");
    }
    assert_eq!(sim.register(":ATT").as_deref(), Some("115"));
    attenuator.disconnect().await;
}

#[tokio::test]
async fn invalid_value_never_reaches_the_instrument() {
    let factory = drivers::lookup("minicircuits_rcdat").unwrap();
    let sim = factory.simulator();
    let mut attenuator = Device::new("att", factory.device_type().unwrap(), simulated(&sim));
    attenuator.connect().await.unwrap();
    sim.clear_log();

    attenuator.setup([("attenuation", 10.5)]).await.unwrap();
    assert_eq!(sim.command_log(), vec![":SETATT=10.5".to_string()]);
    assert_eq!(attenuator.cached("attenuation"), Some(Value::Float(10.5)));

    sim.clear_log();
    let err = attenuator.setup([("attenuation", 999.0)]).await.unwrap_err();
    assert!(matches!(err, DeviceError::Validation { .. }));
    assert!(sim.command_log().is_empty());
    assert_eq!(attenuator.cached("attenuation"), Some(Value::Float(10.5)));

    attenuator.disconnect().await;
}

#[tokio::test]
async fn connected_attribute_follows_lifecycle() {
    let sim = SimulatedInstrument::new();
    let params = ConnectionParams::Simulated(SimulatedParams::new(sim.clone()).with_baud_rate(115_200));
    let mut device = Device::new("sim", supply_type(), params);

    assert_eq!(device.get("connected").await.unwrap(), Value::Bool(false));
    device.connect().await.unwrap();
    assert_eq!(device.get("connected").await.unwrap(), Value::Bool(true));
    assert_eq!(device.lifecycle(), DeviceState::Connected);

    device.disconnect().await;
    assert_eq!(device.get("connected").await.unwrap(), Value::Bool(false));

    // A second disconnect is a no-op.
    device.disconnect().await;
    assert_eq!(device.lifecycle(), DeviceState::Disconnected);
    assert_eq!(sim.open_count(), 1);
    assert_eq!(sim.close_count(), 1);
}

#[tokio::test]
async fn stale_values_survive_disconnect() {
    let sim = SimulatedInstrument::new().with_register("VOLT", "3.3");
    let mut supply = Device::new("psu", supply_type(), simulated(&sim));
    supply.connect().await.unwrap();
    assert_eq!(supply.get("voltage").await.unwrap(), Value::Float(3.3));
    supply.disconnect().await;

    assert_eq!(supply.is_stale("voltage"), Some(true));
    assert_eq!(supply.get("voltage").await.unwrap(), Value::Float(3.3));
    assert!(matches!(
        supply.get("identity").await,
        Err(DeviceError::NotConnected(_))
    ));
    assert!(matches!(
        supply.set("voltage", 5.0).await,
        Err(DeviceError::NotConnected(_))
    ));
}
