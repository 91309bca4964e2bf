//! Façade round-trips against the fake instruments.
//!
//! Every instrument runs its full initialization sequence plus its main
//! operations over a fake link, which keeps the command vocabularies and
//! the reply parsers honest against each other.

use std::time::Duration;

use seqcom::com::{Bus, BusOptions, Instrument};
use seqcom::fakes::{open_fake, FakeOptions};
use seqcom::instruments::{
    Arm9Chem, Fpga, Laser, LaserColor, Positionable, Pump, UsesSerial, Valve, XStage, YStage,
};

fn fake_bus(instrument: Instrument) -> Bus {
    let _ = env_logger::builder().is_test(true).try_init();
    Bus::with_options(
        instrument,
        open_fake(instrument, FakeOptions::new()),
        BusOptions::default().min_spacing(Duration::ZERO),
    )
}

#[tokio::test(start_paused = true)]
async fn test_ystage_initialize_and_move() {
    let y = YStage::new(fake_bus(Instrument::Y));
    y.initialize().await.unwrap();

    y.r#move(2_000_000, false).await.unwrap();
    assert_eq!(y.pos().await.unwrap(), 0);
    assert!(!y.is_moving().await.unwrap());

    // Imaging mode takes the slow velocity path.
    y.r#move(0, true).await.unwrap();

    assert!(y.r#move(8_000_000, false).await.is_err());
}

#[tokio::test]
async fn test_xstage_initialize_and_query() {
    let x = XStage::new(fake_bus(Instrument::X));
    x.initialize().await.unwrap();

    assert_eq!(x.pos().await.unwrap(), 12000);
    assert!(!x.is_moving().await.unwrap());
    x.move_to(30000).await.unwrap();

    assert!(x.move_to(999).await.is_err());
}

#[tokio::test]
async fn test_laser_power_and_status() {
    let laser = Laser::new(LaserColor::Green, fake_bus(Instrument::LaserG));
    laser.initialize().await.unwrap();

    laser.on().await.unwrap();
    laser.set_power(120).await.unwrap();
    assert_eq!(laser.power().await.unwrap(), 0);
    assert!(laser.status().await.unwrap());
    laser.off().await.unwrap();

    assert!(laser.set_power(501).await.is_err());
}

#[tokio::test]
async fn test_pump_plunger_cycle() {
    let pump = Pump::new(Instrument::PumpA, fake_bus(Instrument::PumpA));
    pump.initialize().await.unwrap();
    assert_eq!(pump.pos().await.unwrap(), 0);
    assert!(pump.status().await.unwrap());

    pump.valve_waste().await.unwrap();
    pump.pull(4800, 1000, false).await.unwrap();
    assert_eq!(pump.pos().await.unwrap(), 4800);
    pump.push(0, 8000, false).await.unwrap();
    assert_eq!(pump.pos().await.unwrap(), 0);

    // Speed outside the allowed band is refused before the wire.
    assert!(pump.pull(4800, 10, false).await.is_err());
    // Pulling to a position the plunger is already past is refused too.
    assert!(pump.push(100, 1000, false).await.is_err());
}

#[tokio::test]
async fn test_valve_move_and_verify() {
    let valve = Valve::new(fake_bus(Instrument::ValveA1), 10);
    valve.initialize().await.unwrap();

    assert_eq!(valve.pos().await.unwrap(), 1);
    valve.r#move(3).await.unwrap();
    assert_eq!(valve.pos().await.unwrap(), 3);
    // Moving to the current port sends nothing and succeeds.
    valve.r#move(3).await.unwrap();

    assert!(valve.r#move(11).await.is_err());
}

#[tokio::test]
async fn test_valve_port_count_mismatch() {
    let valve = Valve::new(fake_bus(Instrument::ValveA2), 24);
    assert!(valve.initialize().await.is_err());
}

#[tokio::test]
async fn test_arm9chem_identify_and_temps() {
    let chem = Arm9Chem::new(fake_bus(Instrument::Arm9Chem));
    chem.initialize().await.unwrap();

    assert!(chem.identify().await.unwrap().contains("Fluidics"));
    assert_eq!(chem.fc_temp(0).await.unwrap(), 0.0);
    assert_eq!(chem.reservoir_temps().await.unwrap(), (0.0, 0.0));

    assert!(chem.fc_temp(2).await.is_err());
}

#[tokio::test]
async fn test_fpga_operations() {
    let fpga = Fpga::new(fake_bus(Instrument::Fpga));
    fpga.initialize().await.unwrap();

    fpga.em_filter(true).await.unwrap();
    fpga.em_filter(false).await.unwrap();
    fpga.laser_shutter(true).await.unwrap();
    fpga.z_move(1000).await.unwrap();
    assert_eq!(fpga.tilt_pos(1).await.unwrap(), 0);
    fpga.tilt_move(2, 5).await.unwrap();

    assert!(fpga.z_move(30000).await.is_err());
    assert!(fpga.tilt_pos(4).await.is_err());
}

#[test]
fn test_steps_from_mm() {
    assert_eq!(YStage::steps_from_mm(1.0), 100_000);
    assert_eq!(XStage::steps_from_mm(10.0), 4096);
}
