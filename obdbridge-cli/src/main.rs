use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use obdbridge_ble::BleConnection;
use obdbridge_connection::{Connection, MockConnection, StreamConnection, DEFAULT_SERIAL_BAUD};
use obdbridge_elm327::Elm327Engine;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// Direct USB/RFCOMM serial device.
    Serial,
    /// Bluetooth Low Energy adapter.
    Ble,
    /// In-memory mock, for trying the CLI without hardware.
    Mock,
}

/// Connect to an ELM327-class OBD-II adapter, initialize it, and read Kia
/// Niro EV state of charge.
#[derive(Debug, Parser)]
#[command(name = "obdbridge", version, about)]
struct Args {
    /// Which connection backend to use.
    #[arg(long, value_enum, default_value_t = Backend::Serial)]
    backend: Backend,

    /// Serial device path (backend = serial), e.g. /dev/ttyUSB0 or COM4.
    #[arg(long, default_value = "/dev/ttyUSB0")]
    device: String,

    /// Serial baud rate (backend = serial).
    #[arg(long, default_value_t = DEFAULT_SERIAL_BAUD)]
    baud: u32,

    /// Substring to match the adapter's advertised BLE name against
    /// (backend = ble).
    #[arg(long, default_value = "OBD")]
    ble_name: String,

    /// Per-command timeout, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Keep the connection alive with background tester-present traffic
    /// after reading SOC.
    #[arg(long)]
    tester_present: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);

    let conn: Box<dyn Connection> = match args.backend {
        Backend::Serial => Box::new(StreamConnection::new(&args.device, args.baud)),
        Backend::Ble => Box::new(BleConnection::new(args.ble_name.clone(), timeout)),
        Backend::Mock => Box::new(mock_adapter()),
    };

    let engine = Elm327Engine::new(conn, timeout);
    engine.initialize().context("failed to initialize ELM327 adapter")?;
    info!("adapter initialized over {:?} backend", args.backend);

    if args.tester_present {
        engine
            .start_tester_present(Duration::from_secs(2))
            .context("failed to start tester-present keep-alive")?;
    }

    let soc = obdbridge_niro::read_state_of_charge(&engine)
        .context("failed to read Kia Niro EV state of charge")?;
    println!("state of charge: {soc:.1}%");

    if args.tester_present {
        engine.stop_tester_present();
    }

    Ok(())
}

/// A mock adapter pre-scripted to answer the Kia Niro EV SOC request from
/// end-to-end scenario S1, for trying the CLI without real hardware.
fn mock_adapter() -> MockConnection {
    use obdbridge_connection::Matcher;

    let soc_response = b"SEARCHING...\r\
7EC 10 3E 62 01 01 EF FB E7 \r\
7EC 21 ED 69 00 00 00 00 00 \r\
7EC 22 00 00 0E 26 0D 0C 0D \r\
7EC 23 0D 0D 00 00 00 34 BC \r\
7EC 24 18 BC 56 00 00 7C 00 \r\
7EC 25 02 DE 80 00 02 C9 55 \r\
7EC 26 00 01 19 AF 00 01 07 \r\
7EC 27 C3 00 EC 65 6F 00 00 \r\
7EC 28 03 00 00 00 00 0B B8 \r>"
        .to_vec();

    MockConnection::new(vec![
        (Matcher::Exact("ATZ".to_string()), b"ELM327 v1.5\r\r>".to_vec()),
        (Matcher::Exact("ATE0".to_string()), b"OK\r\r>".to_vec()),
        (Matcher::Exact("ATL0".to_string()), b"OK\r\r>".to_vec()),
        (Matcher::Exact("ATS0".to_string()), b"OK\r\r>".to_vec()),
        (Matcher::Exact("ATH1".to_string()), b"OK\r\r>".to_vec()),
        (Matcher::Exact("ATSP0".to_string()), b"OK\r\r>".to_vec()),
        (Matcher::Exact("ATSH7E4".to_string()), b"OK\r\r>".to_vec()),
        (Matcher::Exact("220101".to_string()), soc_response),
        (Matcher::Prefix("3E00".to_string()), b"7EC037E00\r\r>".to_vec()),
    ])
}
