//! Kia Niro EV battery-management-system state-of-charge decoder.
//!
//! The core exposes only raw UDS payloads; everything vehicle-specific —
//! which ECU to ask, which DID, and how to turn the answer into a percentage
//! — lives here, deliberately thin.

use log::debug;
use obdbridge_elm327::{DiagError, Elm327Engine};
use obdbridge_connection::Connection;

/// CAN request ID of the battery management system on HKMC EVs.
pub const BMS_CAN_ID: u16 = 0x7E4;
/// Data identifier for the battery status PID this decoder targets.
pub const SOC_DATA_IDENTIFIER: u16 = 0x0101;

/// Read state of charge as a percentage (0.0-100.0).
pub fn read_state_of_charge<C: Connection>(engine: &Elm327Engine<C>) -> Result<f32, DiagError> {
    let payload = engine.read_data_by_identifier(BMS_CAN_ID, SOC_DATA_IDENTIFIER)?;
    let raw = *payload
        .get(4)
        .ok_or_else(|| DiagError::Parse(format!("SOC payload too short: {} bytes", payload.len())))?;
    let soc = f32::from(raw) / 2.0;
    debug!("decoded SOC: raw=0x{raw:02X} -> {soc}%");
    Ok(soc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obdbridge_connection::{Matcher, MockConnection};
    use std::time::Duration;

    #[test]
    fn s1_soc_decodes_to_52_5_percent() {
        let mock_response = b"SEARCHING...\r\
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

        let engine = Elm327Engine::new(
            MockConnection::new(vec![
                (Matcher::Exact("ATSH7E4".to_string()), b"OK\r\r>".to_vec()),
                (Matcher::Exact("220101".to_string()), mock_response),
            ]),
            Duration::from_millis(200),
        );

        let soc = read_state_of_charge(&engine).unwrap();
        assert!((soc - 52.5).abs() < f32::EPSILON);
    }
}
