//! ELM327 client engine: initialization handshake, command transmission,
//! the adapter response tokenizer, the tester-present keep-alive, and the
//! thin UDS request/response facade built on top of it.
//!
//! Every public entry point that talks to the adapter goes through a single
//! command lock (spec'd serialization: `send_command`, `send_uds_message`,
//! and tester-present ticks never interleave bytes on the wire).

use hex::FromHexError;
use log::{debug, info, warn};
use obdbridge_connection::{ConnError, Connection, PROMPT_BYTE};
use obdbridge_isotp::{parse_isotp_frames, IsoTpError};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

/// Error kinds surfaced by the engine and UDS facade.
#[derive(Debug)]
pub enum DiagError {
    /// The underlying connection failed.
    Conn(ConnError),
    /// Malformed adapter output that the ISO-TP layer rejected.
    IsoTp(IsoTpError),
    /// Malformed adapter output caught before it reached ISO-TP (bad CAN ID
    /// hex, an `ATSH`/AT command that didn't answer `OK`, ...).
    Parse(String),
    /// The adapter reported one of the documented error tokens (`NO DATA`,
    /// `ERROR`, `?`, `STOPPED`, `UNABLE TO CONNECT`, `CAN ERROR`,
    /// `BUFFER FULL`, `<DATA ERROR...`).
    NoResponse(String),
    /// The ECU returned a UDS negative response; the NRC byte is preserved.
    NegativeResponse(u8),
    /// The service echo didn't match `request_service | 0x40`.
    Protocol { expected: u8, got: u8 },
    /// The operation was attempted before `initialize()`/`open()`.
    NotOpen,
}

impl fmt::Display for DiagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conn(e) => write!(f, "connection error: {e}"),
            Self::IsoTp(e) => write!(f, "ISO-TP error: {e}"),
            Self::Parse(s) => write!(f, "parse error: {s}"),
            Self::NoResponse(token) => write!(f, "adapter reported: {token}"),
            Self::NegativeResponse(nrc) => write!(f, "UDS negative response, NRC=0x{nrc:02X}"),
            Self::Protocol { expected, got } => {
                write!(f, "service echo mismatch: expected 0x{expected:02X}, got 0x{got:02X}")
            }
            Self::NotOpen => write!(f, "engine is not open"),
        }
    }
}

impl std::error::Error for DiagError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Conn(e) => Some(e),
            Self::IsoTp(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnError> for DiagError {
    fn from(e: ConnError) -> Self {
        Self::Conn(e)
    }
}

impl From<IsoTpError> for DiagError {
    fn from(e: IsoTpError) -> Self {
        Self::IsoTp(e)
    }
}

/// Error tokens the adapter emits in place of data. Any line that is
/// exactly one of these, or starts with `<DATA ERROR`, aborts the request.
const ERROR_TOKENS: &[&str] = &[
    "NO DATA",
    "ERROR",
    "?",
    "STOPPED",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUFFER FULL",
];

/// Informational tokens discarded when they stand alone on a line.
const INFO_TOKENS: &[&str] = &["SEARCHING...", "BUS INIT...", "OK"];

/// The parsed result of a UDS request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsResponse {
    pub service_echo: u8,
    pub data_identifier: Option<u16>,
    pub payload: Vec<u8>,
}

/// Mutable engine state guarded by the command lock.
struct EngineState<C> {
    conn: C,
    active_header: Option<u16>,
}

/// Handle to the background tester-present thread.
struct TesterPresentHandle {
    run_flag: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

/// Drives an ELM327-class adapter: init handshake, UDS requests, and an
/// optional tester-present keep-alive, all serialized through one lock.
pub struct Elm327Engine<C: Connection + 'static> {
    state: Arc<Mutex<EngineState<C>>>,
    command_timeout: Duration,
    tester_present: Mutex<Option<TesterPresentHandle>>,
    tester_present_failed: Arc<AtomicBool>,
}

impl<C: Connection + 'static> Elm327Engine<C> {
    /// Wrap a not-yet-open connection. `command_timeout` bounds every
    /// `read_until` this engine performs.
    pub fn new(conn: C, command_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                conn,
                active_header: None,
            })),
            command_timeout,
            tester_present: Mutex::new(None),
            tester_present_failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the connection and run the init handshake: `ATZ`, `ATE0`,
    /// `ATL0`, `ATS0`, `ATH1`, `ATSP0`, each verified non-error.
    pub fn initialize(&self) -> Result<(), DiagError> {
        let mut state = self.state.lock().expect("engine state mutex poisoned");
        state.conn.open()?;

        // ATZ's reset banner is neither `OK` nor an error token; its content
        // is deliberately ignored.
        send_raw(&mut state.conn, "ATZ", self.command_timeout)?;

        for cmd in ["ATE0", "ATL0", "ATS0", "ATH1", "ATSP0"] {
            let response = send_raw(&mut state.conn, cmd, self.command_timeout)?;
            check_no_error_token(&response)?;
        }
        info!("ELM327 adapter initialized");
        Ok(())
    }

    /// Send a raw AT/hex command and return the decoded response text
    /// (prompt and surrounding whitespace stripped).
    pub fn send_command(&self, cmd: &str) -> Result<String, DiagError> {
        let mut state = self.state.lock().expect("engine state mutex poisoned");
        self.warn_if_tester_present_failed();
        send_raw(&mut state.conn, cmd, self.command_timeout)
    }

    /// Issue a UDS request to `target_can_id` and return the reassembled,
    /// validated response.
    pub fn send_uds_message(
        &self,
        target_can_id: u16,
        service: u8,
        data: &[u8],
    ) -> Result<UdsResponse, DiagError> {
        let mut state = self.state.lock().expect("engine state mutex poisoned");
        self.warn_if_tester_present_failed();

        if state.active_header != Some(target_can_id) {
            let header_cmd = format!("ATSH{target_can_id:03X}");
            let response = send_raw(&mut state.conn, &header_cmd, self.command_timeout)?;
            check_no_error_token(&response)?;
            state.active_header = Some(target_can_id);
        }

        let mut command = SmallVec::<[u8; 16]>::new();
        command.push(service);
        command.extend_from_slice(data);
        let command_hex = hex::encode_upper(&command[..]);

        let response_text = send_raw(&mut state.conn, &command_hex, self.command_timeout)?;
        let frames = parse_response_text(&response_text)?;
        let payload = parse_isotp_frames(&frames)?;

        validate_and_build(service, &payload)
    }

    /// Start the tester-present keep-alive, sending `3E00` to the active
    /// header every `period`. A no-op if already running.
    pub fn start_tester_present(&self, period: Duration) -> Result<(), DiagError> {
        let mut handle_slot = self.tester_present.lock().expect("tester-present mutex poisoned");
        if handle_slot.is_some() {
            return Ok(());
        }

        let run_flag = Arc::new(AtomicBool::new(true));
        let thread_run_flag = Arc::clone(&run_flag);
        let thread_state = Arc::clone(&self.state);
        let thread_failed = Arc::clone(&self.tester_present_failed);
        let timeout = self.command_timeout;

        let handle = std::thread::spawn(move || {
            tester_present_loop(thread_state, thread_run_flag, thread_failed, period, timeout);
        });

        *handle_slot = Some(TesterPresentHandle { run_flag, handle });
        Ok(())
    }

    /// Stop the tester-present keep-alive. Synchronous: the background
    /// thread is joined before this returns.
    pub fn stop_tester_present(&self) {
        let mut handle_slot = self.tester_present.lock().expect("tester-present mutex poisoned");
        if let Some(handle) = handle_slot.take() {
            handle.run_flag.store(false, Ordering::SeqCst);
            let _ = handle.handle.join();
        }
    }

    fn warn_if_tester_present_failed(&self) {
        if self.tester_present_failed.swap(false, Ordering::SeqCst) {
            warn!("tester-present keep-alive stopped after a connection error");
        }
    }

    // -- UDS facade (C6) --

    /// `send_uds_message(target, 0x22, did.to_be_bytes())`, returning just
    /// the decoded payload (service echo and DID already stripped).
    pub fn read_data_by_identifier(&self, target_can_id: u16, did: u16) -> Result<Vec<u8>, DiagError> {
        let response = self.send_uds_message(target_can_id, 0x22, &did.to_be_bytes())?;
        Ok(response.payload)
    }
}

fn tester_present_loop<C: Connection>(
    state: Arc<Mutex<EngineState<C>>>,
    run_flag: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    period: Duration,
    command_timeout: Duration,
) {
    while run_flag.load(Ordering::SeqCst) {
        std::thread::sleep(period);
        if !run_flag.load(Ordering::SeqCst) {
            break;
        }

        match state.try_lock() {
            Ok(mut guard) => {
                if guard.active_header.is_none() {
                    continue;
                }
                match send_raw(&mut guard.conn, "3E00", command_timeout) {
                    Ok(_) => debug!("tester-present tick sent"),
                    Err(DiagError::Conn(e)) => {
                        warn!("tester-present stopping after connection error: {e}");
                        failed.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => debug!("tester-present tick got a non-fatal response: {e}"),
                }
            }
            Err(TryLockError::WouldBlock) => {
                debug!("tester-present tick skipped: command lock busy");
            }
            Err(TryLockError::Poisoned(_)) => break,
        }
    }
}

fn send_raw<C: Connection>(conn: &mut C, cmd: &str, timeout: Duration) -> Result<String, DiagError> {
    let mut wire: SmallVec<[u8; 32]> = SmallVec::from_slice(cmd.as_bytes());
    wire.push(b'\r');
    conn.write(&wire)?;

    let raw = conn.read_until(PROMPT_BYTE, timeout)?;
    let text = String::from_utf8_lossy(&raw);
    Ok(text.trim_end_matches(PROMPT_BYTE as char).trim().to_string())
}

fn check_no_error_token(response: &str) -> Result<(), DiagError> {
    for line in split_response_lines(response) {
        if ERROR_TOKENS.contains(&line) || line.starts_with("<DATA ERROR") {
            return Err(DiagError::NoResponse(line.to_string()));
        }
    }
    Ok(())
}

fn split_response_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty())
}

/// Tokenize adapter response text into per-frame hex strings (CAN ID
/// stripped), per spec 4.5.4.
fn parse_response_text(text: &str) -> Result<Vec<String>, DiagError> {
    let mut frames = Vec::new();

    for line in split_response_lines(text) {
        if INFO_TOKENS.contains(&line) {
            continue;
        }
        if ERROR_TOKENS.contains(&line) || line.starts_with("<DATA ERROR") {
            return Err(DiagError::NoResponse(line.to_string()));
        }

        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() < 3 {
            return Err(DiagError::Parse(format!("line too short to contain a CAN ID: {line:?}")));
        }
        let (can_id_hex, frame_hex) = compact.split_at(3);
        if let Err(FromHexError::InvalidHexCharacter { c, .. }) = hex_nibbles(can_id_hex) {
            return Err(DiagError::Parse(format!(
                "invalid CAN ID hex digit {c:?} in line {line:?}"
            )));
        }
        frames.push(frame_hex.to_string());
    }

    Ok(frames)
}

/// Validate that `can_id_hex`'s characters are all hex digits without
/// requiring an even length (a 3-digit CAN ID is odd-length hex).
fn hex_nibbles(s: &str) -> Result<(), FromHexError> {
    for c in s.chars() {
        if !c.is_ascii_hexdigit() {
            return Err(FromHexError::InvalidHexCharacter { c, index: 0 });
        }
    }
    Ok(())
}

fn validate_and_build(request_service: u8, payload: &[u8]) -> Result<UdsResponse, DiagError> {
    let &first = payload.first().ok_or_else(|| DiagError::Parse("empty UDS payload".to_string()))?;

    if first == 0x7F {
        let nrc = payload.get(2).copied().unwrap_or(0);
        return Err(DiagError::NegativeResponse(nrc));
    }

    let expected = request_service | 0x40;
    if first != expected {
        return Err(DiagError::Protocol {
            expected,
            got: first,
        });
    }

    let (data_identifier, rest_offset) = if matches!(request_service, 0x22) || matches!(first, 0x62) {
        let did = u16::from_be_bytes([
            payload.get(1).copied().unwrap_or(0),
            payload.get(2).copied().unwrap_or(0),
        ]);
        (Some(did), 3usize)
    } else {
        (None, 1usize)
    };

    Ok(UdsResponse {
        service_echo: first,
        data_identifier,
        payload: payload.get(rest_offset..).unwrap_or(&[]).to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use obdbridge_connection::{Matcher, MockConnection};

    fn engine_with(responses: Vec<(Matcher, Vec<u8>)>) -> Elm327Engine<MockConnection> {
        Elm327Engine::new(MockConnection::new(responses), Duration::from_millis(200))
    }

    #[test]
    fn s4_initialize_sends_exact_command_sequence() {
        let engine = engine_with(vec![
            (Matcher::Exact("ATZ".to_string()), b"ELM327 v1.5\r\r>".to_vec()),
            (Matcher::Exact("ATE0".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("ATL0".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("ATS0".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("ATH1".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("ATSP0".to_string()), b"OK\r\r>".to_vec()),
        ]);
        engine.initialize().unwrap();

        let state = engine.state.lock().unwrap();
        assert_eq!(
            state.conn.commands_seen(),
            ["ATZ", "ATE0", "ATL0", "ATS0", "ATH1", "ATSP0"]
        );
    }

    #[test]
    fn s1_single_frame_soc_request_with_spaced_response() {
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

        let engine = engine_with(vec![
            (Matcher::Exact("ATSH7E4".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("220101".to_string()), mock_response),
        ]);

        let response = engine.send_uds_message(0x7E4, 0x22, &[0x01, 0x01]).unwrap();
        assert_eq!(response.service_echo, 0x62);
        assert_eq!(response.data_identifier, Some(0x0101));
        assert_eq!(response.payload[4], 0x69);
    }

    #[test]
    fn s2_no_data_case() {
        let engine = engine_with(vec![
            (Matcher::Exact("ATSH7E4".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("220101".to_string()), b"SEARCHING...\rNO DATA\r>".to_vec()),
        ]);
        let err = engine.send_uds_message(0x7E4, 0x22, &[0x01, 0x01]).unwrap_err();
        assert!(matches!(err, DiagError::NoResponse(token) if token == "NO DATA"));
    }

    #[test]
    fn s3_compact_response() {
        // service 0x01 (show current data), no sub-parameter: echo is 0x41.
        let engine = engine_with(vec![
            (Matcher::Exact("ATSH7E0".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("01".to_string()), b"7EC06410D000000\r>".to_vec()),
        ]);
        let response = engine.send_uds_message(0x7E0, 0x01, &[]).unwrap();
        assert_eq!(response.service_echo, 0x41);
        assert_eq!(response.payload, hex::decode("0D000000").unwrap());
    }

    #[test]
    fn negative_response_preserves_nrc() {
        let engine = engine_with(vec![
            (Matcher::Exact("ATSH7E4".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("220101".to_string()), b"7EC037F2231\r>".to_vec()),
        ]);
        let err = engine.send_uds_message(0x7E4, 0x22, &[0x01, 0x01]).unwrap_err();
        assert!(matches!(err, DiagError::NegativeResponse(0x31)));
    }

    #[test]
    fn header_is_only_resent_when_it_changes() {
        let engine = engine_with(vec![
            (Matcher::Exact("ATSH7E4".to_string()), b"OK\r\r>".to_vec()),
            (Matcher::Exact("220101".to_string()), b"7EC0462010169\r>".to_vec()),
            (Matcher::Exact("220102".to_string()), b"7EC0462010269\r>".to_vec()),
        ]);
        engine.send_uds_message(0x7E4, 0x22, &[0x01, 0x01]).unwrap();
        engine.send_uds_message(0x7E4, 0x22, &[0x01, 0x02]).unwrap();

        let state = engine.state.lock().unwrap();
        let ath_count = state
            .conn
            .commands_seen()
            .iter()
            .filter(|c| c.starts_with("ATSH"))
            .count();
        assert_eq!(ath_count, 1);
    }

    #[test]
    fn dual_format_equivalence() {
        let spaced = "7EC 10 3E 62 01 01 EF FB E7 \r7EC 21 ED 69 00 00 00 00 00 \r>";
        let compact = "7EC103E620101EFFBE7\r7EC21ED690000000000\r>";
        assert_eq!(parse_response_text(spaced).unwrap(), parse_response_text(compact).unwrap());
    }
}
