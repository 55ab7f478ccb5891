use crate::{ConnError, Connection, PROMPT_BYTE};
use log::debug;
use std::collections::VecDeque;
use std::time::Duration;

/// How a scripted response is selected for an incoming command.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Match the command exactly (after stripping the trailing `\r`).
    Exact(String),
    /// Match any command starting with this prefix.
    Prefix(String),
}

impl Matcher {
    fn matches(&self, command: &str) -> bool {
        match self {
            Self::Exact(s) => s == command,
            Self::Prefix(s) => command.starts_with(s.as_str()),
        }
    }
}

/// Scripted in-memory [`Connection`] for tests.
///
/// Inverts `tachtalk`'s adapter-emulation `ClientState`: instead of a
/// process that answers any client over the wire, this is a table of
/// `(Matcher, response)` pairs handed to the code under test as if it were
/// a real dongle. The response bytes should already include ELM327-style
/// framing (trailing `\r` and the prompt byte) exactly as the real parser
/// expects to see it.
pub struct MockConnection {
    responses: Vec<(Matcher, Vec<u8>)>,
    default_response: Vec<u8>,
    pending: VecDeque<u8>,
    commands_seen: Vec<String>,
    open: bool,
}

impl MockConnection {
    /// Build a mock with the given response table, tried in order.
    #[must_use]
    pub fn new(responses: Vec<(Matcher, Vec<u8>)>) -> Self {
        Self {
            responses,
            default_response: b"NO DATA\r\r>".to_vec(),
            pending: VecDeque::new(),
            commands_seen: Vec::new(),
            open: false,
        }
    }

    /// Every command written so far, in order, with the trailing `\r`
    /// stripped — useful for asserting the init handshake sent the right
    /// sequence of AT commands.
    #[must_use]
    pub fn commands_seen(&self) -> &[String] {
        &self.commands_seen
    }
}

impl Connection for MockConnection {
    fn open(&mut self) -> Result<(), ConnError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnError> {
        self.open = false;
        self.pending.clear();
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ConnError> {
        if !self.open {
            return Err(ConnError::NotOpen);
        }
        let command = String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string();
        debug!("mock received command: {command:?}");
        self.commands_seen.push(command.clone());

        let response = self
            .responses
            .iter()
            .find(|(matcher, _)| matcher.matches(&command))
            .map_or(self.default_response.as_slice(), |(_, resp)| resp.as_slice());
        self.pending.extend(response.iter().copied());
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnError> {
        if !self.open {
            return Err(ConnError::NotOpen);
        }
        let take = n.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    fn read_until(&mut self, terminator: u8, _timeout: Duration) -> Result<Vec<u8>, ConnError> {
        if !self.open {
            return Err(ConnError::NotOpen);
        }
        let Some(pos) = self.pending.iter().position(|&b| b == terminator) else {
            return Err(ConnError::Timeout);
        };
        Ok(self.pending.drain(..=pos).collect())
    }

    fn flush_input(&mut self) -> Result<(), ConnError> {
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Default for MockConnection {
    /// A mock with no scripted responses; every command gets `NO DATA`.
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_exact_match() {
        let mut conn = MockConnection::new(vec![(
            Matcher::Exact("ATE0".to_string()),
            b"OK\r\r>".to_vec(),
        )]);
        conn.open().unwrap();
        conn.write(b"ATE0\r").unwrap();
        let resp = conn.read_until(PROMPT_BYTE, Duration::from_millis(10)).unwrap();
        assert_eq!(resp, b"OK\r\r>");
        assert_eq!(conn.commands_seen(), ["ATE0"]);
    }

    #[test]
    fn dispatches_prefix_match_for_uds_request() {
        let mut conn = MockConnection::new(vec![(
            Matcher::Prefix("0122".to_string()),
            b"7E4 03 62 22 01\r\r>".to_vec(),
        )]);
        conn.open().unwrap();
        conn.write(b"0122F100\r").unwrap();
        let resp = conn.read_until(PROMPT_BYTE, Duration::from_millis(10)).unwrap();
        assert_eq!(resp, b"7E4 03 62 22 01\r\r>");
    }

    #[test]
    fn unmatched_command_gets_no_data() {
        let mut conn = MockConnection::default();
        conn.open().unwrap();
        conn.write(b"0199\r").unwrap();
        let resp = conn.read_until(PROMPT_BYTE, Duration::from_millis(10)).unwrap();
        assert_eq!(resp, b"NO DATA\r\r>");
    }

    #[test]
    fn write_before_open_errors() {
        let mut conn = MockConnection::default();
        assert!(matches!(conn.write(b"ATZ\r"), Err(ConnError::NotOpen)));
    }

    #[test]
    fn flush_input_discards_pending_bytes() {
        let mut conn = MockConnection::new(vec![(
            Matcher::Exact("ATZ".to_string()),
            b"ELM327 v1.5\r\r>".to_vec(),
        )]);
        conn.open().unwrap();
        conn.write(b"ATZ\r").unwrap();
        conn.flush_input().unwrap();
        assert!(matches!(
            conn.read_until(PROMPT_BYTE, Duration::from_millis(10)),
            Err(ConnError::Timeout)
        ));
    }
}
