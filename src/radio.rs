//! Long-range radio link used to sync scan history.
//!
//! The state machine needs only `transmit(payload) -> ack/fail` and
//! `receive() -> payload`. [`Rak3172`] implements that on a RAK3172 LoRaWAN
//! module driven with AT commands over UART; join and key provisioning happen
//! on the module itself (auto-join) and are out of scope here.
//!
//! Uplink payload: `[count: u8]` followed by `count` history blocks, each the
//! identifier padded to the log's uid size plus a 4-byte LE timestamp.

use core::fmt::Write;

use embedded_hal::delay::DelayNs;
use heapless::{String, Vec};

use crate::history::HistoryEntry;
use crate::serial::SerialPort;

/// Largest uplink payload (smallest EU868 data rate that still fits a few blocks).
pub const MAX_UPLINK_LEN: usize = 48;
/// Largest downlink payload kept.
pub const MAX_DOWNLINK_LEN: usize = 64;

const LINE_LEN: usize = 160;
const POLL_INTERVAL_MS: u32 = 10;

pub type Uplink = Vec<u8, MAX_UPLINK_LEN>;
pub type Downlink = Vec<u8, MAX_DOWNLINK_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("serial transfer failed")]
    Io,
    #[error("radio did not answer in time")]
    Timeout,
    #[error("not joined to a network")]
    NotJoined,
    #[error("radio is busy")]
    Busy,
    #[error("radio rejected the command")]
    Rejected,
    #[error("uplink was not acknowledged")]
    NotAcknowledged,
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
}

/// Radio link as seen by the state machine.
pub trait Radio {
    /// Send one uplink and wait for the network acknowledgement.
    fn transmit(&mut self, payload: &[u8]) -> Result<(), RadioError>;

    /// Return a pending downlink, if one arrived.
    fn receive(&mut self) -> Result<Option<Downlink>, RadioError>;
}

/// How many history blocks of `block_size` bytes fit in one uplink.
pub const fn entries_per_uplink(block_size: usize) -> usize {
    if block_size == 0 {
        0
    } else {
        (MAX_UPLINK_LEN - 1) / block_size
    }
}

/// Pack history entries into one uplink. Entries that do not fit are left out;
/// the caller commits only the returned count.
pub fn pack_history(entries: &[HistoryEntry], uid_size: usize) -> (Uplink, usize) {
    let count = entries.len().min(entries_per_uplink(uid_size + 4)).min(u8::MAX as usize);
    let mut payload = Uplink::new();
    // Sized by entries_per_uplink so every push below fits.
    let _ = payload.push(count as u8);
    for entry in &entries[..count] {
        let id = &entry.identifier[..entry.identifier.len().min(uid_size)];
        let _ = payload.extend_from_slice(id);
        for _ in id.len()..uid_size {
            let _ = payload.push(0);
        }
        let _ = payload.extend_from_slice(&entry.timestamp.to_le_bytes());
    }
    (payload, count)
}

/// RAK3172 timing and addressing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RakSettings {
    /// LoRaWAN application port for history uplinks.
    pub port: u8,
    /// Wait for the "OK" of an AT command.
    pub command_timeout_ms: u32,
    /// Total wait for the confirmed-uplink event after `AT+SEND`. Together
    /// with `command_timeout_ms` this must stay below the watchdog period.
    pub ack_timeout_ms: u32,
    /// Listen window of one `receive` call.
    pub receive_timeout_ms: u32,
}

impl Default for RakSettings {
    fn default() -> Self {
        Self {
            port: 1,
            command_timeout_ms: 1_000,
            ack_timeout_ms: 20_000,
            receive_timeout_ms: 100,
        }
    }
}

/// RAK3172 AT command driver.
pub struct Rak3172<P: SerialPort, D: DelayNs> {
    port: P,
    delay: D,
    settings: RakSettings,
    line: Vec<u8, LINE_LEN>,
    downlink: Option<Downlink>,
}

impl<P: SerialPort, D: DelayNs> Rak3172<P, D> {
    pub fn new(port: P, delay: D, settings: RakSettings) -> Self {
        Self {
            port,
            delay,
            settings,
            line: Vec::new(),
            downlink: None,
        }
    }

    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Read one `\r\n` terminated line, or `None` once `budget_ms` is spent.
    ///
    /// Time spent waiting is deducted from `budget_ms`, so a caller reading
    /// several lines is bounded by one overall deadline.
    fn read_line(&mut self, budget_ms: &mut u32) -> Result<Option<String<LINE_LEN>>, RadioError> {
        let mut byte = [0u8; 1];
        loop {
            match self.port.read_available(&mut byte) {
                Ok(0) => {
                    if *budget_ms == 0 {
                        return Ok(None);
                    }
                    let step = POLL_INTERVAL_MS.min(*budget_ms);
                    self.delay.delay_ms(step);
                    *budget_ms -= step;
                }
                Ok(_) => match byte[0] {
                    b'\r' => {}
                    b'\n' => {
                        if self.line.is_empty() {
                            continue;
                        }
                        let line = core::mem::take(&mut self.line);
                        match String::from_utf8(line) {
                            Ok(text) => {
                                log::debug!("radio: < {}", text.as_str());
                                return Ok(Some(text));
                            }
                            Err(_) => log::warn!("radio: dropped non-UTF-8 line"),
                        }
                    }
                    b => {
                        if self.line.push(b).is_err() {
                            log::warn!("radio: line overflow, dropping");
                            self.line.clear();
                        }
                    }
                },
                Err(e) => {
                    log::error!("radio: read failed: {:?}", e);
                    return Err(RadioError::Io);
                }
            }
        }
    }

    /// Keep a downlink event if `line` carries one.
    fn capture_downlink(&mut self, line: &str) -> bool {
        match parse_downlink(line) {
            Some(payload) => {
                log::info!("radio: downlink of {} bytes", payload.len());
                self.downlink = Some(payload);
                true
            }
            None => false,
        }
    }

    /// Send an AT command and wait for its final status line.
    pub fn command(&mut self, cmd: &str) -> Result<(), RadioError> {
        log::debug!("radio: > {}", cmd);
        self.port
            .write_all(cmd.as_bytes())
            .and_then(|_| self.port.write_all(b"\r\n"))
            .map_err(|e| {
                log::error!("radio: write failed: {:?}", e);
                RadioError::Io
            })?;
        let mut budget = self.settings.command_timeout_ms;
        loop {
            let Some(line) = self.read_line(&mut budget)? else {
                return Err(RadioError::Timeout);
            };
            match line.as_str() {
                "OK" => return Ok(()),
                "AT_BUSY_ERROR" => return Err(RadioError::Busy),
                "AT_NO_NETWORK_JOINED" => return Err(RadioError::NotJoined),
                s if s.starts_with("AT_") && s.ends_with("ERROR") => return Err(RadioError::Rejected),
                s => {
                    self.capture_downlink(s);
                }
            }
        }
    }

    /// Ask the module whether it joined the network.
    pub fn is_joined(&mut self) -> Result<bool, RadioError> {
        self.port.write_all(b"AT+NJS=?\r\n").map_err(|_| RadioError::Io)?;
        let mut joined = false;
        let mut budget = self.settings.command_timeout_ms;
        loop {
            let Some(line) = self.read_line(&mut budget)? else {
                return Err(RadioError::Timeout);
            };
            match line.as_str() {
                "OK" => return Ok(joined),
                "1" | "AT+NJS=1" => joined = true,
                "0" | "AT+NJS=0" => joined = false,
                s if s.starts_with("AT_") => return Err(RadioError::Rejected),
                _ => {}
            }
        }
    }
}

impl<P: SerialPort, D: DelayNs> Radio for Rak3172<P, D> {
    fn transmit(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        if payload.len() > MAX_UPLINK_LEN {
            return Err(RadioError::PayloadTooLarge(payload.len()));
        }
        let too_large = || RadioError::PayloadTooLarge(payload.len());
        let mut hex_buf = [0u8; 2 * MAX_UPLINK_LEN];
        let hex_payload = &mut hex_buf[..2 * payload.len()];
        hex::encode_to_slice(payload, hex_payload).map_err(|_| too_large())?;
        hex_payload.make_ascii_uppercase();
        let hex_payload = core::str::from_utf8(hex_payload).map_err(|_| too_large())?;

        let mut cmd: String<{ 16 + 2 * MAX_UPLINK_LEN }> = String::new();
        write!(cmd, "AT+SEND={}:{}", self.settings.port, hex_payload).map_err(|_| too_large())?;
        self.command(&cmd)?;

        let mut budget = self.settings.ack_timeout_ms;
        loop {
            let Some(line) = self.read_line(&mut budget)? else {
                log::warn!("radio: no confirmation for uplink");
                return Err(RadioError::Timeout);
            };
            match line.as_str() {
                "+EVT:SEND_CONFIRMED_OK" | "+EVT:SEND CONFIRMED OK" => return Ok(()),
                "+EVT:SEND_CONFIRMED_FAILED" | "+EVT:SEND CONFIRMED FAILED" => {
                    return Err(RadioError::NotAcknowledged)
                }
                s => {
                    self.capture_downlink(s);
                }
            }
        }
    }

    fn receive(&mut self) -> Result<Option<Downlink>, RadioError> {
        if let Some(payload) = self.downlink.take() {
            return Ok(Some(payload));
        }
        let mut budget = self.settings.receive_timeout_ms;
        while let Some(line) = self.read_line(&mut budget)? {
            if self.capture_downlink(&line) {
                return Ok(self.downlink.take());
            }
        }
        Ok(None)
    }
}

/// Parse a downlink event line (`+EVT:<port>:<hex>` or
/// `+EVT:RX_1:<rssi>:<snr>:UNICAST:<port>:<hex>`).
pub fn parse_downlink(line: &str) -> Option<Downlink> {
    let body = line.strip_prefix("+EVT:")?;
    let (head, digits) = body.rsplit_once(':')?;
    let port = head.rsplit(':').next()?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.is_empty() || digits.len() % 2 != 0 || digits.len() > 2 * MAX_DOWNLINK_LEN {
        return None;
    }
    let mut buf = [0u8; MAX_DOWNLINK_LEN];
    let out = &mut buf[..digits.len() / 2];
    hex::decode_to_slice(digits, out).ok()?;
    Downlink::from_slice(out).ok()
}
