//! ISO 14443-A tag reader on an ST25R95-class NFC front-end over UART.
//!
//! Frame format host → front-end: `[cmd][len][payload...]`.
//! Response format: `[result][len][data...]`, except echo which answers with
//! the single byte 0x55. A result of 0x80 means "frame received OK".
//!
//! UID resolution runs up to three cascade levels of ANTICOLLISION + SELECT.
//! Per-attempt state lives in a [`TagSession`] and is dropped after every
//! attempt, so a failed read never leaks bytes into the next one.

use embedded_hal::delay::DelayNs;
use heapless::Vec;

use crate::serial::{poll_response, PollPolicy, SerialPort};

const CMD_ECHO: u8 = 0x55;
const CMD_PROTOCOL_SELECT: u8 = 0x02;
const CMD_SEND_RECV: u8 = 0x04;
const CMD_IDLE: u8 = 0x07;

const FRAME_RECV_OK: u8 = 0x80;
const PS_ISO_14443A: [u8; 4] = [CMD_PROTOCOL_SELECT, 0x02, 0x02, 0x00];
const REQA: [u8; 4] = [CMD_SEND_RECV, 0x02, 0x26, 0x07];

const CASCADE_LEVELS: [u8; 3] = [0x93, 0x95, 0x97];
const CASCADE_TAG: u8 = 0x88;
const SAK_CASCADE_BIT: u8 = 0x04;
/// SAK value reported when a SELECT exchange fails.
pub const SAK_FAIL: u8 = 0xFF;

/// Wake-up sources understood by the front-end idle command.
pub mod wake {
    pub const TIMEOUT: u8 = 0x01;
    pub const TAG_DETECT: u8 = 0x02;
    pub const IRQ_IN: u8 = 0x08;
    pub const SPI_SS: u8 = 0x10;
}

const DAC_GUARD: u8 = 0x08;
const CALIBRATION_MAX_DAC: u8 = 0xFC;
const CALIBRATION_ROUNDS: usize = 6;
const DAC_DATA_H_INDEX: usize = 13;

const FRAME_LEN: usize = 32;

/// Longest ISO 14443-A UID (triple size).
pub const MAX_UID_LEN: usize = 10;

/// Resolved tag UID bytes.
pub type TagUid = Vec<u8, MAX_UID_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    #[error("serial transfer failed")]
    Io,
    #[error("no response from the NFC front-end")]
    NoResponse,
    #[error("unexpected frame (result 0x{result:02X}, {len} bytes)")]
    BadFrame { result: u8, len: usize },
    #[error("anticollision failed at cascade level {0}")]
    Anticollision(usize),
    #[error("BCC mismatch at cascade level {0}")]
    BccMismatch(usize),
    #[error("select failed at cascade level {0}")]
    Select(usize),
    #[error("UID does not fit in {MAX_UID_LEN} bytes")]
    UidOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationError {
    #[error("serial transfer failed")]
    Io,
    #[error("DAC high 0x00 did not report tag detect (wake {0:?})")]
    TagProbe(Option<u8>),
    #[error("DAC high 0xFC did not report timeout (wake {0:?})")]
    TimeoutProbe(Option<u8>),
}

/// UID size class announced by the ATQA (top two bits of its first byte).
pub fn uid_len_from_atqa(atqa0: u8) -> Option<usize> {
    match atqa0 >> 6 {
        0 => Some(4),
        1 => Some(7),
        2 => Some(10),
        _ => None,
    }
}

/// Accumulated state of one UID resolution attempt.
#[derive(Debug, Default)]
struct TagSession {
    uid: TagUid,
    /// Last anticollision answer: 4 UID/CT bytes + BCC, echoed in SELECT.
    pending: [u8; 5],
    sak: u8,
}

impl TagSession {
    fn new() -> Self {
        Self {
            sak: SAK_CASCADE_BIT,
            ..Default::default()
        }
    }

    fn needs_level(&self) -> bool {
        self.sak & SAK_CASCADE_BIT != 0
    }

    fn absorb(&mut self, level: usize, data: &[u8]) -> Result<(), TagError> {
        self.pending.copy_from_slice(&data[..5]);
        let bcc = data[..4].iter().fold(0u8, |acc, b| acc ^ b);
        if bcc != data[4] {
            return Err(TagError::BccMismatch(level));
        }
        let part = if data[0] == CASCADE_TAG { &data[1..4] } else { &data[..4] };
        self.uid.extend_from_slice(part).map_err(|_| TagError::UidOverflow)
    }
}

/// Driver for the NFC front-end.
pub struct TagReader<T: SerialPort, D: DelayNs> {
    port: T,
    delay: D,
    poll: PollPolicy,
    probe_poll: PollPolicy,
    dac_data_ref: u8,
    announced_len: Option<usize>,
    uid: TagUid,
}

impl<T: SerialPort, D: DelayNs> TagReader<T, D> {
    pub fn new(port: T, delay: D, poll: PollPolicy, probe_poll: PollPolicy) -> Self {
        Self {
            port,
            delay,
            poll,
            probe_poll,
            dac_data_ref: 0,
            announced_len: None,
            uid: TagUid::new(),
        }
    }

    /// Calibrated DAC reference used by the idle tag detector.
    pub fn dac_data_ref(&self) -> u8 {
        self.dac_data_ref
    }

    pub fn set_dac_data_ref(&mut self, value: u8) {
        self.dac_data_ref = value;
    }

    /// UID from the last successful [`get_tag_uid`](Self::get_tag_uid).
    pub fn uid(&self) -> &TagUid {
        &self.uid
    }

    /// UID length announced by the last REQA answer.
    pub fn announced_uid_len(&self) -> Option<usize> {
        self.announced_len
    }

    pub fn port_mut(&mut self) -> &mut T {
        &mut self.port
    }

    pub fn release(self) -> (T, D) {
        (self.port, self.delay)
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TagError> {
        self.port.discard_input().map_err(|e| {
            log::error!("nfc: failed to flush input: {:?}", e);
            TagError::Io
        })?;
        self.port.write_all(frame).map_err(|e| {
            log::error!("nfc: write failed: {:?}", e);
            TagError::Io
        })
    }

    /// Wait for a response and keep reading until the length byte is satisfied.
    fn receive(&mut self, policy: PollPolicy, buf: &mut [u8; FRAME_LEN]) -> Result<usize, TagError> {
        let mut len = poll_response(&mut self.port, &mut self.delay, policy, buf).map_err(|e| {
            log::error!("nfc: read failed: {:?}", e);
            TagError::Io
        })?;
        if len >= 2 && buf[0] != CMD_ECHO {
            let expected = (2 + buf[1] as usize).min(FRAME_LEN);
            while len < expected {
                let more = poll_response(&mut self.port, &mut self.delay, policy, &mut buf[len..expected])
                    .map_err(|_| TagError::Io)?;
                if more == 0 {
                    break;
                }
                len += more;
            }
        }
        log::debug!("nfc: rx {:02X?}", &buf[..len]);
        Ok(len)
    }

    fn exchange(
        &mut self,
        frame: &[u8],
        policy: PollPolicy,
        buf: &mut [u8; FRAME_LEN],
    ) -> Result<usize, TagError> {
        self.send(frame)?;
        self.receive(policy, buf)
    }

    /// Liveness check: the front-end must echo 0x55 back.
    pub fn echo(&mut self) -> Result<(), TagError> {
        let mut rx = [0u8; FRAME_LEN];
        let len = self.exchange(&[CMD_ECHO], self.poll, &mut rx)?;
        if len > 0 && rx[0] == CMD_ECHO {
            log::info!("nfc: front-end answered echo");
            Ok(())
        } else if len == 0 {
            log::error!("nfc: no echo from front-end");
            Err(TagError::NoResponse)
        } else {
            log::error!("nfc: bad echo 0x{:02X}", rx[0]);
            Err(TagError::BadFrame { result: rx[0], len })
        }
    }

    /// Select the ISO 14443-A protocol (field on).
    pub fn set_iso_14443a(&mut self) -> Result<(), TagError> {
        let mut rx = [0u8; FRAME_LEN];
        let len = self.exchange(&PS_ISO_14443A, self.poll, &mut rx)?;
        if len == 2 && rx[0] == 0x00 {
            log::debug!("nfc: protocol ISO 14443-A selected");
            Ok(())
        } else {
            log::error!("nfc: protocol select failed ({} bytes)", len);
            Err(TagError::BadFrame { result: rx[0], len })
        }
    }

    /// Probe for a tag in the field with REQA.
    ///
    /// Failures are logged and reported as `false`.
    pub fn is_tag_available(&mut self) -> bool {
        self.announced_len = None;
        if self.set_iso_14443a().is_err() {
            return false;
        }
        let mut rx = [0u8; FRAME_LEN];
        let len = match self.exchange(&REQA, self.probe_poll, &mut rx) {
            Ok(len) => len,
            Err(_) => return false,
        };
        if len > 2 && rx[0] == FRAME_RECV_OK && rx[1] == 0x05 {
            self.announced_len = uid_len_from_atqa(rx[2]);
            if self.announced_len.is_none() {
                log::warn!("nfc: invalid UID size coding in ATQA 0x{:02X}", rx[2]);
            }
            true
        } else {
            false
        }
    }

    fn anticollision(&mut self, level: usize, session: &mut TagSession) -> Result<(), TagError> {
        let frame = [CMD_SEND_RECV, 0x03, CASCADE_LEVELS[level], 0x20, 0x08];
        let mut rx = [0u8; FRAME_LEN];
        let len = self.exchange(&frame, self.poll, &mut rx)?;
        if len < 7 || rx[0] != FRAME_RECV_OK {
            log::error!("nfc: anticollision level {} failed ({} bytes)", level + 1, len);
            return Err(TagError::Anticollision(level));
        }
        session.absorb(level, &rx[2..7])
    }

    fn select(&mut self, level: usize, session: &TagSession) -> u8 {
        let mut frame = [0u8; 10];
        frame[..4].copy_from_slice(&[CMD_SEND_RECV, 0x08, CASCADE_LEVELS[level], 0x70]);
        frame[4..9].copy_from_slice(&session.pending);
        frame[9] = 0x28;
        let mut rx = [0u8; FRAME_LEN];
        match self.exchange(&frame, self.poll, &mut rx) {
            Ok(len) if len >= 3 && rx[0] == FRAME_RECV_OK => rx[2],
            _ => SAK_FAIL,
        }
    }

    /// Run anticollision/select over the cascade levels and return the UID.
    pub fn read_uid(&mut self) -> Result<TagUid, TagError> {
        let mut session = TagSession::new();
        for level in 0..CASCADE_LEVELS.len() {
            if !session.needs_level() {
                break;
            }
            self.anticollision(level, &mut session)?;
            session.sak = self.select(level, &session);
            if session.sak == SAK_FAIL {
                log::error!("nfc: select failed at level {}", level + 1);
                return Err(TagError::Select(level));
            }
        }
        if let Some(announced) = self.announced_len {
            if announced != session.uid.len() {
                log::warn!(
                    "nfc: ATQA announced {} byte UID, resolved {}",
                    announced,
                    session.uid.len()
                );
            }
        }
        Ok(session.uid)
    }

    /// Resolve the UID of the tag found by [`is_tag_available`](Self::is_tag_available).
    ///
    /// Returns the UID length, 0 on failure.
    pub fn get_tag_uid(&mut self) -> usize {
        self.uid.clear();
        match self.read_uid() {
            Ok(uid) => {
                log::info!("nfc: tag UID {:02X?}", uid.as_slice());
                self.uid = uid;
                self.uid.len()
            }
            Err(e) => {
                log::error!("nfc: {}", e);
                0
            }
        }
    }

    fn idle_command(wake_sources: u8, enter: [u8; 2], wake_ctrl: [u8; 2], dac: [u8; 2], max_sleep: u8) -> [u8; 16] {
        [
            CMD_IDLE, 0x0E, wake_sources, enter[0], enter[1], wake_ctrl[0], wake_ctrl[1], 0x18,
            0x00, 0x20, 0x60, 0x60, dac[0], dac[1], 0x3F, max_sleep,
        ]
    }

    /// Put the front-end in low-power tag detection around the calibrated reference.
    pub fn idle_tag_detector(&mut self, wake_sources: u8) -> Result<(), TagError> {
        let dac = [
            self.dac_data_ref.saturating_sub(DAC_GUARD),
            self.dac_data_ref.saturating_add(DAC_GUARD),
        ];
        let cmd = Self::idle_command(wake_sources, [0x21, 0x00], [0x79, 0x01], dac, 0x08);
        self.send(&cmd)?;
        log::info!("nfc: idle tag detector armed (ref 0x{:02X})", self.dac_data_ref);
        Ok(())
    }

    fn wake_response(&mut self, cmd: &[u8; 16]) -> Result<Option<u8>, CalibrationError> {
        let mut rx = [0u8; FRAME_LEN];
        let len = self.exchange(cmd, self.poll, &mut rx).map_err(|_| CalibrationError::Io)?;
        if len != 3 {
            log::error!("nfc: idle response should have 3 bytes, got {}", len);
            return Ok(None);
        }
        Ok(Some(rx[2]))
    }

    /// Find the DAC reference separating "tag" from "no tag" with no tag in
    /// the field, and store it for [`idle_tag_detector`](Self::idle_tag_detector).
    pub fn tag_detection_calibration(&mut self) -> Result<u8, CalibrationError> {
        let mut cmd = Self::idle_command(
            wake::TAG_DETECT | wake::TIMEOUT,
            [0xA1, 0x00],
            [0xF8, 0x01],
            [0x00, CALIBRATION_MAX_DAC],
            0x01,
        );
        log::info!("nfc: tag detection calibration");

        cmd[DAC_DATA_H_INDEX] = 0x00;
        let wake = self.wake_response(&cmd)?;
        if wake != Some(wake::TAG_DETECT) {
            return Err(CalibrationError::TagProbe(wake));
        }

        cmd[DAC_DATA_H_INDEX] = CALIBRATION_MAX_DAC;
        let mut wake = self.wake_response(&cmd)?;
        if wake != Some(wake::TIMEOUT) {
            return Err(CalibrationError::TimeoutProbe(wake));
        }

        let mut step: u8 = 0x80;
        for _ in 0..CALIBRATION_ROUNDS {
            let h = cmd[DAC_DATA_H_INDEX];
            cmd[DAC_DATA_H_INDEX] = match wake {
                Some(wake::TIMEOUT) => h.wrapping_sub(step),
                Some(wake::TAG_DETECT) => h.wrapping_add(step),
                other => {
                    log::error!("nfc: invalid wake source {:?}", other);
                    h
                }
            };
            log::debug!("nfc: DacDataH 0x{:02X}", cmd[DAC_DATA_H_INDEX]);
            wake = self.wake_response(&cmd)?;
            step /= 2;
        }

        let h = cmd[DAC_DATA_H_INDEX];
        self.dac_data_ref = if wake == Some(wake::TIMEOUT) { h.wrapping_sub(0x04) } else { h };
        log::info!("nfc: calibration done, DacDataRef 0x{:02X}", self.dac_data_ref);
        Ok(self.dac_data_ref)
    }
}
