//! Test doubles shared by the integration tests: NOR flash with real erase /
//! program semantics, scripted serial ports, a register-map I2C device, an
//! NFC front-end simulator and a board with a virtual millisecond clock.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ops::Range;
use std::rc::Rc;

use access_terminal::cipher::{BLOCK_SIZE, KEY_LEN};
use access_terminal::radio::{Downlink, Radio, RadioError};
use access_terminal::scanner::{CodeScanner, SymbolText};
use access_terminal::storage::FlashLayout;
use access_terminal::{Board, Indicator, SerialPort, WakeCause};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{self, ErrorKind, NoAcknowledgeSource, Operation};
use embedded_storage_async::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

// ============================================================================
// Flash
// ============================================================================

pub const PAGE: u32 = 4096;

/// Small layout used by the host tests.
pub fn test_layout() -> FlashLayout {
    FlashLayout {
        auth: 0..4 * PAGE,
        history_control: 4 * PAGE..8 * PAGE,
        history_data: 8 * PAGE..16 * PAGE,
    }
}

/// In-memory NOR flash: erase sets 0xFF, programming can only clear bits.
#[derive(Clone)]
pub struct MemFlash {
    pub data: Vec<u8>,
    pub writes: usize,
    pub erases: usize,
}

impl MemFlash {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
            writes: 0,
            erases: 0,
        }
    }

    /// Flash sized for [`test_layout`].
    pub fn for_tests() -> Self {
        Self::new(16 * PAGE as usize)
    }

    /// Program bytes directly, bypassing the stores (NOR AND semantics).
    pub fn program(&mut self, offset: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.data[offset as usize + i] &= b;
        }
    }

    /// Reset `range` to the erased state, bypassing the stores.
    pub fn blank(&mut self, range: Range<u32>) {
        self.data[range.start as usize..range.end as usize].fill(0xFF);
    }

    /// Program every byte of `range` to zero, which no store accepts as valid.
    pub fn zero(&mut self, range: Range<u32>) {
        self.data[range.start as usize..range.end as usize].fill(0x00);
    }

    pub fn is_blank(&self, range: Range<u32>) -> bool {
        self.data[range.start as usize..range.end as usize].iter().all(|&b| b == 0xFF)
    }
}

impl ErrorType for MemFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        bytes.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = PAGE as usize;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % PAGE != 0 || to % PAGE != 0 || from > to {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if to as usize > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.data[from as usize..to as usize].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if offset as usize + bytes.len() > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.program(offset, bytes);
        self.writes += 1;
        Ok(())
    }
}

// ============================================================================
// Clock and delay
// ============================================================================

/// Shared virtual clock in milliseconds.
pub type Clock = Rc<Cell<u64>>;

#[derive(Clone)]
pub struct FakeDelay {
    pub clock: Clock,
}

impl FakeDelay {
    pub fn new(clock: Clock) -> Self {
        Self { clock }
    }

    pub fn standalone() -> Self {
        Self::new(Rc::new(Cell::new(0)))
    }
}

impl DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.clock.set(self.clock.get() + (ns as u64).div_ceil(1_000_000));
    }

    fn delay_us(&mut self, us: u32) {
        self.clock.set(self.clock.get() + (us as u64).div_ceil(1_000));
    }

    fn delay_ms(&mut self, ms: u32) {
        self.clock.set(self.clock.get() + ms as u64);
    }
}

// ============================================================================
// Serial
// ============================================================================

pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>>>;

pub struct SerialState {
    pub rx: VecDeque<u8>,
    pub sent: Vec<Vec<u8>>,
    responder: Option<Responder>,
    /// Max bytes handed out per read, to exercise split frames.
    pub chunk: usize,
}

/// Serial port handle; clones share the same state.
#[derive(Clone)]
pub struct FakeSerial(pub Rc<RefCell<SerialState>>);

impl FakeSerial {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SerialState {
            rx: VecDeque::new(),
            sent: Vec::new(),
            responder: None,
            chunk: usize::MAX,
        })))
    }

    /// Port whose peer answers each write through `responder`.
    pub fn with_responder(responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + 'static) -> Self {
        let port = Self::new();
        port.0.borrow_mut().responder = Some(Box::new(responder));
        port
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.extend(bytes.iter().copied());
    }

    pub fn set_chunk(&self, chunk: usize) {
        self.0.borrow_mut().chunk = chunk;
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.borrow().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.0.borrow_mut().sent.clear();
    }
}

impl SerialPort for FakeSerial {
    type Error = ();

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ()> {
        let mut state = self.0.borrow_mut();
        state.sent.push(bytes.to_vec());
        let reply = state.responder.as_mut().and_then(|r| r(bytes));
        if let Some(reply) = reply {
            state.rx.extend(reply);
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ()> {
        let mut state = self.0.borrow_mut();
        let n = buf.len().min(state.rx.len()).min(state.chunk);
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

// ============================================================================
// NFC front-end simulator
// ============================================================================

pub const WAKE_TIMEOUT: u8 = 0x01;
pub const WAKE_TAG: u8 = 0x02;

/// Behaviour of the simulated NFC front-end.
#[derive(Clone, Debug)]
pub struct FrontEnd {
    /// UID of the tag in the field, if any.
    pub tag: Option<Vec<u8>>,
    /// Calibration reports tag detect while DacDataH is below this value.
    pub detect_below: u8,
    /// Corrupt the BCC of every anticollision answer.
    pub bad_bcc: bool,
    /// Answer SELECT with an error result.
    pub fail_select: bool,
}

impl Default for FrontEnd {
    fn default() -> Self {
        Self {
            tag: None,
            detect_below: 0x60,
            bad_bcc: false,
            fail_select: false,
        }
    }
}

fn cascade_parts(uid: &[u8]) -> Vec<[u8; 4]> {
    match uid.len() {
        4 => vec![[uid[0], uid[1], uid[2], uid[3]]],
        7 => vec![[0x88, uid[0], uid[1], uid[2]], [uid[3], uid[4], uid[5], uid[6]]],
        10 => vec![
            [0x88, uid[0], uid[1], uid[2]],
            [0x88, uid[3], uid[4], uid[5]],
            [uid[6], uid[7], uid[8], uid[9]],
        ],
        n => panic!("unsupported UID length {n}"),
    }
}

fn level_index(cl: u8) -> usize {
    match cl {
        0x93 => 0,
        0x95 => 1,
        0x97 => 2,
        other => panic!("bad cascade level 0x{other:02X}"),
    }
}

impl FrontEnd {
    pub fn with_tag(uid: &[u8]) -> Self {
        Self {
            tag: Some(uid.to_vec()),
            ..Self::default()
        }
    }

    pub fn respond(&self, cmd: &[u8]) -> Option<Vec<u8>> {
        match cmd {
            [0x55] => Some(vec![0x55]),
            [0x02, 0x02, 0x02, 0x00] => Some(vec![0x00, 0x00]),
            [0x04, 0x02, 0x26, 0x07] => match &self.tag {
                Some(uid) => {
                    let class = match uid.len() {
                        4 => 0,
                        7 => 1,
                        _ => 2,
                    };
                    Some(vec![0x80, 0x05, (class << 6) | 0x04, 0x00, 0x28, 0x00, 0x00])
                }
                None => Some(vec![0x87, 0x00]),
            },
            [0x04, 0x03, cl, 0x20, 0x08] => {
                let uid = self.tag.as_ref()?;
                let part = cascade_parts(uid)[level_index(*cl)];
                let mut bcc = part.iter().fold(0u8, |a, b| a ^ b);
                if self.bad_bcc {
                    bcc ^= 0xFF;
                }
                let mut frame = vec![0x80, 0x08];
                frame.extend_from_slice(&part);
                frame.extend_from_slice(&[bcc, 0x28, 0x00, 0x00]);
                Some(frame)
            }
            [0x04, 0x08, cl, 0x70, ..] => {
                if self.fail_select {
                    return Some(vec![0x86, 0x01, 0x00]);
                }
                let uid = self.tag.as_ref()?;
                let levels = cascade_parts(uid).len();
                let sak = if level_index(*cl) + 1 < levels { 0x04 } else { 0x08 };
                Some(vec![0x80, 0x04, sak, 0x00, 0x00, 0x08])
            }
            [0x07, 0x0E, _, 0xA1, ..] => {
                let wake = if cmd[13] < self.detect_below { WAKE_TAG } else { WAKE_TIMEOUT };
                Some(vec![0x00, 0x01, wake])
            }
            [0x07, 0x0E, ..] => None,
            _ => None,
        }
    }

    /// Serial port wired to this simulated front-end.
    pub fn port(self) -> FakeSerial {
        FakeSerial::with_responder(move |cmd| self.respond(cmd))
    }
}

// ============================================================================
// I2C
// ============================================================================

pub const LIGHT_ADDR: u8 = 0x52;
pub const REG_MAIN_STATUS: u8 = 0x07;

pub struct I2cState {
    pub regs: [u8; 256],
    pub pointer: u8,
    pub fail: bool,
}

/// Register-map I2C device. MAIN_STATUS clears on read like the real part.
#[derive(Clone)]
pub struct FakeI2c(pub Rc<RefCell<I2cState>>);

impl FakeI2c {
    pub fn new() -> Self {
        let mut regs = [0u8; 256];
        regs[0x06] = 0xC2;
        Self(Rc::new(RefCell::new(I2cState {
            regs,
            pointer: 0,
            fail: false,
        })))
    }

    pub fn reg(&self, reg: u8) -> u8 {
        self.0.borrow().regs[reg as usize]
    }

    pub fn set_reg(&self, reg: u8, value: u8) {
        self.0.borrow_mut().regs[reg as usize] = value;
    }

    pub fn raise_light_interrupt(&self) {
        self.set_reg(REG_MAIN_STATUS, 0x10);
    }
}

impl i2c::ErrorType for FakeI2c {
    type Error = ErrorKind;
}

impl i2c::I2c for FakeI2c {
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), ErrorKind> {
        let mut state = self.0.borrow_mut();
        if state.fail || address != LIGHT_ADDR {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => {
                    if let Some((&reg, values)) = bytes.split_first() {
                        state.pointer = reg;
                        for &v in values {
                            let p = state.pointer as usize;
                            state.regs[p] = v;
                            state.pointer = state.pointer.wrapping_add(1);
                        }
                    }
                }
                Operation::Read(buf) => {
                    for slot in buf.iter_mut() {
                        let p = state.pointer as usize;
                        *slot = state.regs[p];
                        if p == REG_MAIN_STATUS as usize {
                            state.regs[p] = 0;
                        }
                        state.pointer = state.pointer.wrapping_add(1);
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Scanner and radio
// ============================================================================

/// Scanner returning one queued symbol per frame, `None` once the queue is empty.
#[derive(Clone)]
pub struct FakeScanner(pub Rc<RefCell<VecDeque<Option<String>>>>);

impl FakeScanner {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(VecDeque::new())))
    }

    pub fn push(&self, symbol: &str) {
        self.0.borrow_mut().push_back(Some(symbol.to_string()));
    }

    pub fn push_blank_frames(&self, n: usize) {
        for _ in 0..n {
            self.0.borrow_mut().push_back(None);
        }
    }
}

impl CodeScanner for FakeScanner {
    fn scan_frame(&mut self) -> Option<SymbolText> {
        let next = self.0.borrow_mut().pop_front()??;
        SymbolText::try_from(next.as_str()).ok()
    }
}

pub struct RadioState {
    pub sent: Vec<Vec<u8>>,
    pub results: VecDeque<Result<(), RadioError>>,
    pub downlinks: VecDeque<Vec<u8>>,
}

/// Radio that acknowledges every uplink unless told otherwise.
#[derive(Clone)]
pub struct FakeRadio(pub Rc<RefCell<RadioState>>);

impl FakeRadio {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(RadioState {
            sent: Vec::new(),
            results: VecDeque::new(),
            downlinks: VecDeque::new(),
        })))
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.borrow().sent.clone()
    }
}

impl Radio for FakeRadio {
    fn transmit(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        let mut state = self.0.borrow_mut();
        let result = state.results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.sent.push(payload.to_vec());
        }
        result
    }

    fn receive(&mut self) -> Result<Option<Downlink>, RadioError> {
        Ok(self
            .0
            .borrow_mut()
            .downlinks
            .pop_front()
            .and_then(|d| Downlink::from_slice(&d).ok()))
    }
}

// ============================================================================
// Board
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Relay(bool),
    Indicator(Indicator),
}

pub struct FakeBoard {
    pub clock: Clock,
    /// Next wake causes, with the sleep duration in ms before each.
    pub wakes: VecDeque<(WakeCause, u64)>,
    pub events: Vec<(u64, Event)>,
    pub epoch: u32,
    pub sleep_timers: Vec<Option<u32>>,
    /// Clock readings at each watchdog feed.
    pub feeds: Vec<u64>,
}

impl FakeBoard {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            wakes: VecDeque::new(),
            events: Vec::new(),
            epoch: 1_700_000_000,
            sleep_timers: Vec::new(),
            feeds: Vec::new(),
        }
    }

    pub fn relay_events(&self) -> Vec<(u64, bool)> {
        self.events
            .iter()
            .filter_map(|(t, e)| match e {
                Event::Relay(closed) => Some((*t, *closed)),
                _ => None,
            })
            .collect()
    }

    pub fn indicators(&self) -> Vec<Indicator> {
        self.events
            .iter()
            .filter_map(|(_, e)| match e {
                Event::Indicator(i) => Some(*i),
                _ => None,
            })
            .collect()
    }
}

impl Board for FakeBoard {
    type NfcPort = FakeSerial;
    type NfcDelay = FakeDelay;
    type LightBus = FakeI2c;
    type Scanner = FakeScanner;
    type Radio = FakeRadio;
    type Flash = MemFlash;

    fn sleep_until_wake(&mut self, timer_ms: Option<u32>) -> WakeCause {
        self.sleep_timers.push(timer_ms);
        let (cause, after) = self.wakes.pop_front().unwrap_or((WakeCause::Other, 0));
        self.clock.set(self.clock.get() + after);
        cause
    }

    fn set_relay(&mut self, closed: bool) {
        self.events.push((self.clock.get(), Event::Relay(closed)));
    }

    fn set_indicator(&mut self, indicator: Indicator) {
        self.events.push((self.clock.get(), Event::Indicator(indicator)));
    }

    fn delay_ms(&mut self, ms: u32) {
        self.clock.set(self.clock.get() + ms as u64);
    }

    fn now_ms(&mut self) -> u64 {
        self.clock.get()
    }

    fn unix_time(&mut self) -> u32 {
        self.epoch.wrapping_add((self.clock.get() / 1_000) as u32)
    }

    fn set_unix_time(&mut self, seconds: u32) {
        self.epoch = seconds.wrapping_sub((self.clock.get() / 1_000) as u32);
    }

    fn feed_watchdog(&mut self) {
        self.feeds.push(self.clock.get());
    }
}

// ============================================================================
// QR credentials
// ============================================================================

pub const TEST_KEY: &str = "jacla-terminal-0";

/// Encrypt `plaintext` (NUL padded to whole blocks) and Base64 it, as the
/// credential issuer does.
pub fn encrypt_credential(key: &str, plaintext: &[u8]) -> String {
    let key: [u8; KEY_LEN] = key.as_bytes().try_into().unwrap();
    let cipher = Aes128::new(GenericArray::from_slice(&key));
    let mut data = plaintext.to_vec();
    while data.len() % BLOCK_SIZE != 0 || data.is_empty() {
        data.push(0);
    }
    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        let block = GenericArray::from_mut_slice(chunk);
        cipher.encrypt_block(block);
    }
    encode(&data)
}

pub fn encode(bytes: &[u8]) -> String {
    let mut out = vec![0u8; bytes.len() * 4 / 3 + 4];
    let n = STANDARD.encode_slice(bytes, &mut out).unwrap();
    out.truncate(n);
    String::from_utf8(out).unwrap()
}
