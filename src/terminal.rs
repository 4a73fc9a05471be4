//! Access state machine.
//!
//! One cooperative loop owns every component. Each [`AccessTerminal::step`]
//! runs exactly one state and returns the next one:
//!
//! ```text
//! INIT ──► IDLE ──light──► READ_QR ───┐
//!           ▲  ├──serial─► READ_RFID ─┼─► CHECK_UID ─┐
//!           │  └──timer──► LORA ──┐   │              │
//!           └─────────────────────┴───┴──────────────┘
//! ```
//!
//! IDLE is the only state that sleeps. Every other wait is bounded by a
//! wall-clock timeout or a poll policy.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use embedded_storage_async::nor_flash::NorFlash;

use crate::auth::AuthorizationStore;
use crate::cipher::{CipherCodec, InvalidKeyLength};
use crate::config::TerminalConfig;
use crate::history::{HistoryEntry, HistoryError, HistoryLog};
use crate::light::LightMonitor;
use crate::nfc::{self, CalibrationError, TagReader, TagUid};
use crate::radio::{self, Radio};
use crate::scanner::CodeScanner;
use crate::serial::SerialPort;
use crate::storage::{FlashLayout, StorageError};
use crate::{time, Identifier};

/// Front-end wake sources while idle: tag detector or host IRQ.
const NFC_IDLE_WAKE: u8 = nfc::wake::TAG_DETECT | nfc::wake::IRQ_IN;
/// Uplinks sent per LORA visit before going back to sleep.
const MAX_UPLINKS_PER_SYNC: usize = 8;
const MAX_ENTRIES_PER_UPLINK: usize = radio::entries_per_uplink(1 + crate::history::TIMESTAMP_LEN);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Init,
    Idle,
    ReadQr,
    ReadRfid,
    CheckUid,
    Lora,
}

/// Why the MCU left light sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeCause {
    /// Ambient light variation interrupt.
    LightSensor,
    /// Edge on the NFC front-end UART (tag detector fired).
    Serial,
    /// Sync timer.
    Timer,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Indicator {
    Off,
    Green,
    Orange,
    Red,
}

/// A credential presented during one cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// Decrypted QR plaintext.
    Code(Identifier),
    /// Tag UID.
    Tag(TagUid),
}

impl Credential {
    pub fn identifier(&self) -> &[u8] {
        match self {
            Credential::Code(id) => id.as_slice(),
            Credential::Tag(uid) => uid.as_slice(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    NoCredential,
    Unknown,
    Revoked,
    StoreError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessDecision {
    Granted { permission: u8, timestamp: u32 },
    Denied(DenyReason),
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, AccessDecision::Granted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TerminalError {
    #[error("NFC tag detector calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("authorization store: {0}")]
    Auth(#[from] StorageError),
    #[error("history log: {0}")]
    History(#[from] HistoryError),
    #[error(transparent)]
    Key(#[from] InvalidKeyLength),
}

/// Result of a sensing state, consumed by CHECK_UID.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ScanOutcome {
    Nothing,
    Credential(Credential),
    ClockSet(u32),
}

/// Board services and the concrete component types the firmware plugs in.
pub trait Board {
    type NfcPort: SerialPort;
    type NfcDelay: DelayNs;
    type LightBus: I2c;
    type Scanner: CodeScanner;
    type Radio: Radio;
    type Flash: NorFlash;

    /// Enter light sleep until a wake source fires or `timer_ms` elapses.
    fn sleep_until_wake(&mut self, timer_ms: Option<u32>) -> WakeCause;
    fn set_relay(&mut self, closed: bool);
    fn set_indicator(&mut self, indicator: Indicator);
    fn delay_ms(&mut self, ms: u32);
    /// Monotonic milliseconds.
    fn now_ms(&mut self) -> u64;
    /// Wall clock, Unix seconds.
    fn unix_time(&mut self) -> u32;
    fn set_unix_time(&mut self, seconds: u32);
    fn feed_watchdog(&mut self) {}
}

/// Components handed to the state machine at construction.
pub struct Components<B: Board> {
    pub nfc_port: B::NfcPort,
    pub nfc_delay: B::NfcDelay,
    pub light_bus: B::LightBus,
    pub scanner: B::Scanner,
    pub radio: Option<B::Radio>,
    pub auth_flash: B::Flash,
    pub history_flash: B::Flash,
}

pub struct AccessTerminal<B: Board> {
    board: B,
    config: TerminalConfig,
    state: DeviceState,
    codec: CipherCodec,
    nfc: TagReader<B::NfcPort, B::NfcDelay>,
    light: LightMonitor<B::LightBus>,
    scanner: B::Scanner,
    radio: Option<B::Radio>,
    auth: AuthorizationStore<B::Flash>,
    history: HistoryLog<B::Flash>,
    outcome: ScanOutcome,
    last_scan: Option<(Identifier, u64)>,
}

impl<B: Board> AccessTerminal<B> {
    /// Build the terminal and open both stores on `layout`.
    pub fn new(
        board: B,
        parts: Components<B>,
        config: TerminalConfig,
        layout: FlashLayout,
    ) -> Result<Self, TerminalError> {
        let codec = CipherCodec::from_ascii_key(config.aes_key, config.block_mode)?;
        let auth = AuthorizationStore::open(parts.auth_flash, layout.auth)?;
        let history = HistoryLog::open(
            parts.history_flash,
            layout.history_control,
            layout.history_data,
            config.uid_size,
            config.uid_size_policy,
        )?;
        Ok(Self {
            board,
            nfc: TagReader::new(parts.nfc_port, parts.nfc_delay, config.nfc_poll, config.nfc_probe_poll),
            light: LightMonitor::new(parts.light_bus),
            scanner: parts.scanner,
            radio: parts.radio,
            config,
            state: DeviceState::Init,
            codec,
            auth,
            history,
            outcome: ScanOutcome::Nothing,
            last_scan: None,
        })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn auth_mut(&mut self) -> &mut AuthorizationStore<B::Flash> {
        &mut self.auth
    }

    pub fn history_mut(&mut self) -> &mut HistoryLog<B::Flash> {
        &mut self.history
    }

    pub fn nfc_mut(&mut self) -> &mut TagReader<B::NfcPort, B::NfcDelay> {
        &mut self.nfc
    }

    pub fn radio_mut(&mut self) -> Option<&mut B::Radio> {
        self.radio.as_mut()
    }

    /// Run one state and move to the next. Only calibration failure is fatal.
    pub fn step(&mut self) -> Result<DeviceState, TerminalError> {
        self.board.feed_watchdog();
        let next = match self.state {
            DeviceState::Init => self.init()?,
            DeviceState::Idle => self.idle(),
            DeviceState::ReadQr => self.read_qr(),
            DeviceState::ReadRfid => self.read_rfid(),
            DeviceState::CheckUid => self.check_uid(),
            DeviceState::Lora => self.lora(),
        };
        if next != self.state {
            log::debug!("terminal: {:?} -> {:?}", self.state, next);
        }
        if self.state != DeviceState::Idle {
            self.board.delay_ms(self.config.loop_delay_ms);
        }
        self.state = next;
        Ok(next)
    }

    /// Drive the state machine until a fatal error.
    pub fn run(&mut self) -> TerminalError {
        loop {
            if let Err(e) = self.step() {
                log::error!("terminal: fatal: {}", e);
                return e;
            }
        }
    }

    fn init(&mut self) -> Result<DeviceState, TerminalError> {
        log::info!("terminal: init");
        self.board.set_relay(false);
        self.board.set_indicator(Indicator::Off);

        if let Err(e) = self.light.init(self.config.light_threshold_exp, self.config.light_persist) {
            log::error!("terminal: light sensor init failed: {}", e);
        }

        if let Err(e) = self.nfc.echo() {
            log::error!("terminal: NFC front-end not responding: {}", e);
        }
        self.nfc.tag_detection_calibration()?;
        self.arm_tag_detector();

        log::info!(
            "terminal: ready, {} history entries ({} unsynced)",
            self.history.get_nb_entries(),
            self.history.pending_sync()
        );
        Ok(DeviceState::Idle)
    }

    fn arm_tag_detector(&mut self) {
        if let Err(e) = self.nfc.idle_tag_detector(NFC_IDLE_WAKE) {
            log::error!("terminal: failed to arm tag detector: {}", e);
        }
    }

    fn sync_timer(&self) -> Option<u32> {
        (self.radio.is_some() && self.config.lora_interval_ms > 0).then_some(self.config.lora_interval_ms)
    }

    fn idle(&mut self) -> DeviceState {
        self.board.set_indicator(Indicator::Off);
        let timer = self.sync_timer();
        match self.board.sleep_until_wake(timer) {
            WakeCause::LightSensor => match self.light.read_status() {
                Ok(true) => DeviceState::ReadQr,
                Ok(false) => {
                    log::debug!("terminal: light wake without interrupt status");
                    DeviceState::Idle
                }
                Err(e) => {
                    log::error!("terminal: light status read failed: {}", e);
                    DeviceState::ReadQr
                }
            },
            WakeCause::Serial => DeviceState::ReadRfid,
            WakeCause::Timer if self.radio.is_some() && self.history.pending_sync() > 0 => {
                DeviceState::Lora
            }
            WakeCause::Timer | WakeCause::Other => DeviceState::Idle,
        }
    }

    fn read_qr(&mut self) -> DeviceState {
        self.outcome = ScanOutcome::Nothing;
        self.scanner.reset();
        let start = self.board.now_ms();
        let timeout = self.config.qr_timeout_ms as u64;

        while self.board.now_ms().saturating_sub(start) < timeout {
            if let Some(text) = self.scanner.scan_frame() {
                log::debug!("terminal: QR symbol of {} chars", text.len());
                self.outcome = match self.codec.decode_credential(&text) {
                    Ok(plain) => self.classify_code(plain.credential_bytes()),
                    Err(e) => {
                        log::warn!("terminal: QR rejected: {}", e);
                        ScanOutcome::Nothing
                    }
                };
                return DeviceState::CheckUid;
            }
            self.board.feed_watchdog();
            self.board.delay_ms(self.config.scan_interval_ms);
        }
        log::info!("terminal: no QR code within {} ms", timeout);
        DeviceState::CheckUid
    }

    fn classify_code(&mut self, bytes: &[u8]) -> ScanOutcome {
        if self.config.accept_clock_codes {
            if let Some(seconds) = time::parse_clock_code(bytes) {
                return ScanOutcome::ClockSet(seconds);
            }
        }
        match Identifier::from_slice(bytes) {
            Ok(id) if !id.is_empty() => ScanOutcome::Credential(Credential::Code(id)),
            _ => ScanOutcome::Nothing,
        }
    }

    fn read_rfid(&mut self) -> DeviceState {
        self.outcome = ScanOutcome::Nothing;
        let start = self.board.now_ms();
        let timeout = self.config.rfid_timeout_ms as u64;

        while self.board.now_ms().saturating_sub(start) < timeout {
            if self.nfc.is_tag_available() {
                if self.nfc.get_tag_uid() > 0 {
                    self.outcome = ScanOutcome::Credential(Credential::Tag(self.nfc.uid().clone()));
                }
                break;
            }
            self.board.feed_watchdog();
            self.board.delay_ms(self.config.scan_interval_ms);
        }
        if self.outcome == ScanOutcome::Nothing {
            log::info!("terminal: no tag resolved");
        }
        self.arm_tag_detector();
        DeviceState::CheckUid
    }

    fn check_uid(&mut self) -> DeviceState {
        match core::mem::replace(&mut self.outcome, ScanOutcome::Nothing) {
            ScanOutcome::ClockSet(seconds) => {
                self.board.set_unix_time(seconds);
                log::info!("terminal: clock set to {}", seconds);
                self.signal(Indicator::Orange, self.config.deny_ms);
            }
            ScanOutcome::Credential(credential) => {
                if self.debounced(credential.identifier()) {
                    return DeviceState::Idle;
                }
                let decision = self.check_credential(Some(&credential));
                self.actuate(decision);
            }
            ScanOutcome::Nothing => {
                let decision = self.check_credential(None);
                self.actuate(decision);
            }
        }
        DeviceState::Idle
    }

    /// True when the same identifier was handled less than `debounce_ms` ago.
    fn debounced(&mut self, identifier: &[u8]) -> bool {
        let now = self.board.now_ms();
        if let Some((last, at)) = &self.last_scan {
            if last.as_slice() == identifier && now.saturating_sub(*at) < self.config.debounce_ms {
                log::debug!("terminal: repeated scan ignored");
                return true;
            }
        }
        if let Ok(id) = Identifier::from_slice(identifier) {
            self.last_scan = Some((id, now));
        }
        false
    }

    /// Authorize a credential and, on grant, append it to the history.
    ///
    /// The history timestamp is the wall clock at the moment of the check.
    pub fn check_credential(&mut self, credential: Option<&Credential>) -> AccessDecision {
        let Some(credential) = credential else {
            log::info!("terminal: access denied (no credential)");
            return AccessDecision::Denied(DenyReason::NoCredential);
        };
        let identifier = credential.identifier();
        let decision = match self.auth.get(identifier) {
            Ok(Some(0)) => AccessDecision::Denied(DenyReason::Revoked),
            Ok(Some(permission)) => AccessDecision::Granted {
                permission,
                timestamp: self.board.unix_time(),
            },
            Ok(None) => AccessDecision::Denied(DenyReason::Unknown),
            Err(e) => {
                log::error!("terminal: authorization lookup failed: {}", e);
                AccessDecision::Denied(DenyReason::StoreError)
            }
        };

        match decision {
            AccessDecision::Granted { permission, timestamp } => {
                log::info!("terminal: access granted (permission {})", permission);
                if let Err(e) = self.history.add_history(identifier, timestamp) {
                    log::error!("terminal: failed to record history: {}", e);
                }
            }
            AccessDecision::Denied(reason) => log::info!("terminal: access denied ({:?})", reason),
        }
        decision
    }

    fn actuate(&mut self, decision: AccessDecision) {
        if decision.is_granted() {
            self.board.set_indicator(Indicator::Green);
            self.board.set_relay(true);
            self.board.delay_ms(self.config.grant_ms);
            self.board.set_relay(false);
            self.board.set_indicator(Indicator::Off);
        } else {
            self.signal(Indicator::Red, self.config.deny_ms);
        }
    }

    fn signal(&mut self, indicator: Indicator, ms: u32) {
        self.board.set_indicator(indicator);
        self.board.delay_ms(ms);
        self.board.set_indicator(Indicator::Off);
    }

    fn lora(&mut self) -> DeviceState {
        let Some(radio) = self.radio.as_mut() else {
            return DeviceState::Idle;
        };
        let uid_size = self.history.get_uid_size();
        let per_uplink = radio::entries_per_uplink(self.history.get_block_size() as usize)
            .min(MAX_ENTRIES_PER_UPLINK);
        let mut entries: [HistoryEntry; MAX_ENTRIES_PER_UPLINK] =
            core::array::from_fn(|_| HistoryEntry::default());

        for _ in 0..MAX_UPLINKS_PER_SYNC {
            if self.history.pending_sync() == 0 {
                break;
            }
            let n = match self.history.peek_unsynced(&mut entries[..per_uplink]) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("terminal: history read failed: {}", e);
                    break;
                }
            };
            let (payload, packed) = radio::pack_history(&entries[..n], uid_size);
            if packed == 0 {
                break;
            }
            // One confirmed uplink fits inside a watchdog period.
            self.board.feed_watchdog();
            match radio.transmit(&payload) {
                Ok(()) => {
                    if let Err(e) = self.history.commit_synced(packed as u32) {
                        log::error!("terminal: failed to commit sync cursor: {}", e);
                        break;
                    }
                    log::info!("terminal: synced {} history entries", packed);
                }
                Err(e) => {
                    log::warn!("terminal: uplink failed: {}", e);
                    break;
                }
            }
        }

        self.board.feed_watchdog();
        match radio.receive() {
            Ok(Some(downlink)) => self.apply_downlink(&downlink),
            Ok(None) => {}
            Err(e) => log::warn!("terminal: downlink read failed: {}", e),
        }
        DeviceState::Idle
    }

    /// Authorization update: `[permission][identifier...]`.
    fn apply_downlink(&mut self, payload: &[u8]) {
        let Some((&permission, identifier)) = payload.split_first() else {
            return;
        };
        if identifier.is_empty() {
            log::warn!("terminal: ignoring downlink without identifier");
            return;
        }
        match self.auth.set(identifier, permission) {
            Ok(()) => log::info!("terminal: authorization updated over radio"),
            Err(e) => log::error!("terminal: failed to apply authorization update: {}", e),
        }
    }
}
