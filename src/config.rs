//! Terminal configuration, embedded at compile time.
//!
//! Values come from `TERMINAL_*` environment variables read by `option_env!`
//! when the crate is built (see build.rs). Unset or unparsable values fall back
//! to the defaults below.

use crate::cipher::BlockMode;
use crate::history::UidSizePolicy;
use crate::serial::PollPolicy;

/// Fallback AES key used when `TERMINAL_AES_KEY` is not set.
pub const DEFAULT_AES_KEY: &str = "jacla-terminal-0";

/// Terminal configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalConfig {
    /// ASCII AES-128 key shared with the QR issuer (must be 16 bytes).
    pub aes_key: &'static str,
    /// Identifier width of one history block.
    pub uid_size: usize,
    /// How long the relay stays closed after a grant.
    pub grant_ms: u32,
    /// How long the red indicator stays lit after a denial.
    pub deny_ms: u32,
    /// Wall-clock budget for one READ_QR pass.
    pub qr_timeout_ms: u32,
    /// Wall-clock budget for one READ_RFID pass.
    pub rfid_timeout_ms: u32,
    /// Delay between READ_QR frame captures and READ_RFID availability polls.
    pub scan_interval_ms: u32,
    /// Yield delay between non-sleeping state machine iterations.
    pub loop_delay_ms: u32,
    /// Same-credential scans closer together than this are ignored.
    pub debounce_ms: u64,
    /// Light variation threshold exponent (threshold = 8 * 2^exp).
    pub light_threshold_exp: u8,
    /// Consecutive light measurements required to raise the interrupt.
    pub light_persist: u8,
    /// Timer wake period for LORA history sync, 0 disables the timer wake.
    pub lora_interval_ms: u32,
    /// Poll policy for NFC front-end command responses.
    pub nfc_poll: PollPolicy,
    /// Poll policy for the short REQA probe.
    pub nfc_probe_poll: PollPolicy,
    pub block_mode: BlockMode,
    pub uid_size_policy: UidSizePolicy,
    /// Accept `YYYY-MM-DD-HH-MM` QR payloads as clock updates.
    pub accept_clock_codes: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            aes_key: DEFAULT_AES_KEY,
            uid_size: 10,
            grant_ms: 5_000,
            deny_ms: 1_000,
            qr_timeout_ms: 10_000,
            rfid_timeout_ms: 3_000,
            scan_interval_ms: 10,
            loop_delay_ms: 10,
            debounce_ms: 2_000,
            light_threshold_exp: 4,
            light_persist: 1,
            lora_interval_ms: 0,
            nfc_poll: PollPolicy::COMMAND,
            nfc_probe_poll: PollPolicy::PROBE,
            block_mode: BlockMode::Lenient,
            uid_size_policy: UidSizePolicy::AdoptStored,
            accept_clock_codes: true,
        }
    }
}

impl TerminalConfig {
    /// Get the compile-time configuration.
    pub fn get() -> Self {
        let defaults = Self::default();
        Self {
            aes_key: option_env!("TERMINAL_AES_KEY").unwrap_or(DEFAULT_AES_KEY),
            uid_size: env_u32(option_env!("TERMINAL_UID_SIZE"), defaults.uid_size as u32) as usize,
            grant_ms: env_u32(option_env!("TERMINAL_GRANT_MS"), defaults.grant_ms),
            deny_ms: env_u32(option_env!("TERMINAL_DENY_MS"), defaults.deny_ms),
            qr_timeout_ms: env_u32(option_env!("TERMINAL_QR_TIMEOUT_MS"), defaults.qr_timeout_ms),
            rfid_timeout_ms: env_u32(
                option_env!("TERMINAL_RFID_TIMEOUT_MS"),
                defaults.rfid_timeout_ms,
            ),
            light_threshold_exp: env_u32(
                option_env!("TERMINAL_LIGHT_THRESHOLD_EXP"),
                defaults.light_threshold_exp as u32,
            )
            .min(7) as u8,
            light_persist: env_u32(
                option_env!("TERMINAL_LIGHT_PERSIST"),
                defaults.light_persist as u32,
            )
            .clamp(1, 16) as u8,
            lora_interval_ms: env_u32(option_env!("TERMINAL_LORA_INTERVAL_S"), 0)
                .saturating_mul(1_000),
            block_mode: if env_flag(option_env!("TERMINAL_STRICT_CIPHER")) {
                BlockMode::Strict
            } else {
                BlockMode::Lenient
            },
            uid_size_policy: if env_flag(option_env!("TERMINAL_STRICT_UID_SIZE")) {
                UidSizePolicy::Reject
            } else {
                UidSizePolicy::AdoptStored
            },
            ..defaults
        }
    }

    /// Unix time the wall clock starts from until a clock code is scanned.
    pub fn boot_epoch() -> u32 {
        env_u32(option_env!("TERMINAL_EPOCH"), 0)
    }
}

fn env_u32(value: Option<&str>, default: u32) -> u32 {
    match value {
        Some(s) => parse_u32(s, default),
        None => default,
    }
}

fn env_flag(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true") | Some("yes"))
}

/// Parse a decimal number at compile time (const fn compatible).
///
/// Non-digit characters are skipped; an empty or overflowing value yields
/// `default`.
pub const fn parse_u32(s: &str, default: u32) -> u32 {
    let bytes = s.as_bytes();
    let mut result: u32 = 0;
    let mut seen = false;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit >= b'0' && digit <= b'9' {
            result = match result.checked_mul(10) {
                Some(r) => match r.checked_add((digit - b'0') as u32) {
                    Some(r) => r,
                    None => return default,
                },
                None => return default,
            };
            seen = true;
        }
        i += 1;
    }
    if seen { result } else { default }
}
