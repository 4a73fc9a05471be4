//! Access terminal core: credential pipeline, durable stores and the
//! power-aware state machine driving a battery-powered door terminal.
//!
//! Architecture:
//! - `terminal`: the access state machine (INIT → IDLE → READ_QR/READ_RFID →
//!   CHECK_UID → IDLE, plus LORA history sync)
//! - `cipher`: Base64 + AES-128-ECB QR credential decoding
//! - `nfc`: ISO 14443-A anticollision/select over an NFC front-end UART
//! - `light`: ambient light variation interrupt (wake trigger for QR reads)
//! - `auth` / `history`: flash-backed authorization map and scan history log
//! - `scanner` / `radio`: serial code scanner and LoRaWAN modem collaborators
//!
//! Everything here is hardware-agnostic. The ESP32-S3 firmware binary wires
//! these components to esp-hal peripherals.

#![cfg_attr(not(test), no_std)]

pub mod auth;
pub mod cipher;
pub mod config;
pub mod history;
pub mod light;
pub mod nfc;
pub mod radio;
pub mod scanner;
pub mod serial;
pub mod storage;
pub mod terminal;
pub mod time;

pub use auth::AuthorizationStore;
pub use cipher::{BlockMode, CipherCodec, DecodeError, Plaintext};
pub use config::TerminalConfig;
pub use history::{HistoryEntry, HistoryError, HistoryLog, UidSizePolicy};
pub use light::LightMonitor;
pub use nfc::{TagReader, TagUid};
pub use radio::{Radio, RadioError};
pub use scanner::CodeScanner;
pub use serial::{PollPolicy, SerialPort};
pub use storage::StorageError;
pub use terminal::{
    AccessDecision, AccessTerminal, Board, Credential, DeviceState, Indicator, TerminalError,
    WakeCause,
};

/// Maximum length of a credential identifier in bytes.
///
/// Bounded by the QR decode buffer: a decrypted QR plaintext never exceeds it.
pub const MAX_IDENTIFIER_LEN: usize = cipher::MAX_CIPHERTEXT_LEN;

/// Credential identifier bytes (tag UID or decrypted QR plaintext).
pub type Identifier = heapless::Vec<u8, MAX_IDENTIFIER_LEN>;
