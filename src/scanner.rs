//! Code scanner interface and a UART line-scanner implementation.
//!
//! The state machine only needs "capture a frame and decode it, or nothing".
//! Camera modules with on-board decoding (and the serial QR engines the board
//! also supports) print each decoded symbol as one text line.

use heapless::{String, Vec};

use crate::serial::SerialPort;

/// Longest symbol text accepted: Base64 of the largest credential plus slack.
pub const MAX_SYMBOL_LEN: usize = 256;

/// Decoded symbol text.
pub type SymbolText = String<MAX_SYMBOL_LEN>;

/// Frame capture + optical decode.
pub trait CodeScanner {
    /// Capture one frame and return the decoded symbol text, if any.
    fn scan_frame(&mut self) -> Option<SymbolText>;

    /// Drop anything captured so far (called when a READ_QR pass starts).
    fn reset(&mut self) {}
}

/// Scanner that reads `\r`/`\n` terminated symbol lines from a serial port.
pub struct LineScanner<P: SerialPort> {
    port: P,
    line: Vec<u8, MAX_SYMBOL_LEN>,
    overflowed: bool,
    // Bytes read from the port but not consumed yet.
    rx: [u8; 64],
    cursor: usize,
    filled: usize,
}

impl<P: SerialPort> LineScanner<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            line: Vec::new(),
            overflowed: false,
            rx: [0; 64],
            cursor: 0,
            filled: 0,
        }
    }

    pub fn release(self) -> P {
        self.port
    }

    fn finish_line(&mut self) -> Option<SymbolText> {
        let overflowed = core::mem::replace(&mut self.overflowed, false);
        let line = core::mem::take(&mut self.line);
        if overflowed {
            log::warn!("scanner: dropped symbol longer than {} bytes", MAX_SYMBOL_LEN);
            return None;
        }
        if line.is_empty() {
            return None;
        }
        match String::from_utf8(line) {
            Ok(text) => Some(text),
            Err(_) => {
                log::warn!("scanner: dropped non-UTF-8 symbol");
                None
            }
        }
    }
}

impl<P: SerialPort> CodeScanner for LineScanner<P> {
    fn scan_frame(&mut self) -> Option<SymbolText> {
        loop {
            if self.cursor == self.filled {
                self.cursor = 0;
                self.filled = match self.port.read_available(&mut self.rx) {
                    Ok(0) => return None,
                    Ok(n) => n,
                    Err(e) => {
                        log::error!("scanner: read failed: {:?}", e);
                        return None;
                    }
                };
            }
            while self.cursor < self.filled {
                let byte = self.rx[self.cursor];
                self.cursor += 1;
                if byte == b'\r' || byte == b'\n' {
                    if let Some(text) = self.finish_line() {
                        return Some(text);
                    }
                } else if self.line.push(byte).is_err() {
                    self.overflowed = true;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.line.clear();
        self.overflowed = false;
        self.cursor = 0;
        self.filled = 0;
        if let Err(e) = self.port.discard_input() {
            log::error!("scanner: flush failed: {:?}", e);
        }
    }
}
