//! Byte-stream access to UART-attached modules (NFC front-end, code scanner,
//! LoRa modem) with bounded polling.

use embedded_hal::delay::DelayNs;

/// Minimal non-blocking serial port.
pub trait SerialPort {
    type Error: core::fmt::Debug;

    /// Queue all of `bytes` for transmission.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Copy whatever is already buffered into `buf` without waiting.
    /// Returns 0 when nothing has arrived.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Drop any buffered input.
    fn discard_input(&mut self) -> Result<(), Self::Error> {
        let mut scratch = [0u8; 32];
        while self.read_available(&mut scratch)? > 0 {}
        Ok(())
    }
}

/// Bounded retry-poll: up to `max_trials` polls, `interval_ms` apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval_ms: u32,
    pub max_trials: u32,
}

impl PollPolicy {
    /// Command responses from the NFC front-end (about 5 s worst case).
    pub const COMMAND: Self = Self { interval_ms: 10, max_trials: 528 };
    /// REQA probe while waiting for a tag to enter the field.
    pub const PROBE: Self = Self { interval_ms: 10, max_trials: 10 };

    pub const fn new(interval_ms: u32, max_trials: u32) -> Self {
        Self { interval_ms, max_trials }
    }

    /// Upper bound on the time one wait can take.
    pub const fn budget_ms(&self) -> u64 {
        self.interval_ms as u64 * self.max_trials as u64
    }
}

/// Wait for the first bytes of a response and return how many were read.
///
/// Returns `Ok(0)` when the policy is exhausted. No length validation is done
/// here; callers decide whether a short frame is acceptable.
pub fn poll_response<P, D>(
    port: &mut P,
    delay: &mut D,
    policy: PollPolicy,
    buf: &mut [u8],
) -> Result<usize, P::Error>
where
    P: SerialPort,
    D: DelayNs,
{
    for _ in 0..policy.max_trials {
        let len = port.read_available(buf)?;
        if len > 0 {
            return Ok(len);
        }
        delay.delay_ms(policy.interval_ms);
    }
    Ok(0)
}
