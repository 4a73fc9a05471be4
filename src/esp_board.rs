//! ESP32-S3 board support: UART ports, GPIO actuation, light sleep and clocks.

use esp_hal::{
    delay::Delay,
    gpio::{Input, Output},
    i2c::master::I2c,
    peripherals::TIMG1,
    rtc_cntl::{
        sleep::{GpioWakeupSource, TimerWakeupSource, UartWakeupSource},
        wakeup_cause, Rtc, SleepSource,
    },
    time::Instant,
    timer::timg::Wdt,
    uart::{RxError, TxError, Uart},
    Blocking,
};

use embassy_embedded_hal::adapter::BlockingAsync;
use esp_storage::FlashStorage;

use access_terminal::radio::Rak3172;
use access_terminal::scanner::LineScanner;
use access_terminal::{Board, Indicator, SerialPort, WakeCause};

/// UART index of the NFC front-end, used for UART wake-up.
pub const NFC_UART_NUM: usize = 1;
// RX edges needed to wake from light sleep on the NFC UART.
const NFC_WAKE_THRESHOLD: u16 = 3;

#[derive(Debug)]
pub enum UartFault {
    Rx(RxError),
    Tx(TxError),
}

/// Blocking esp-hal UART behind the crate's serial trait.
pub struct UartPort<'d> {
    uart: Uart<'d, Blocking>,
}

impl<'d> UartPort<'d> {
    pub fn new(uart: Uart<'d, Blocking>) -> Self {
        Self { uart }
    }
}

impl SerialPort for UartPort<'_> {
    type Error = UartFault;

    fn write_all(&mut self, mut bytes: &[u8]) -> Result<(), Self::Error> {
        while !bytes.is_empty() {
            let written = self.uart.write(bytes).map_err(UartFault::Tx)?;
            bytes = &bytes[written..];
        }
        self.uart.flush().map_err(UartFault::Tx)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.uart.read_buffered(buf).map_err(UartFault::Rx)
    }
}

pub type Flash = BlockingAsync<FlashStorage>;

/// Everything the state machine drives directly on the device.
pub struct EspBoard<'d> {
    pub rtc: Rtc<'d>,
    pub wdt: Wdt<TIMG1<'d>>,
    pub relay: Output<'d>,
    pub led_green: Output<'d>,
    pub led_red: Output<'d>,
    /// Light sensor INT line (active low).
    pub light_int: Input<'d>,
    pub delay: Delay,
    /// Unix time at `now_ms() == 0`, in seconds.
    pub epoch: u32,
}

impl<'d> Board for EspBoard<'d> {
    type NfcPort = UartPort<'d>;
    type NfcDelay = Delay;
    type LightBus = I2c<'d, Blocking>;
    type Scanner = LineScanner<UartPort<'d>>;
    type Radio = Rak3172<UartPort<'d>, Delay>;
    type Flash = Flash;

    fn sleep_until_wake(&mut self, timer_ms: Option<u32>) -> WakeCause {
        // The light INT line may already be low if a change happened while awake.
        if self.light_int.is_low() {
            return WakeCause::LightSensor;
        }
        self.wdt.feed();

        let gpio = GpioWakeupSource::new();
        let uart = UartWakeupSource::new(NFC_UART_NUM).with_threshold(NFC_WAKE_THRESHOLD);
        match timer_ms {
            Some(ms) => {
                let timer = TimerWakeupSource::new(core::time::Duration::from_millis(ms as u64));
                self.rtc.sleep_light(&[&gpio, &uart, &timer]);
            }
            None => self.rtc.sleep_light(&[&gpio, &uart]),
        }

        match wakeup_cause() {
            SleepSource::Gpio => WakeCause::LightSensor,
            SleepSource::Uart => WakeCause::Serial,
            SleepSource::Timer => WakeCause::Timer,
            other => {
                log::debug!("board: wake cause {:?}", other);
                WakeCause::Other
            }
        }
    }

    fn set_relay(&mut self, closed: bool) {
        self.relay.set_level(closed.into());
    }

    fn set_indicator(&mut self, indicator: Indicator) {
        let (green, red) = match indicator {
            Indicator::Off => (false, false),
            Indicator::Green => (true, false),
            Indicator::Orange => (true, true),
            Indicator::Red => (false, true),
        };
        self.led_green.set_level(green.into());
        self.led_red.set_level(red.into());
    }

    fn delay_ms(&mut self, ms: u32) {
        // Long actuation holds must not starve the watchdog.
        let mut remaining = ms;
        while remaining > 0 {
            let chunk = remaining.min(1_000);
            self.delay.delay_millis(chunk);
            self.wdt.feed();
            remaining -= chunk;
        }
    }

    fn now_ms(&mut self) -> u64 {
        Instant::now().duration_since_epoch().as_millis()
    }

    fn unix_time(&mut self) -> u32 {
        self.epoch.wrapping_add((self.now_ms() / 1_000) as u32)
    }

    fn set_unix_time(&mut self, seconds: u32) {
        self.epoch = seconds.wrapping_sub((self.now_ms() / 1_000) as u32);
    }

    fn feed_watchdog(&mut self) {
        self.wdt.feed();
    }
}
