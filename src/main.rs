//! Access terminal firmware for ESP32-S3.
//!
//! Hardware:
//! - UART1 (GPIO39 TX / GPIO38 RX): NFC front-end, 57600 8N2, also the
//!   tag-detector wake line
//! - UART0 (GPIO43 TX / GPIO44 RX): serial QR code engine
//! - UART2 (GPIO17 TX / GPIO18 RX): RAK3172 LoRaWAN module
//! - I2C0 (GPIO1 SDA / GPIO2 SCL): ambient light sensor, INT on GPIO4
//! - GPIO35 relay, GPIO13 green LED, GPIO14 red LED
//!
//! Logs go to the USB serial/JTAG console so every UART stays free for modules.

#![no_std]
#![no_main]

use esp_bootloader_esp_idf::esp_app_desc;
esp_app_desc!();

mod esp_board;

use embassy_embedded_hal::adapter::BlockingAsync;
use esp_hal::{
    clock::CpuClock,
    delay::Delay,
    gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull, WakeEvent},
    i2c::master::{Config as I2cConfig, I2c},
    main,
    rtc_cntl::Rtc,
    time::{Duration, Rate},
    timer::timg::{MwdtStage, TimerGroup},
    uart::{Config as UartConfig, StopBits, Uart},
};
use esp_println::logger::init_logger;
use esp_storage::FlashStorage;

use access_terminal::radio::{Rak3172, RakSettings};
use access_terminal::scanner::LineScanner;
use access_terminal::storage::FlashLayout;
use access_terminal::terminal::Components;
use access_terminal::{AccessTerminal, TerminalConfig};

use crate::esp_board::{EspBoard, UartPort};

#[main]
fn main() -> ! {
    init_logger(log::LevelFilter::Info);
    log::info!("Access terminal starting...");

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);
    let terminal_config = TerminalConfig::get();

    // Watchdog on TIMG1. A halted loop (including the panic handler) resets the chip.
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.enable();
    wdt.set_timeout(MwdtStage::Stage0, Duration::from_secs(30));

    let nfc_uart = Uart::new(
        peripherals.UART1,
        UartConfig::default()
            .with_baudrate(57_600)
            .with_stop_bits(StopBits::_2),
    )
    .expect("NFC UART config")
    .with_tx(peripherals.GPIO39)
    .with_rx(peripherals.GPIO38);

    let scanner_uart = Uart::new(peripherals.UART0, UartConfig::default().with_baudrate(9_600))
        .expect("scanner UART config")
        .with_tx(peripherals.GPIO43)
        .with_rx(peripherals.GPIO44);

    let radio_uart = Uart::new(peripherals.UART2, UartConfig::default().with_baudrate(115_200))
        .expect("radio UART config")
        .with_tx(peripherals.GPIO17)
        .with_rx(peripherals.GPIO18);

    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(100)),
    )
    .expect("I2C config")
    .with_sda(peripherals.GPIO1)
    .with_scl(peripherals.GPIO2);

    let mut light_int = Input::new(peripherals.GPIO4, InputConfig::default().with_pull(Pull::Up));
    if let Err(e) = light_int.wakeup_enable(true, WakeEvent::LowLevel) {
        log::error!("light INT wake-up not available: {:?}", e);
    }

    let delay = Delay::new();
    let board = EspBoard {
        rtc: Rtc::new(peripherals.LPWR),
        wdt,
        relay: Output::new(peripherals.GPIO35, Level::Low, OutputConfig::default()),
        led_green: Output::new(peripherals.GPIO13, Level::Low, OutputConfig::default()),
        led_red: Output::new(peripherals.GPIO14, Level::Low, OutputConfig::default()),
        light_int,
        delay,
        epoch: TerminalConfig::boot_epoch(),
    };

    let radio = (terminal_config.lora_interval_ms > 0).then(|| {
        Rak3172::new(UartPort::new(radio_uart), delay, RakSettings::default())
    });

    let parts = Components {
        nfc_port: UartPort::new(nfc_uart),
        nfc_delay: delay,
        light_bus: i2c,
        scanner: LineScanner::new(UartPort::new(scanner_uart)),
        radio,
        auth_flash: BlockingAsync::new(FlashStorage::new()),
        history_flash: BlockingAsync::new(FlashStorage::new()),
    };

    let mut terminal = match AccessTerminal::new(board, parts, terminal_config, FlashLayout::device()) {
        Ok(terminal) => terminal,
        Err(e) => panic!("terminal setup failed: {}", e),
    };

    let fatal = terminal.run();
    panic!("terminal stopped: {}", fatal);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("PANIC: {}", info);

    // Spin without feeding watchdog. The 30s timeout will trigger a full system reset.
    loop {
        core::hint::spin_loop();
    }
}
