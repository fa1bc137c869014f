#![no_std]

extern crate alloc;

use alloc::string::String;
use embedded_io_async::{ErrorType, Read, Write};
use esp_hal::{
    Async,
    gpio::{AnyPin, Input, InputConfig, Level, Output, OutputConfig},
    uart::{Config, ConfigError, Instance, IoError, Uart},
};
use log::warn;
use parcelbox::{
    clock::{Clock, Instant},
    scan::Scanner,
};

// Longest accepted QR code, longer reads are discarded
const MAX_CODE_LEN: usize = 128;

#[macro_export]
macro_rules! num_from_env {
    ($name:literal, $type:ty) => {
        match <$type>::from_str_radix(env!($name), 10) {
            Ok(val) => val,
            Err(_) => panic!("failed to parse environment variable as number"),
        }
    };
}

/// UART link to the actuator controller.
pub struct ArduinoPort<'a>(Uart<'a, Async>);

impl ErrorType for ArduinoPort<'_> {
    type Error = IoError;
}

impl Read for ArduinoPort<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        // Retry on framing and overrun errors, the framer drops garbled lines
        loop {
            match self.0.read_async(buf).await {
                Ok(len) => return Ok(len),
                Err(err) => warn!("Actuator link read failed: {err:?}"),
            }
        }
    }
}

impl Write for ArduinoPort<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        Ok(self.0.write_async(buf).await?)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(self.0.flush_async().await?)
    }
}

/// Serial QR code reader terminating each code with CR or LF.
pub struct QrScanner<'a> {
    uart: Uart<'a, Async>,
    line: String,
    overflow: bool,
}

impl Scanner for QrScanner<'_> {
    async fn read_qr(&mut self) -> Option<String> {
        let mut byte = [0x00];

        loop {
            if let Err(err) = self.uart.read_async(&mut byte).await {
                warn!("QR scanner read failed: {err:?}");

                self.line.clear();

                return None;
            }

            match byte[0] {
                b'\r' | b'\n' => {
                    let overflow = core::mem::take(&mut self.overflow);

                    if overflow {
                        warn!("Discarding overlong QR code");

                        self.line.clear();
                    } else if !self.line.is_empty() {
                        return Some(core::mem::take(&mut self.line));
                    }
                }
                b if b.is_ascii() && !b.is_ascii_control() => {
                    if self.line.len() < MAX_CODE_LEN {
                        self.line.push(char::from(b));
                    } else {
                        self.overflow = true;
                    }
                }
                _ => {}
            }
        }
    }
}

/// [`Clock`] backed by `embassy-time`, counting from boot.
#[derive(Copy, Clone, Default, Debug)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now(&self) -> Instant {
        Instant::from_millis(embassy_time::Instant::now().as_millis())
    }

    async fn sleep_until(&self, deadline: Instant) {
        // Deadlines past the timer's range never expire
        let deadline = embassy_time::Instant::try_from_millis(deadline.as_millis())
            .unwrap_or(embassy_time::Instant::MAX);

        embassy_time::Timer::at(deadline).await;
    }
}

pub struct StatusLed<'a>(Output<'a>);

impl StatusLed<'_> {
    pub fn on(&mut self) {
        self.0.set_low();
    }

    pub fn off(&mut self) {
        self.0.set_high();
    }

    pub fn set_connected(&mut self, connected: bool) {
        if connected {
            self.on();
        } else {
            self.off();
        }
    }
}

/// Constructs the status LED, which is active low.
#[must_use]
pub fn new_status_led<'a>() -> StatusLed<'a> {
    const PIN: u8 = num_from_env!("PIN_LED_STATUS", u8);
    let led = unsafe { AnyPin::steal(PIN) };

    StatusLed(Output::new(led, Level::High, OutputConfig::default()))
}

fn new_uart<'a>(
    uart: impl Instance + 'a,
    cfg: Config,
    pin_rx: u8,
    pin_tx: u8,
) -> Result<Uart<'a, Async>, ConfigError> {
    let rx = Input::new(unsafe { AnyPin::steal(pin_rx) }, InputConfig::default());
    let tx = Output::new(
        unsafe { AnyPin::steal(pin_tx) },
        Level::High,
        OutputConfig::default(),
    );

    Ok(Uart::new(uart, cfg)?
        .with_rx(rx.peripheral_input())
        .with_tx(tx.into_peripheral_output())
        .into_async())
}

/// Opens the actuator link at 115200 baud 8N1.
pub fn new_arduino_port<'a>(uart: impl Instance + 'a) -> Result<ArduinoPort<'a>, ConfigError> {
    const PIN_RX: u8 = num_from_env!("PIN_ARDUINO_RX", u8);
    const PIN_TX: u8 = num_from_env!("PIN_ARDUINO_TX", u8);
    let cfg = Config::default().with_baudrate(parcelbox::frame::BAUD_RATE);

    Ok(ArduinoPort(new_uart(uart, cfg, PIN_RX, PIN_TX)?))
}

/// Opens the QR code reader at 9600 baud 8N1.
pub fn new_qr_scanner<'a>(uart: impl Instance + 'a) -> Result<QrScanner<'a>, ConfigError> {
    const PIN_RX: u8 = num_from_env!("PIN_QR_RX", u8);
    const PIN_TX: u8 = num_from_env!("PIN_QR_TX", u8);
    let cfg = Config::default().with_baudrate(9600);

    Ok(QrScanner {
        uart: new_uart(uart, cfg, PIN_RX, PIN_TX)?,
        line: String::new(),
        overflow: false,
    })
}
