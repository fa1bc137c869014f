//! Native asynchronous serial port support for the locker link.
//!
//! Uses the [`serial2-tokio`](https://crates.io/crates/serial2-tokio) crate.

extern crate std;

use crate::{
    Error,
    clock::{Clock, Instant},
    frame::BAUD_RATE,
};
use core::time::Duration;
use embedded_io_adapters::tokio_1::FromTokio;
use embedded_io_async::ErrorType;
use serial2_tokio::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};

/// Serial port type implementing [`Read`](embedded_io_async::Read)
/// and [`Write`](embedded_io_async::Write).
pub type Port = FromTokio<SerialPort>;

/// Port-specific error type to be used as `E` for the generic [`Error<E>`] type.
pub type PortError = <Port as ErrorType>::Error;

/// Opens a native serial port at the given path, configured for 115200 baud 8N1.
///
/// Returns a [`Port`] that can be passed to
/// [`Controller::new`](crate::controller::Controller::new) or
/// [`Station::new`](crate::actuator::Station::new).
pub fn open(path: &str) -> Result<Port, Error<std::io::Error>> {
    let port = SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(BAUD_RATE)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_parity(Parity::None);
        settings.set_stop_bits(StopBits::One);
        settings.set_flow_control(FlowControl::None);

        Ok(settings)
    })?;

    port.discard_buffers()?;

    Ok(FromTokio::new(port))
}

/// [`Clock`] backed by the tokio timer.
///
/// Time is measured from the creation of the clock.
#[derive(Copy, Clone, Debug)]
pub struct TokioClock {
    start: tokio::time::Instant,
}

impl TokioClock {
    /// Constructs a clock starting at [`Instant::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        let elapsed = self.start.elapsed().as_millis();

        Instant::from_millis(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(self.start + Duration::from_millis(deadline.as_millis())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock() {
        let clock = TokioClock::new();

        assert_eq!(clock.now(), Instant::ZERO);

        clock.sleep_until(Instant::from_millis(1500)).await;

        assert_eq!(
            clock.now(),
            Instant::from_millis(1500),
            "clock should follow the tokio timer"
        );
    }
}
