//! Command/event protocol and lock state machine for a dual-controller parcel locker.
//!
//! # Overview
//!
//! A ParcelBox locker is driven by two microcontrollers joined by a serial link:
//!
//! - The **network controller** (ESP32) talks to the cloud, scans QR codes and
//!   decides when a door may open.
//! - The **actuator controller** (Arduino) drives the two lock relays and the
//!   buzzer and watches the reed switches of both doors.
//!
//! The `parcelbox` crate implements both ends of the line protocol between them
//! and the state machines on top of it. It is `no_std` (with `alloc`) and
//! platform-agnostic: ports only need to implement the
//! [`embedded_io_async`] [`Read`](embedded_io_async::Read) and
//! [`Write`](embedded_io_async::Write) traits, time comes from a [`clock::Clock`].
//!
//! Depending on your needs, you can:
//!
//! - Run the whole locker with a [`controller::Controller`], which owns the
//!   link, both [`lock::LockMachine`]s, the delivery/pickup [`session`]s and the
//!   [`history`] log.
//! - Send individual commands through a [`link::Link`].
//! - Implement the actuator side with an [`actuator::Station`].
//!
//! # Getting started
//!
//! The serial link runs at **115200 baud, 8N1**. Every frame is one ASCII line
//! terminated by `\n`:
//!
//! ```text
//! → AT+LOCK 1
//! ← OK
//! ← EVENT:DOOR_CLOSED 1
//! → AT-LOCK 1
//! ← OK
//! ```
//!
//! If you enable the `native-serial` feature, you can open a compatible port
//! using [`serial::open`] and drive it with a [`serial::TokioClock`]:
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> parcelbox::Result<(), parcelbox::serial::PortError> {
//! use parcelbox::{config::Config, controller::Controller, serial::TokioClock};
//!
//! let port = parcelbox::serial::open("/dev/ttyUSB0")?;
//! let mut ctrl = Controller::new(port, TokioClock::new(), Config::default());
//!
//! ctrl.home().await?;
//!
//! loop {
//!     ctrl.tick().await?;
//! }
//! # }
//! ```
//!
//! # Protocol details
//!
//! The link is half-duplex with **positional correlation**: the next `OK` or
//! `ERROR:` line answers the last command sent, there are no sequence numbers.
//! To keep this unambiguous, a [`link::Link`] is the only writer to its port
//! and allows a single command in flight, failing a second one with
//! [`Error::Busy`]. Events (`EVENT:` lines) may arrive at any time,
//! including between a command and its response, and are queued separately.
//!
//! A lock is only reported as locked once the actuator acknowledged `AT-LOCK`
//! *and* the door sensor reported the door as closed afterwards.

#![no_std]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

pub mod actuator;
pub mod clock;
pub mod config;
pub mod controller;
pub mod event;
pub mod frame;
pub mod framer;
pub mod history;
pub mod link;
pub mod lock;
pub mod mirror;
pub mod scan;
pub mod session;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

pub use embedded_io_async;

use core::fmt::{Display, Formatter};

/// A specialized [`Result`] type for protocol operations.
///
/// Uses [`Error<E>`] as the error variant, which can include port-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error type for protocol operations.
///
/// The generic parameter `E` allows the error type to carry a port-specific error.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error<E> {
    /// The deadline passed before a frame was received.
    Timeout,
    /// Another command is already in flight.
    Busy,
    /// The actuator controller did not answer within the response timeout.
    NoResponse,
    /// The operation is not valid in the current state.
    InvalidState,
    /// A port-specific input/output error.
    Io(E),
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::Busy => write!(f, "command already in flight"),
            Self::NoResponse => write!(f, "no response from actuator controller"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::clock::{Clock, Instant};
    use alloc::{
        collections::vec_deque::VecDeque,
        rc::Rc,
        string::{String, ToString},
        vec::Vec,
    };
    use core::{
        cell::{Cell, RefCell},
        convert::Infallible,
        time::Duration,
    };
    use embedded_io_async::{ErrorType, Read, Write};
    use log::LevelFilter;

    pub fn init_logger() {
        let _ = env_logger::builder()
            .filter_level(LevelFilter::max())
            .is_test(true)
            .try_init();
    }

    #[derive(Default)]
    struct MockState {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        replies: VecDeque<&'static str>,
    }

    /// In-memory port standing in for the actuator controller.
    ///
    /// Every complete line written to the port pops the next scripted reply
    /// (if any) into the receive buffer. An empty reply means silence.
    #[derive(Clone, Default)]
    pub struct MockPort(Rc<RefCell<MockState>>);

    impl MockPort {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes bytes available for reading right away.
        pub fn feed(&self, data: &str) {
            self.0.borrow_mut().rx.extend(data.bytes());
        }

        /// Scripts the reply to the next unanswered command line.
        pub fn reply(&self, data: &'static str) {
            self.0.borrow_mut().replies.push_back(data);
        }

        /// Returns all lines written to the port so far.
        pub fn sent(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.borrow().tx)
                .lines()
                .map(ToString::to_string)
                .collect()
        }

        pub fn clear_sent(&self) {
            self.0.borrow_mut().tx.clear();
        }
    }

    impl ErrorType for MockPort {
        type Error = Infallible;
    }

    impl Read for MockPort {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let mut state = self.0.borrow_mut();
            let len = buf.len().min(state.rx.len());

            for (dst, src) in buf.iter_mut().zip(state.rx.drain(..len)) {
                *dst = src;
            }

            Ok(len)
        }
    }

    impl Write for MockPort {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            let mut state = self.0.borrow_mut();

            state.tx.extend_from_slice(buf);

            for _ in buf.iter().filter(|&&b| b == b'\n') {
                if let Some(reply) = state.replies.pop_front() {
                    state.rx.extend(reply.bytes());
                }
            }

            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    /// Clock that only advances when something sleeps on it.
    #[derive(Default)]
    pub struct ManualClock(Cell<u64>);

    impl ManualClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance(&self, by: Duration) {
            self.0.set((Instant::from_millis(self.0.get()) + by).as_millis());
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            Instant::from_millis(self.0.get())
        }

        async fn sleep_until(&self, deadline: Instant) {
            // Give other futures a chance to run first
            embassy_futures::yield_now().await;

            self.0.set(self.0.get().max(deadline.as_millis()));
        }
    }
}
