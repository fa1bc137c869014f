//! Line framing on top of a byte-oriented port.

use crate::{
    Error, Result,
    clock::{Clock, Instant},
    frame::Frame,
};
use alloc::{
    collections::vec_deque::VecDeque,
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::time::Duration;
use embassy_futures::select::{Either, select};
use embedded_io_async::{Read, Write};
use log::{trace, warn};

/// Longest line accepted by default, matching the actuator controller's input buffer.
pub const DEFAULT_MAX_LINE_LEN: usize = 64;

/// Back-off used when the port reports that no data is available.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Splits incoming bytes into lines and parses them into [`Frame`]s.
///
/// Partial lines are kept across calls. Lines longer than the configured
/// maximum are dropped up to their terminator, so the following line is
/// still received intact.
#[derive(Debug)]
pub struct Framer<P> {
    port: P,
    line: Vec<u8>,
    discarding: bool,
    ready: VecDeque<String>,
    max_len: usize,
}

impl<P: Read + Write> Framer<P> {
    /// Constructs a new framer using [`DEFAULT_MAX_LINE_LEN`].
    pub fn new(port: P) -> Self {
        Self {
            port,
            line: Vec::new(),
            discarding: false,
            ready: VecDeque::new(),
            max_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    /// Sets the longest accepted line length.
    #[must_use]
    pub fn with_max_line_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Writes a frame in its canonical form, terminated by `\n`.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), P::Error> {
        let line = format!("{frame}\n");

        trace!("Write to port: {:?}", line.trim_end());
        self.port.write_all(line.as_bytes()).await?;
        self.port.flush().await?;

        Ok(())
    }

    /// Returns the next complete frame.
    ///
    /// Already buffered lines are returned even if the deadline has passed.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no complete line arrived before `deadline`.
    pub async fn poll_frame<C: Clock>(
        &mut self,
        clock: &C,
        deadline: Instant,
    ) -> Result<Frame, P::Error> {
        loop {
            if let Some(frame) = self.take_buffered() {
                return Ok(frame);
            }

            let now = clock.now();

            if now >= deadline {
                return Err(Error::Timeout);
            }

            let mut chunk = [0x00; 32];
            let res = select(self.port.read(&mut chunk), clock.sleep_until(deadline)).await;

            match res {
                Either::First(Ok(0)) => {
                    // Nothing available, check again shortly
                    clock.sleep_until(deadline.min(now + IDLE_POLL)).await;
                }
                Either::First(Ok(len)) => self.push_bytes(&chunk[..len]),
                Either::First(Err(err)) => return Err(err.into()),
                Either::Second(()) => {}
            }
        }
    }

    /// Returns the next line that was already received, without touching the port.
    pub fn take_buffered(&mut self) -> Option<Frame> {
        let line = self.ready.pop_front()?;

        trace!("Read from port: {line:?}");

        Some(Frame::parse(&line))
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    let line = String::from_utf8_lossy(&self.line);
                    let line = line.trim_end();

                    if !line.is_empty() {
                        self.ready.push_back(line.to_string());
                    }
                }

                self.line.clear();
            } else if b == b'\r' {
                // Not part of the line, CRLF input must fit the same bound
            } else if self.discarding {
                // Skip the rest of an overlong line
            } else if self.line.len() >= self.max_len {
                warn!("Line exceeds {} bytes, dropping it", self.max_len);
                self.line.clear();
                self.discarding = true;
            } else {
                self.line.push(b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::Event,
        frame::{Command, LockId},
        tests::{ManualClock, MockPort, init_logger},
    };
    use alloc::vec;
    use core::convert::Infallible;

    #[tokio::test]
    async fn send_canonical_line() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut framer = Framer::new(port.clone());

        framer
            .send(&Frame::Command(Command::LockClose(LockId::Payment)))
            .await?;

        assert_eq!(port.sent(), vec!["AT-LOCK 2"], "line should be written");

        Ok(())
    }

    #[tokio::test]
    async fn partial_lines() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let clock = ManualClock::new();
        let mut framer = Framer::new(port.clone());
        let deadline = clock.now() + Duration::from_secs(1);

        port.feed("EVENT:DOOR_");

        assert_eq!(
            framer.poll_frame(&clock, deadline).await,
            Err(Error::Timeout),
            "partial line should not produce a frame"
        );

        port.feed("CLOSED 1\r\nOK\n");

        let deadline = clock.now() + Duration::from_secs(1);

        assert_eq!(
            framer.poll_frame(&clock, deadline).await?,
            Frame::Event(Event::DoorClosed(LockId::Parcel))
        );
        assert_eq!(framer.poll_frame(&clock, deadline).await?, Frame::Ok);

        Ok(())
    }

    #[tokio::test]
    async fn overlong_line_is_dropped() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let clock = ManualClock::new();
        let mut framer = Framer::new(port.clone()).with_max_line_len(12);
        let deadline = clock.now() + Duration::from_secs(1);

        port.feed("STATUS:DOOR1=OPEN,DOOR2=OPEN\n\nERROR:JAM\n");

        assert_eq!(
            framer.poll_frame(&clock, deadline).await?,
            Frame::Error("JAM".into()),
            "line after the overlong one should be intact"
        );

        Ok(())
    }

    #[tokio::test]
    async fn carriage_return_does_not_count() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let clock = ManualClock::new();
        let mut framer = Framer::new(port.clone()).with_max_line_len(9);
        let deadline = clock.now() + Duration::from_secs(1);

        port.feed("ERROR:JAM\r\nERROR:JAMS\r\nOK\r\n");

        assert_eq!(
            framer.poll_frame(&clock, deadline).await?,
            Frame::Error("JAM".into()),
            "line of exactly the maximum length should be accepted"
        );
        assert_eq!(
            framer.poll_frame(&clock, deadline).await?,
            Frame::Ok,
            "longer line should be dropped"
        );

        Ok(())
    }

    #[tokio::test]
    async fn timeout_respects_deadline() -> Result<(), Infallible> {
        init_logger();

        let clock = ManualClock::new();
        let mut framer = Framer::new(MockPort::new());
        let deadline = clock.now() + Duration::from_millis(250);

        assert_eq!(framer.poll_frame(&clock, deadline).await, Err(Error::Timeout));
        assert_eq!(clock.now(), deadline, "wait should end exactly at the deadline");

        Ok(())
    }
}
