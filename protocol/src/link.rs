//! Command/response correlation over a [`Framer`].
//!
//! The protocol is half-duplex: after a command is written, the next `OK`
//! or `ERROR:` line is its response. A [`Link`] therefore allows exactly one
//! command in flight and fails any concurrent attempt with [`Error::Busy`]
//! instead of waiting. Events received while waiting are forwarded to the
//! link's [`EventQueue`].

use crate::{
    Error, Result,
    clock::Clock,
    event::{Event, EventQueue},
    frame::{Command, Frame},
    framer::Framer,
};
use alloc::string::String;
use core::time::Duration;
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, mutex::Mutex};
use embedded_io_async::{Read, Write};
use log::{debug, warn};

/// Default time to wait for a command's response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal response to a command.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Response {
    /// `OK`, with the `STATUS:` payload received before it, if any.
    Ok(Option<String>),
    /// `ERROR:<code>`.
    Error(String),
}

/// Exclusive command channel to the actuator controller.
///
/// The link owns the port and is its only writer.
pub struct Link<P, C> {
    framer: Mutex<NoopRawMutex, Framer<P>>,
    clock: C,
    events: EventQueue,
    response_timeout: Duration,
}

impl<P: Read + Write, C: Clock> Link<P, C> {
    /// Constructs a new link using [`DEFAULT_RESPONSE_TIMEOUT`].
    pub fn new(framer: Framer<P>, clock: C) -> Self {
        Self {
            framer: Mutex::new(framer),
            clock,
            events: EventQueue::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Sets the time to wait for a command's response.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Returns the link's clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Returns the queue that received events are forwarded to.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Removes and returns the oldest received event.
    pub fn next_event(&self) -> Option<Event> {
        self.events.next_event()
    }

    /// Sends a command and waits for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if another command is in flight.
    /// - [`Error::NoResponse`] if no response arrived within the response timeout.
    pub async fn execute(&self, cmd: &Command) -> Result<Response, P::Error> {
        self.execute_with_timeout(cmd, self.response_timeout).await
    }

    /// Sends a command and waits up to `timeout` for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if another command is in flight.
    /// - [`Error::NoResponse`] if no response arrived within `timeout`.
    pub async fn execute_with_timeout(
        &self,
        cmd: &Command,
        timeout: Duration,
    ) -> Result<Response, P::Error> {
        let Ok(mut framer) = self.framer.try_lock() else {
            warn!("Rejecting {cmd}, another command is in flight");

            return Err(Error::Busy);
        };

        // Lines received before the command was sent cannot answer it
        while let Some(frame) = framer.take_buffered() {
            self.dispatch(frame);
        }

        debug!("Executing {cmd}");
        framer.send(&Frame::Command(cmd.clone())).await?;

        let deadline = self.clock.now() + timeout;
        let mut status = None;

        loop {
            match framer.poll_frame(&self.clock, deadline).await {
                Ok(Frame::Ok) => {
                    debug!("{cmd} acknowledged");

                    return Ok(Response::Ok(status));
                }
                Ok(Frame::Error(code)) => {
                    warn!("{cmd} rejected: {code}");

                    return Ok(Response::Error(code));
                }
                Ok(Frame::Status(payload)) => status = Some(payload),
                Ok(frame) => {
                    self.dispatch(frame);
                }
                Err(Error::Timeout) => {
                    warn!("No response to {cmd} within {timeout:?}");

                    return Err(Error::NoResponse);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads frames for `window` while no command is in flight.
    ///
    /// Events are forwarded to the event queue, responses that do not
    /// belong to any command are discarded.
    /// Returns the number of events received.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if a command is in flight.
    pub async fn pump(&self, window: Duration) -> Result<usize, P::Error> {
        let Ok(mut framer) = self.framer.try_lock() else {
            return Err(Error::Busy);
        };
        let deadline = self.clock.now() + window;
        let mut count = 0;

        loop {
            match framer.poll_frame(&self.clock, deadline).await {
                Ok(frame) => {
                    if self.dispatch(frame) {
                        count += 1;
                    }
                }
                Err(Error::Timeout) => return Ok(count),
                Err(err) => return Err(err),
            }
        }
    }

    /// Handles a frame that is not the response of a pending command.
    ///
    /// Returns `true` if an event was queued.
    fn dispatch(&self, frame: Frame) -> bool {
        match frame {
            Frame::Event(event) => self.events.push(event),
            Frame::Status(payload) => self.events.push(Event::Status(payload)),
            Frame::Ok | Frame::Error(_) => {
                warn!("Discarding uncorrelated response: {frame}");

                return false;
            }
            Frame::Command(cmd) => {
                warn!("Ignoring command sent by peer: {cmd}");

                return false;
            }
            Frame::Malformed(raw) => {
                warn!("Discarding malformed line: {raw:?}");

                return false;
            }
        }

        true
    }
}
