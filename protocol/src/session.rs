//! Delivery and pickup transactions.
//!
//! A [`Session`] is a pure state machine: it asks for commands through
//! [`Session::pending_command`] and is fed their outcomes, events, lock
//! states and time by the [`Controller`](crate::controller::Controller).
//! It never touches the port itself.
//!
//! ```text
//! Idle ─► AwaitingUnlock ─OK─► AwaitingDoorEvent ─DoorClosed─► AwaitingRelock ─Locked─► Completed
//!              │                      │                               │
//!              └──────────────────────┴───────────────────────────────┴─► Aborted(reason)
//! ```

use crate::{
    clock::Instant,
    config::Config,
    event::Event,
    frame::{Command, LockId},
    lock::{FaultReason, LockState},
};
use alloc::{string::String, vec::Vec};
use core::fmt::{Display, Formatter};
use log::{error, info, warn};
use serde::Serialize;
use strum::{Display, EnumString};

/// Kind of transaction.
#[derive(EnumString, Display, Serialize, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// A courier drops off a parcel.
    Delivery,
    /// A recipient collects a parcel or payment.
    Pickup,
}

/// Why a session was aborted.
#[derive(Serialize, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Commands kept timing out or hitting a busy link.
    ControllerUnreachable,
    /// The door sensor did not corroborate the relock.
    SensorMismatch,
    /// A door was opened without authorization.
    Unauthorized,
    /// The lock faulted for another reason.
    LockFault,
    /// The door was not closed in time.
    DoorTimeout,
    /// The actuator kept rejecting commands with the given code.
    Rejected(String),
    /// The session was cancelled by the operator.
    Cancelled,
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::ControllerUnreachable => write!(f, "controller unreachable"),
            Self::SensorMismatch => write!(f, "sensor mismatch"),
            Self::Unauthorized => write!(f, "unauthorized access"),
            Self::LockFault => write!(f, "lock fault"),
            Self::DoorTimeout => write!(f, "door not closed in time"),
            Self::Rejected(code) => write!(f, "rejected ({code})"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Progress of a session.
#[derive(Serialize, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not started.
    Idle,
    /// Waiting for `AT+LOCK` to be acknowledged.
    AwaitingUnlock,
    /// Lock open, waiting for the door to be closed.
    AwaitingDoorEvent,
    /// Door closed, waiting for the lock to be corroborated as locked.
    AwaitingRelock,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Aborted(AbortReason),
}

impl SessionState {
    /// Returns `true` for [`SessionState::Completed`] and [`SessionState::Aborted`].
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted(_))
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::AwaitingUnlock => write!(f, "Unlocking"),
            Self::AwaitingDoorEvent => write!(f, "Waiting for door"),
            Self::AwaitingRelock => write!(f, "Relocking"),
            Self::Completed => write!(f, "Completed"),
            Self::Aborted(reason) => write!(f, "Aborted: {reason}"),
        }
    }
}

/// Result of executing a session command.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Outcome {
    /// `OK`.
    Ok,
    /// `ERROR:<code>`.
    Rejected(String),
    /// No response or link busy.
    Unreachable,
}

/// Timestamped state change of a session.
#[derive(Serialize, PartialEq, Eq, Clone, Debug)]
pub struct TimelineEntry {
    /// Time of the change.
    pub at: Instant,
    /// New state.
    pub state: SessionState,
}

/// Finished session, as published to the `/parcels` mirror path.
#[derive(Serialize, PartialEq, Eq, Clone, Debug)]
pub struct SessionRecord {
    /// Lock used by the session.
    pub lock: LockId,
    /// Kind of transaction.
    pub kind: SessionKind,
    /// Parcel or payment reference.
    pub reference: String,
    /// Final state.
    pub outcome: SessionState,
    /// Every state change, oldest first.
    pub timeline: Vec<TimelineEntry>,
}

/// One delivery or pickup on a single lock.
#[derive(Debug)]
pub struct Session {
    lock: LockId,
    kind: SessionKind,
    reference: String,
    timeline: Vec<TimelineEntry>,
    failures: u8,
    retry_at: Instant,
    door_deadline: Option<Instant>,
    relock_acked: bool,
    cancelled: bool,
}

impl Session {
    /// Constructs a session in [`SessionState::Idle`].
    #[must_use]
    pub fn new(lock: LockId, kind: SessionKind, reference: String, now: Instant) -> Self {
        Self {
            lock,
            kind,
            reference,
            timeline: Vec::from([TimelineEntry {
                at: now,
                state: SessionState::Idle,
            }]),
            failures: 0,
            retry_at: now,
            door_deadline: None,
            relock_acked: false,
            cancelled: false,
        }
    }

    /// Starts the session by requesting the lock to open.
    pub fn start(&mut self, now: Instant) {
        if self.state() == &SessionState::Idle {
            info!(
                "Starting {} session {:?} on {}",
                self.kind, self.reference, self.lock
            );

            self.set(SessionState::AwaitingUnlock, now);
        }
    }

    /// Returns the lock used by the session.
    #[must_use]
    pub fn lock(&self) -> LockId {
        self.lock
    }

    /// Returns the kind of transaction.
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Returns the parcel or payment reference.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        // Timeline always holds at least the initial state
        &self.timeline[self.timeline.len() - 1].state
    }

    /// Returns every state change, oldest first.
    #[must_use]
    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    /// Returns `true` once the session completed or aborted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Returns the command the session wants executed now, if any.
    ///
    /// Respects the retry backoff and never asks for anything once a
    /// cancellation is pending.
    #[must_use]
    pub fn pending_command(&self, now: Instant) -> Option<Command> {
        if self.cancelled || now < self.retry_at {
            return None;
        }

        match self.state() {
            SessionState::AwaitingUnlock => Some(Command::LockOpen(self.lock)),
            SessionState::AwaitingRelock if !self.relock_acked => {
                Some(Command::LockClose(self.lock))
            }
            _ => None,
        }
    }

    /// Returns the earliest instant at which the session wants to be advanced.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state() {
            SessionState::AwaitingUnlock => Some(self.retry_at),
            SessionState::AwaitingDoorEvent => self.door_deadline,
            SessionState::AwaitingRelock if !self.relock_acked => Some(self.retry_at),
            _ => None,
        }
    }

    /// Applies the outcome of the command returned by [`Session::pending_command`].
    ///
    /// Failed attempts are retried up to [`Config::max_retries`] times with
    /// linear backoff.
    pub fn on_outcome(&mut self, outcome: Outcome, now: Instant, config: &Config) {
        if self.is_finished() {
            return;
        }

        let code = match outcome {
            Outcome::Ok => {
                self.failures = 0;

                match self.state().clone() {
                    SessionState::AwaitingUnlock => {
                        self.door_deadline = Some(now + config.door_timeout);
                        self.set(SessionState::AwaitingDoorEvent, now);
                    }
                    SessionState::AwaitingRelock => self.relock_acked = true,
                    _ => {}
                }

                return;
            }
            Outcome::Rejected(code) => Some(code),
            Outcome::Unreachable => None,
        };

        self.failures = self.failures.saturating_add(1);

        if self.failures > config.max_retries {
            let reason = code.map_or(AbortReason::ControllerUnreachable, AbortReason::Rejected);

            self.abort(reason, now);
        } else {
            let backoff = config.backoff(self.failures);

            warn!(
                "Session on {} retrying in {backoff:?} (attempt {}/{})",
                self.lock,
                self.failures + 1,
                config.max_retries + 1
            );

            self.retry_at = now + backoff;
        }
    }

    /// Applies an event received from the actuator controller.
    pub fn on_event(&mut self, event: &Event, now: Instant) {
        if self.is_finished() || !event.concerns(self.lock) {
            return;
        }

        match (self.state().clone(), event) {
            (SessionState::AwaitingDoorEvent, Event::DoorClosed(_)) => {
                self.door_deadline = None;
                self.failures = 0;
                self.retry_at = now;
                self.set(SessionState::AwaitingRelock, now);
            }
            (SessionState::Idle, _) | (_, Event::DoorClosed(_)) => {}
            (_, Event::Unauthorized(_)) => self.abort(AbortReason::Unauthorized, now),
            _ => {}
        }
    }

    /// Applies the current state of the session's lock.
    pub fn on_lock(&mut self, state: LockState, now: Instant) {
        if self.is_finished() {
            return;
        }

        match state {
            LockState::Fault(reason) => {
                let reason = match reason {
                    FaultReason::Unauthorized => AbortReason::Unauthorized,
                    FaultReason::SensorMismatch => AbortReason::SensorMismatch,
                    FaultReason::Uninitialized | FaultReason::CommandFailed => {
                        AbortReason::LockFault
                    }
                };

                self.abort(reason, now);
            }
            LockState::Locked
                if self.state() == &SessionState::AwaitingRelock && self.relock_acked =>
            {
                info!("Session {:?} on {} completed", self.reference, self.lock);

                self.set(SessionState::Completed, now);
            }
            _ => {}
        }
    }

    /// Applies the passing of time and pending cancellations.
    pub fn expire(&mut self, now: Instant) {
        if self.is_finished() {
            return;
        }

        if self.cancelled {
            self.abort(AbortReason::Cancelled, now);
        } else if self.state() == &SessionState::AwaitingDoorEvent
            && self.door_deadline.is_some_and(|deadline| now >= deadline)
        {
            self.abort(AbortReason::DoorTimeout, now);
        }
    }

    /// Requests cancellation, applied on the next [`Session::expire`].
    pub fn cancel(&mut self) {
        if !self.is_finished() {
            self.cancelled = true;
        }
    }

    /// Converts a finished session into its archived form.
    #[must_use]
    pub fn into_record(self) -> SessionRecord {
        SessionRecord {
            lock: self.lock,
            kind: self.kind,
            reference: self.reference,
            outcome: self.timeline[self.timeline.len() - 1].state.clone(),
            timeline: self.timeline,
        }
    }

    fn abort(&mut self, reason: AbortReason, now: Instant) {
        error!(
            "Session {:?} on {} aborted: {reason}",
            self.reference, self.lock
        );

        self.set(SessionState::Aborted(reason), now);
    }

    fn set(&mut self, state: SessionState, now: Instant) {
        self.timeline.push(TimelineEntry { at: now, state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;
    use core::time::Duration;

    fn at(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    fn started(lock: LockId) -> Session {
        let mut session = Session::new(lock, SessionKind::Delivery, "PX-1".into(), at(0));

        session.start(at(0));
        session
    }

    #[test]
    fn happy_path() {
        init_logger();

        let config = Config::default();
        let mut session = started(LockId::Parcel);

        assert_eq!(
            session.pending_command(at(0)),
            Some(Command::LockOpen(LockId::Parcel))
        );

        session.on_outcome(Outcome::Ok, at(100), &config);

        assert_eq!(session.state(), &SessionState::AwaitingDoorEvent);
        assert_eq!(session.pending_command(at(100)), None);

        session.on_event(&Event::DoorClosed(LockId::Parcel), at(5000));

        assert_eq!(
            session.pending_command(at(5000)),
            Some(Command::LockClose(LockId::Parcel))
        );

        session.on_outcome(Outcome::Ok, at(5100), &config);
        session.on_lock(LockState::Transitioning, at(5100));

        assert_eq!(session.state(), &SessionState::AwaitingRelock);

        session.on_lock(LockState::Locked, at(5200));

        assert_eq!(session.state(), &SessionState::Completed);

        let record = session.into_record();

        assert_eq!(record.outcome, SessionState::Completed);
        assert_eq!(record.timeline.len(), 5, "every state should be recorded");
    }

    #[test]
    fn retries_with_linear_backoff() {
        init_logger();

        let config = Config::default();
        let mut session = started(LockId::Payment);
        let mut now = at(0);

        for attempt in 1..=3 {
            assert!(session.pending_command(now).is_some());

            session.on_outcome(Outcome::Unreachable, now, &config);

            let retry_at = now + config.retry_backoff * attempt;

            let before = Instant::from_millis(retry_at.as_millis() - 1);

            assert_eq!(session.pending_command(before), None);
            assert_eq!(session.next_deadline(), Some(retry_at));

            now = retry_at;
        }

        session.on_outcome(Outcome::Unreachable, now, &config);

        assert_eq!(
            session.state(),
            &SessionState::Aborted(AbortReason::ControllerUnreachable)
        );
    }

    #[test]
    fn rejected_exhaustion() {
        let config = Config::default().with_retries(0, Duration::ZERO);
        let mut session = started(LockId::Parcel);

        session.on_outcome(Outcome::Rejected("JAM".into()), at(0), &config);

        assert_eq!(
            session.state(),
            &SessionState::Aborted(AbortReason::Rejected("JAM".into()))
        );
    }

    #[test]
    fn door_timeout() {
        let config = Config::default();
        let mut session = started(LockId::Parcel);

        session.on_outcome(Outcome::Ok, at(0), &config);
        session.expire(at(59_999));

        assert_eq!(session.state(), &SessionState::AwaitingDoorEvent);

        session.expire(at(60_000));

        assert_eq!(
            session.state(),
            &SessionState::Aborted(AbortReason::DoorTimeout)
        );
    }

    #[test]
    fn unauthorized_aborts() {
        let config = Config::default();
        let mut session = started(LockId::Payment);

        session.on_outcome(Outcome::Ok, at(0), &config);
        session.on_event(&Event::Unauthorized(Some(LockId::Parcel)), at(10));

        assert_eq!(session.state(), &SessionState::AwaitingDoorEvent, "other lock");

        session.on_event(&Event::Unauthorized(None), at(20));

        assert_eq!(
            session.state(),
            &SessionState::Aborted(AbortReason::Unauthorized)
        );
    }

    #[test]
    fn lock_fault_aborts() {
        let config = Config::default();
        let mut session = started(LockId::Parcel);

        session.on_outcome(Outcome::Ok, at(0), &config);
        session.on_event(&Event::DoorClosed(LockId::Parcel), at(10));
        session.on_outcome(Outcome::Ok, at(20), &config);
        session.on_lock(LockState::Fault(FaultReason::SensorMismatch), at(2020));

        assert_eq!(
            session.state(),
            &SessionState::Aborted(AbortReason::SensorMismatch)
        );
    }

    #[test]
    fn cancel_on_next_expire() {
        let mut session = started(LockId::Parcel);

        session.cancel();

        assert_eq!(session.pending_command(at(0)), None, "no new command after cancel");
        assert_eq!(session.state(), &SessionState::AwaitingUnlock);

        session.expire(at(1));

        assert_eq!(session.state(), &SessionState::Aborted(AbortReason::Cancelled));
    }
}
