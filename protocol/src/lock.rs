//! Per-lock state arbitration between relay actuation and door sensing.
//!
//! Relay commands and door sensor readings come from two independent
//! circuits. A [`LockMachine`] only reports [`LockState::Locked`] once the
//! actuator acknowledged `AT-LOCK` *and* a `DoorClosed` event was observed
//! afterwards, so a jammed door is never reported as secured.
//!
//! ```text
//!             LockOpen ack               grace expired / door open
//!   Locked ──────────────► Transitioning ─────────────────────────► Unlocked
//!     ▲                      │    ▲                                    │
//!     │  DoorClosed          │    │ LockClose ack                      │
//!     └──────────────────────┘    └────────────────────────────────────┘
//!
//!   any state ── Unauthorized / repeated ERROR / sensor mismatch ──► Fault
//!   Fault ── reset, LockClose ack, DoorClosed ──► Locked
//! ```

use crate::{
    clock::Instant,
    event::Event,
    frame::{DoorState, LockId},
};
use core::{
    fmt::{Display, Formatter},
    time::Duration,
};
use log::{error, info, warn};
use serde::Serialize;
use strum::Display;

/// Reason a lock entered [`LockState::Fault`].
#[derive(Display, Serialize, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "title_case")]
#[serde(rename_all = "snake_case")]
pub enum FaultReason {
    /// The lock has not been homed since startup.
    Uninitialized,
    /// A door was opened without authorization.
    Unauthorized,
    /// The actuator controller rejected consecutive commands.
    CommandFailed,
    /// The door sensor disagreed with the commanded state beyond the grace period.
    SensorMismatch,
}

/// Arbitrated state of a lock.
#[derive(Serialize, PartialEq, Eq, Copy, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Relay released and door closed.
    Locked,
    /// Relay energized.
    Unlocked,
    /// Actuation acknowledged, waiting for sensor corroboration.
    Transitioning,
    /// The lock refuses automated commands until it is reset.
    Fault(FaultReason),
}

impl Display for LockState {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Locked => write!(f, "Locked"),
            Self::Unlocked => write!(f, "Unlocked"),
            Self::Transitioning => write!(f, "Transitioning"),
            Self::Fault(reason) => write!(f, "Fault ({reason})"),
        }
    }
}

/// Direction of the last acknowledged relay command.
#[derive(Serialize, PartialEq, Eq, Copy, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Actuation {
    /// `AT+LOCK` was acknowledged.
    Open,
    /// `AT-LOCK` was acknowledged.
    Close,
}

/// A change of [`LockState`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Transition {
    /// Affected lock.
    pub lock: LockId,
    /// State before the change.
    pub from: LockState,
    /// State after the change.
    pub to: LockState,
    /// When the change happened.
    pub at: Instant,
}

/// Current view of a lock, as published to the cloud mirror.
#[derive(Serialize, PartialEq, Eq, Copy, Clone, Debug)]
pub struct LockSnapshot {
    /// The lock.
    pub lock: LockId,
    /// Arbitrated state.
    pub state: LockState,
    /// Last acknowledged relay command.
    pub commanded: Option<Actuation>,
    /// Last sensed door state.
    pub door: Option<DoorState>,
    /// Time of the last state change.
    pub since: Instant,
}

/// State machine of a single lock.
///
/// All inputs are fed by the controller: command outcomes, events, sensor
/// readings and the passing of time. Every method returns the resulting
/// [`Transition`], if the state changed.
///
/// [`LockState::Fault`] is sticky. Only [`LockMachine::begin_reset`] followed
/// by an acknowledged `AT-LOCK` and a corroborating `DoorClosed` leaves it.
#[derive(Debug)]
pub struct LockMachine {
    id: LockId,
    state: LockState,
    commanded: Option<Actuation>,
    sensed: Option<DoorState>,
    since: Instant,
    deadline: Option<Instant>,
    mismatch_since: Option<Instant>,
    failures: u8,
    resetting: bool,
    grace: Duration,
    max_failures: u8,
}

impl LockMachine {
    /// Constructs a machine in `Fault(Uninitialized)`.
    #[must_use]
    pub fn new(id: LockId, grace: Duration, max_failures: u8) -> Self {
        Self {
            id,
            state: LockState::Fault(FaultReason::Uninitialized),
            commanded: None,
            sensed: None,
            since: Instant::ZERO,
            deadline: None,
            mismatch_since: None,
            failures: 0,
            resetting: false,
            grace,
            max_failures,
        }
    }

    /// Returns the lock this machine arbitrates.
    #[must_use]
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LockState {
        self.state
    }

    /// Returns `true` if the lock accepts new sessions.
    #[must_use]
    pub fn is_commandable(&self) -> bool {
        !matches!(self.state, LockState::Fault(_))
    }

    /// Returns `true` while a reset is waiting for corroboration.
    #[must_use]
    pub fn is_resetting(&self) -> bool {
        self.resetting
    }

    /// Returns the current view of the lock.
    #[must_use]
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            lock: self.id,
            state: self.state,
            commanded: self.commanded,
            door: self.sensed,
            since: self.since,
        }
    }

    /// Returns the earliest instant at which [`LockMachine::expire`] may change the state.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            LockState::Transitioning => self.deadline,
            LockState::Locked => self.mismatch_since.map(|t| t + self.grace),
            _ => None,
        }
    }

    /// Changes the sensor grace period for future actuations.
    pub fn set_grace_period(&mut self, grace: Duration) {
        self.grace = grace;
    }

    /// Prepares a faulted lock for re-homing.
    ///
    /// Returns `false` (and does nothing) unless the lock is faulted.
    pub fn begin_reset(&mut self) -> bool {
        if self.is_commandable() {
            return false;
        }

        info!("Resetting {} from {}", self.id, self.state);

        self.resetting = true;
        self.failures = 0;

        true
    }

    /// Applies an acknowledged relay command.
    pub fn command_acknowledged(&mut self, act: Actuation, now: Instant) -> Option<Transition> {
        self.failures = 0;

        match (self.state, act) {
            (LockState::Fault(_), Actuation::Close) if self.resetting => {
                self.start_transition(act, now)
            }
            // Sticky until reset
            (LockState::Fault(_), _) => None,
            (LockState::Locked, Actuation::Close) | (LockState::Unlocked, Actuation::Open) => {
                self.commanded = Some(act);

                None
            }
            _ => self.start_transition(act, now),
        }
    }

    /// Applies an `ERROR:` reply to a command for this lock.
    pub fn command_failed(&mut self, now: Instant) -> Option<Transition> {
        self.failures = self.failures.saturating_add(1);

        if self.failures < self.max_failures {
            warn!(
                "Command for {} failed ({}/{})",
                self.id, self.failures, self.max_failures
            );

            return None;
        }

        if self.resetting {
            self.resetting = false;
        } else if !self.is_commandable() {
            return None;
        }

        self.fault(FaultReason::CommandFailed, now)
    }

    /// Applies an event received from the actuator controller.
    pub fn observe(&mut self, event: &Event, now: Instant) -> Option<Transition> {
        if !event.concerns(self.id) {
            return None;
        }

        match event {
            Event::DoorClosed(_) => {
                self.sensed = Some(DoorState::Closed);
                self.mismatch_since = None;

                if self.state == LockState::Transitioning
                    && self.commanded == Some(Actuation::Close)
                {
                    self.resetting = false;
                    self.deadline = None;

                    return self.set(LockState::Locked, now);
                }

                None
            }
            Event::Unauthorized(_) => {
                if self.state == LockState::Fault(FaultReason::Unauthorized) {
                    return None;
                }

                self.resetting = false;
                self.fault(FaultReason::Unauthorized, now)
            }
            Event::SystemError(_) | Event::Status(_) => None,
        }
    }

    /// Applies a door sensor reading.
    pub fn sense(&mut self, door: DoorState, now: Instant) -> Option<Transition> {
        self.sensed = Some(door);

        match (self.state, door) {
            (LockState::Transitioning, DoorState::Open)
                if self.commanded == Some(Actuation::Open) =>
            {
                self.deadline = None;
                self.set(LockState::Unlocked, now)
            }
            (LockState::Locked, DoorState::Open) => {
                self.mismatch_since.get_or_insert(now);

                self.expire(now)
            }
            (LockState::Locked, DoorState::Closed) => {
                self.mismatch_since = None;

                None
            }
            _ => None,
        }
    }

    /// Applies the passing of time.
    pub fn expire(&mut self, now: Instant) -> Option<Transition> {
        let deadline = self.next_deadline()?;

        if now < deadline {
            return None;
        }

        match (self.state, self.commanded) {
            (LockState::Transitioning, Some(Actuation::Open)) => {
                self.deadline = None;
                self.set(LockState::Unlocked, now)
            }
            (LockState::Transitioning, _) => {
                error!("{} not corroborated closed within {:?}", self.id, self.grace);

                self.resetting = false;
                self.fault(FaultReason::SensorMismatch, now)
            }
            (LockState::Locked, _) => {
                error!("{} reported open while locked", self.id);

                self.fault(FaultReason::SensorMismatch, now)
            }
            _ => None,
        }
    }

    fn start_transition(&mut self, act: Actuation, now: Instant) -> Option<Transition> {
        self.commanded = Some(act);
        self.deadline = Some(now + self.grace);
        self.mismatch_since = None;

        self.set(LockState::Transitioning, now)
    }

    fn fault(&mut self, reason: FaultReason, now: Instant) -> Option<Transition> {
        error!("{} faulted: {reason}", self.id);

        self.deadline = None;
        self.mismatch_since = None;

        self.set(LockState::Fault(reason), now)
    }

    fn set(&mut self, to: LockState, now: Instant) -> Option<Transition> {
        let from = self.state;

        if from == to {
            return None;
        }

        info!("{}: {from} -> {to}", self.id);

        self.state = to;
        self.since = now;

        Some(Transition {
            lock: self.id,
            from,
            to,
            at: now,
        })
    }
}
