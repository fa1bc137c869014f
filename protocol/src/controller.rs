//! Cooperative control loop of the network controller.
//!
//! A [`Controller`] owns the [`Link`] to the actuator controller, one
//! [`LockMachine`] and at most one [`Session`] per lock, the transition
//! [`History`] and an outbox of [`Record`]s for the cloud mirror.
//! Nothing is shared: every input is applied from within [`Controller::tick`]
//! or one of the operator methods, which all take `&mut self`.
//!
//! One tick performs, in order:
//!
//! 1. Listen for unsolicited frames for the poll interval.
//! 2. Apply queued events to the locks and sessions, in arrival order.
//! 3. Apply expired grace periods and door timeouts.
//! 4. Issue at most one command: a session command, a relock after an
//!    aborted session, buzzer feedback or the periodic health check.
//!
//! While a command is in flight, events for other locks are applied as
//! soon as they arrive. A `DoorClosed` event for the commanded lock is
//! held back until the command's response has been applied.

use crate::{
    Error, Result,
    clock::{Clock, Instant},
    config::{Config, RemoteConfig},
    event::Event,
    frame::{Command, Frame, LockId, StatusReport, Tone},
    framer::Framer,
    history::{History, Trigger},
    link::{Link, Response},
    lock::{Actuation, FaultReason, LockMachine, LockSnapshot, LockState, Transition},
    mirror::Record,
    session::{Outcome, Session, SessionKind, SessionRecord, SessionState},
};
use alloc::{
    collections::vec_deque::VecDeque,
    string::{String, ToString},
    vec::Vec,
};
use core::{convert::Infallible, mem};
use embassy_futures::select::{Either, select};
use embedded_io_async::{Read, Write};
use log::{debug, error, info, warn};
use serde::Serialize;

/// Number of finished sessions kept for inspection.
const ARCHIVE_LEN: usize = 16;

/// Health of the actuator controller, as published to `/device_status`.
#[derive(Serialize, PartialEq, Eq, Clone, Default, Debug)]
pub struct DeviceStatus {
    /// Time of the last update.
    pub at: Instant,
    /// Whether the last health check was answered.
    pub reachable: bool,
    /// Last status report received.
    pub report: Option<StatusReport>,
    /// Last `SYSTEM_ERROR` detail received.
    pub last_error: Option<String>,
    /// Events lost to a full event queue.
    pub dropped_events: u32,
}

/// State owned by the control loop, apart from the link.
struct Locker {
    config: Config,
    locks: [LockMachine; 2],
    sessions: [Option<Session>; 2],
    history: History,
    archive: VecDeque<SessionRecord>,
    outbox: VecDeque<Record>,
    device: DeviceStatus,
    relock: [bool; 2],
    feedback: VecDeque<Tone>,
    next_health_check: Instant,
}

impl Locker {
    fn new(config: Config, now: Instant) -> Self {
        Self {
            config,
            locks: LockId::ALL.map(|id| {
                LockMachine::new(id, config.grace_period, config.max_consecutive_failures)
            }),
            sessions: [None, None],
            history: History::new(),
            archive: VecDeque::new(),
            outbox: VecDeque::new(),
            device: DeviceStatus::default(),
            relock: [false; 2],
            feedback: VecDeque::new(),
            next_health_check: now + config.health_check_interval,
        }
    }

    fn snapshots(&self) -> [LockSnapshot; 2] {
        self.locks.each_ref().map(LockMachine::snapshot)
    }

    fn publish(&mut self, record: Record) {
        if self.outbox.len() >= self.config.mirror_backlog {
            warn!("Mirror outbox full, dropping oldest record");
            self.outbox.pop_front();
        }

        self.outbox.push_back(record);
    }

    /// Logs a lock transition and publishes it.
    fn record(&mut self, transition: Option<Transition>, trigger: impl FnOnce() -> Trigger) {
        let Some(transition) = transition else {
            return;
        };
        let entry = self.history.append(transition, trigger()).clone();
        let snapshots = self.snapshots();

        self.publish(Record::History(entry));
        self.publish(Record::Locks(snapshots));
    }

    fn apply_event(&mut self, event: Event, now: Instant) {
        debug!("Applying event: {event}");

        match &event {
            Event::Status(payload) => self.apply_status(payload, now),
            Event::SystemError(detail) => {
                error!("Actuator controller reported a system error: {detail}");

                self.device.last_error = Some(detail.clone());
                self.device.at = now;
                self.publish(Record::Device(self.device.clone()));
            }
            Event::DoorClosed(_) | Event::Unauthorized(_) => {
                for id in LockId::ALL {
                    let transition = self.locks[id.index()].observe(&event, now);

                    self.record(transition, || Trigger::Frame(Frame::Event(event.clone())));
                }
            }
        }

        for session in self.sessions.iter_mut().flatten() {
            session.on_event(&event, now);
        }

        self.sync(now);
    }

    fn apply_status(&mut self, payload: &str, now: Instant) {
        let Some(report) = StatusReport::parse(payload) else {
            warn!("Ignoring unrecognized status: {payload:?}");

            return;
        };

        for id in LockId::ALL {
            if let Some(door) = report.door(id) {
                let transition = self.locks[id.index()].sense(door, now);

                self.record(transition, || Trigger::Frame(Frame::Status(payload.to_string())));
            }
        }

        self.device.report = Some(report);
    }

    /// Applies the response of a command to the locks and the device status.
    fn command_done<E>(&mut self, cmd: &Command, res: &Result<Response, E>, now: Instant) {
        match (cmd, res) {
            (Command::LockOpen(id) | Command::LockClose(id), Ok(Response::Ok(_))) => {
                let act = match cmd {
                    Command::LockOpen(_) => Actuation::Open,
                    _ => Actuation::Close,
                };
                let transition = self.locks[id.index()].command_acknowledged(act, now);

                self.record(transition, || Trigger::Acknowledged(cmd.clone()));
            }
            (Command::LockOpen(id) | Command::LockClose(id), Ok(Response::Error(code))) => {
                let transition = self.locks[id.index()].command_failed(now);

                self.record(transition, || Trigger::Rejected(cmd.clone(), code.clone()));
            }
            (Command::SensorRead(_) | Command::StatusQuery, Ok(Response::Ok(Some(payload)))) => {
                self.apply_status(payload, now);
            }
            _ => {}
        }

        if *cmd == Command::StatusQuery {
            self.device.reachable = res.is_ok();
            self.device.at = now;
            self.publish(Record::Device(self.device.clone()));
        }

        self.sync(now);
    }

    fn expire(&mut self, now: Instant) {
        for id in LockId::ALL {
            let transition = self.locks[id.index()].expire(now);

            self.record(transition, || Trigger::GraceExpired);
        }

        for session in self.sessions.iter_mut().flatten() {
            session.expire(now);
        }

        self.sync(now);
    }

    /// Feeds lock states to the sessions and archives finished ones.
    fn sync(&mut self, now: Instant) {
        for id in LockId::ALL {
            let state = self.locks[id.index()].state();
            let slot = &mut self.sessions[id.index()];

            if let Some(session) = slot {
                session.on_lock(state, now);
            }

            if let Some(session) = slot.take_if(|session| session.is_finished()) {
                self.finish(session);
            }
        }
    }

    fn finish(&mut self, session: Session) {
        let id = session.lock();
        let aborted = matches!(session.state(), SessionState::Aborted(_));
        let lock = &self.locks[id.index()];

        if aborted {
            self.feedback.push_back(Tone::Alert);

            // Do not leave the relay energized
            if lock.is_commandable() && lock.snapshot().commanded == Some(Actuation::Open) {
                self.relock[id.index()] = true;
            }
        } else {
            self.feedback.push_back(Tone::Success);
        }

        let record = session.into_record();

        if self.archive.len() >= ARCHIVE_LEN {
            self.archive.pop_front();
        }

        self.archive.push_back(record.clone());
        self.publish(Record::Session(record));
    }
}

/// Network-side controller of the locker.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> parcelbox::Result<(), parcelbox::serial::PortError> {
/// use parcelbox::{
///     config::Config, controller::Controller, frame::LockId, serial::TokioClock,
///     session::SessionKind,
/// };
///
/// let port = parcelbox::serial::open("/dev/ttyUSB0")?;
/// let mut ctrl = Controller::new(port, TokioClock::new(), Config::default());
///
/// ctrl.home().await?;
/// ctrl.begin(LockId::Parcel, SessionKind::Delivery, "PX-1042".into())?;
///
/// while ctrl.session(LockId::Parcel).is_some() {
///     ctrl.tick().await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Controller<P, C> {
    link: Link<P, C>,
    locker: Locker,
}

impl<P: Read + Write, C: Clock> Controller<P, C> {
    /// Constructs a new controller.
    ///
    /// Both locks start in `Fault(Uninitialized)`, see [`Controller::home`].
    pub fn new(port: P, clock: C, config: Config) -> Self {
        let framer = Framer::new(port).with_max_line_len(config.max_line_len);
        let mut link = Link::new(framer, clock);

        link.set_response_timeout(config.response_timeout);

        let now = link.clock().now();

        Self {
            link,
            locker: Locker::new(config, now),
        }
    }

    /// Returns the current time of the controller's clock.
    pub fn now(&self) -> Instant {
        self.link.clock().now()
    }

    /// Returns the link to the actuator controller.
    pub fn link(&self) -> &Link<P, C> {
        &self.link
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &Config {
        &self.locker.config
    }

    /// Returns the state machine of a lock.
    pub fn lock(&self, id: LockId) -> &LockMachine {
        &self.locker.locks[id.index()]
    }

    /// Returns snapshots of both locks.
    pub fn snapshots(&self) -> [LockSnapshot; 2] {
        self.locker.snapshots()
    }

    /// Returns the active session on a lock, if any.
    pub fn session(&self, id: LockId) -> Option<&Session> {
        self.locker.sessions[id.index()].as_ref()
    }

    /// Returns the transition log.
    pub fn history(&self) -> &History {
        &self.locker.history
    }

    /// Returns the most recently finished sessions, oldest first.
    pub fn archive(&self) -> impl Iterator<Item = &SessionRecord> {
        self.locker.archive.iter()
    }

    /// Returns the health of the actuator controller.
    pub fn device_status(&self) -> &DeviceStatus {
        &self.locker.device
    }

    /// Removes and returns the oldest record waiting for the cloud mirror.
    pub fn next_record(&mut self) -> Option<Record> {
        self.locker.outbox.pop_front()
    }

    /// Applies a configuration update from the cloud mirror.
    pub fn apply_config(&mut self, update: &RemoteConfig) {
        let config = &mut self.locker.config;

        config.apply(update);
        self.link.set_response_timeout(config.response_timeout);

        for lock in &mut self.locker.locks {
            lock.set_grace_period(config.grace_period);
        }
    }

    /// Resets every lock that was never homed.
    ///
    /// Locks reach [`LockState::Locked`](crate::lock::LockState::Locked)
    /// once the door sensor corroborates, usually within the next tick.
    /// Other faults are left alone, they need an explicit [`Controller::reset`].
    /// Safe to call again until [`Controller::is_homed`] returns `true`.
    pub async fn home(&mut self) -> Result<(), P::Error> {
        for id in LockId::ALL {
            if self.lock(id).state() != LockState::Fault(FaultReason::Uninitialized) {
                continue;
            }

            match self.reset(id).await {
                Ok(()) => {}
                Err(Error::Io(err)) => return Err(Error::Io(err)),
                Err(err) => warn!("Failed to home {id}: {err:?}"),
            }
        }

        Ok(())
    }

    /// Returns `true` once no lock is waiting to be homed.
    pub fn is_homed(&self) -> bool {
        self.locker
            .locks
            .iter()
            .all(|lock| lock.state() != LockState::Fault(FaultReason::Uninitialized))
    }

    /// Resets a faulted lock by closing it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the lock is not faulted.
    /// - [`Error::NoResponse`] if the actuator controller did not answer.
    pub async fn reset(&mut self, id: LockId) -> Result<(), P::Error> {
        if !self.locker.locks[id.index()].begin_reset() {
            return Err(Error::InvalidState);
        }

        self.run(&Command::LockClose(id)).await.map(|_| ())
    }

    /// Starts a delivery or pickup on a lock.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if a session is already active on the lock
    ///   or the lock is faulted.
    pub fn begin(&mut self, id: LockId, kind: SessionKind, reference: String) -> Result<(), P::Error> {
        let now = self.now();

        if self.session(id).is_some() || !self.lock(id).is_commandable() {
            warn!("Refusing {kind} session on {id}");

            return Err(Error::InvalidState);
        }

        let mut session = Session::new(id, kind, reference, now);

        session.start(now);
        self.locker.sessions[id.index()] = Some(session);

        Ok(())
    }

    /// Cancels the active session on a lock.
    ///
    /// The session is aborted on the next tick. A command already in flight
    /// is never interrupted.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if no session is active on the lock.
    pub fn cancel(&mut self, id: LockId) -> Result<(), P::Error> {
        let session = self.locker.sessions[id.index()]
            .as_mut()
            .ok_or(Error::InvalidState)?;

        info!("Cancelling session {:?} on {id}", session.reference());
        session.cancel();

        Ok(())
    }

    /// Queries the full actuator status and applies it to the locks.
    pub async fn query_status(&mut self) -> Result<Option<StatusReport>, P::Error> {
        match self.run(&Command::StatusQuery).await? {
            Response::Ok(payload) => Ok(payload.as_deref().and_then(StatusReport::parse)),
            Response::Error(_) => Ok(None),
        }
    }

    /// Sounds the buzzer.
    pub async fn buzz(&mut self, tone: Tone) -> Result<Response, P::Error> {
        self.run(&Command::Buzz(tone)).await
    }

    /// Runs one iteration of the control loop.
    ///
    /// Only port errors are returned. Timeouts, rejected commands and faults
    /// are handled internally.
    pub async fn tick(&mut self) -> Result<(), P::Error> {
        let poll = self.locker.config.poll_interval;

        io_only(self.link.pump(poll).await)?;

        let now = self.now();

        while let Some(event) = self.link.next_event() {
            self.locker.apply_event(event, now);
        }

        self.locker.device.dropped_events = self.link.events().dropped();
        self.locker.expire(now);
        self.advance().await
    }

    /// Issues at most one command.
    async fn advance(&mut self) -> Result<(), P::Error> {
        let now = self.now();

        for id in LockId::ALL {
            let Some(cmd) = self
                .session(id)
                .and_then(|session| session.pending_command(now))
            else {
                continue;
            };
            let outcome = match self.run(&cmd).await {
                Ok(Response::Ok(_)) => Outcome::Ok,
                Ok(Response::Error(code)) => Outcome::Rejected(code),
                Err(Error::Io(err)) => return Err(Error::Io(err)),
                Err(_) => Outcome::Unreachable,
            };
            let now = self.now();
            let config = self.locker.config;

            if let Some(session) = self.locker.sessions[id.index()].as_mut() {
                session.on_outcome(outcome, now, &config);
            }

            self.locker.sync(now);

            return Ok(());
        }

        for id in LockId::ALL {
            if mem::take(&mut self.locker.relock[id.index()]) && self.lock(id).is_commandable() {
                info!("Relocking {id} after aborted session");
                io_only(self.run(&Command::LockClose(id)).await)?;

                return Ok(());
            }
        }

        if let Some(tone) = self.locker.feedback.pop_front() {
            io_only(self.run(&Command::Buzz(tone)).await)?;

            return Ok(());
        }

        if now >= self.locker.next_health_check {
            self.locker.next_health_check = now + self.locker.config.health_check_interval;
            io_only(self.run(&Command::StatusQuery).await)?;
        }

        Ok(())
    }

    /// Executes a command while applying events as they arrive.
    async fn run(&mut self, cmd: &Command) -> Result<Response, P::Error> {
        let Self { link, locker } = self;
        let mut deferred = Vec::new();
        let res = match select(
            link.execute(cmd),
            forward_events(link, locker, cmd.lock(), &mut deferred),
        )
        .await
        {
            Either::First(res) => res,
            Either::Second(never) => match never {},
        };
        let now = link.clock().now();

        locker.command_done(cmd, &res, now);

        for event in deferred {
            locker.apply_event(event, now);
        }

        while let Some(event) = link.next_event() {
            locker.apply_event(event, now);
        }

        res
    }
}

/// Applies events while a command is in flight.
///
/// `DoorClosed` for the commanded lock is collected in `deferred` instead.
async fn forward_events<P: Read + Write, C: Clock>(
    link: &Link<P, C>,
    locker: &mut Locker,
    target: Option<LockId>,
    deferred: &mut Vec<Event>,
) -> Infallible {
    loop {
        let event = link.events().wait().await;

        if matches!(event, Event::DoorClosed(id) if Some(id) == target) {
            deferred.push(event);
        } else {
            locker.apply_event(event, link.clock().now());
        }
    }
}

/// Discards every error except port errors.
fn io_only<T, E>(res: Result<T, E>) -> Result<Option<T>, E> {
    match res {
        Ok(val) => Ok(Some(val)),
        Err(Error::Io(err)) => Err(Error::Io(err)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::AbortReason,
        tests::{ManualClock, MockPort, init_logger},
    };
    use alloc::vec;
    use core::time::Duration;

    type TestController = Controller<MockPort, ManualClock>;

    fn controller(port: &MockPort) -> TestController {
        Controller::new(
            port.clone(),
            ManualClock::new(),
            Config::default().with_health_check_interval(Duration::from_secs(3600)),
        )
    }

    /// Homes both locks into `Locked`.
    async fn homed(port: &MockPort) -> Result<TestController, Infallible> {
        let mut ctrl = controller(port);

        port.reply("OK\nEVENT:DOOR_CLOSED 1\n");
        port.reply("OK\nEVENT:DOOR_CLOSED 2\n");

        ctrl.home().await?;
        ctrl.tick().await?;

        for id in LockId::ALL {
            assert_eq!(ctrl.lock(id).state(), LockState::Locked, "{id} should be homed");
        }

        port.clear_sent();

        while ctrl.next_record().is_some() {}

        Ok(ctrl)
    }

    fn session_state(ctrl: &TestController, id: LockId) -> Option<SessionState> {
        ctrl.session(id).map(|session| session.state().clone())
    }

    #[tokio::test]
    async fn scenario_unlock_without_door_event() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;

        port.reply("OK\n");
        ctrl.begin(LockId::Parcel, SessionKind::Delivery, "PX-1".into())?;
        ctrl.tick().await?;

        assert_eq!(ctrl.lock(LockId::Parcel).state(), LockState::Transitioning);
        assert_eq!(
            session_state(&ctrl, LockId::Parcel),
            Some(SessionState::AwaitingDoorEvent)
        );

        // No DOOR_CLOSED within the grace period
        for _ in 0..50 {
            ctrl.tick().await?;
        }

        assert_eq!(ctrl.lock(LockId::Parcel).state(), LockState::Unlocked);
        assert_eq!(
            session_state(&ctrl, LockId::Parcel),
            Some(SessionState::AwaitingDoorEvent),
            "session should keep waiting for the door"
        );
        assert_eq!(port.sent(), vec!["AT+LOCK 1"]);

        Ok(())
    }

    #[tokio::test]
    async fn scenario_relock_completes_session() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;

        port.reply("OK\n");
        ctrl.begin(LockId::Parcel, SessionKind::Delivery, "PX-2".into())?;
        ctrl.tick().await?;

        // Courier closes the door, relock is acknowledged and corroborated
        port.feed("EVENT:DOOR_CLOSED 1\n");
        port.reply("OK\nEVENT:DOOR_CLOSED 1\n");
        ctrl.tick().await?;

        assert_eq!(
            session_state(&ctrl, LockId::Parcel),
            Some(SessionState::AwaitingRelock)
        );
        assert_eq!(ctrl.lock(LockId::Parcel).state(), LockState::Transitioning);

        let before = ctrl.history().len();

        port.reply("OK\n");
        ctrl.tick().await?;

        assert_eq!(ctrl.lock(LockId::Parcel).state(), LockState::Locked);
        assert_eq!(ctrl.history().len(), before + 1, "one history entry should be appended");
        assert!(ctrl.session(LockId::Parcel).is_none(), "session should be archived");
        assert_eq!(
            ctrl.archive().last().map(|record| &record.outcome),
            Some(&SessionState::Completed)
        );
        assert_eq!(
            port.sent(),
            vec!["AT+LOCK 1", "AT-LOCK 1", "AT+BUZZ SUCCESS"],
            "success should be signalled"
        );

        Ok(())
    }

    #[tokio::test]
    async fn scenario_unreachable_controller() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;
        let start = ctrl.now();

        ctrl.begin(LockId::Payment, SessionKind::Pickup, "PAY-7".into())?;

        for _ in 0..1000 {
            if ctrl.session(LockId::Payment).is_none() {
                break;
            }

            ctrl.tick().await?;
        }

        assert_eq!(
            ctrl.archive().last().map(|record| &record.outcome),
            Some(&SessionState::Aborted(AbortReason::ControllerUnreachable))
        );
        assert_eq!(
            port.sent().iter().filter(|line| *line == "AT+LOCK 2").count(),
            4,
            "command should be retried three times"
        );
        assert!(
            ctrl.now().saturating_duration_since(start) >= Duration::from_secs(23),
            "four timeouts plus backoff should have elapsed"
        );
        assert_eq!(
            ctrl.lock(LockId::Payment).state(),
            LockState::Locked,
            "timeouts should not fault the lock"
        );

        Ok(())
    }

    #[tokio::test]
    async fn scenario_unauthorized_during_command() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;

        // Actuator reports tampering on lock 1 and never answers for lock 2
        port.reply("EVENT:UNAUTHORIZED 1\n");
        ctrl.begin(LockId::Payment, SessionKind::Delivery, "PX-9".into())?;

        let sent_at = ctrl.now() + Duration::from_millis(50);

        ctrl.tick().await?;

        assert_eq!(
            ctrl.lock(LockId::Parcel).state(),
            LockState::Fault(FaultReason::Unauthorized)
        );

        let fault = ctrl
            .history()
            .for_lock(LockId::Parcel)
            .last()
            .expect("fault should be logged");

        assert_eq!(fault.at, sent_at, "fault should be applied while the command is in flight");
        assert_eq!(ctrl.now(), sent_at + Duration::from_secs(5));
        assert_eq!(
            session_state(&ctrl, LockId::Payment),
            Some(SessionState::AwaitingUnlock),
            "payment session should be unaffected"
        );

        let mut surfaced = false;

        while let Some(record) = ctrl.next_record() {
            if let Record::Locks(locks) = record {
                surfaced |= locks[0].state == LockState::Fault(FaultReason::Unauthorized);
            }
        }

        assert!(surfaced, "fault should be published");

        Ok(())
    }

    #[tokio::test]
    async fn door_event_before_relock_ack() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;

        port.reply("OK\n");
        ctrl.begin(LockId::Parcel, SessionKind::Delivery, "PX-5".into())?;
        ctrl.tick().await?;

        // Sensor reports the closed door before the relay acknowledges
        port.feed("EVENT:DOOR_CLOSED 1\n");
        port.reply("EVENT:DOOR_CLOSED 1\nOK\n");
        ctrl.tick().await?;

        assert_eq!(ctrl.lock(LockId::Parcel).state(), LockState::Locked);

        let entries: Vec<_> = ctrl.history().for_lock(LockId::Parcel).collect();
        let [.., ack, closed] = entries.as_slice() else {
            panic!("relock should be logged");
        };

        assert_eq!(
            ack.trigger,
            Trigger::Acknowledged(Command::LockOpen(LockId::Parcel)),
            "no transition should be logged for the early door event"
        );
        assert_eq!(closed.from, LockState::Transitioning);
        assert_eq!(closed.to, LockState::Locked);
        assert_eq!(
            closed.trigger,
            Trigger::Frame(Frame::Event(Event::DoorClosed(LockId::Parcel))),
            "door event should be applied after the acknowledgement"
        );
        assert!(ctrl.session(LockId::Parcel).is_none(), "session should be archived");
        assert_eq!(
            ctrl.archive().last().map(|record| &record.outcome),
            Some(&SessionState::Completed)
        );

        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_survives_event_burst() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;

        for _ in 0..crate::event::EVENT_QUEUE_DEPTH {
            port.feed("EVENT:DOOR_CLOSED 2\n");
        }

        port.feed("EVENT:UNAUTHORIZED 1\n");
        ctrl.tick().await?;
        ctrl.tick().await?;

        assert_eq!(
            ctrl.lock(LockId::Parcel).state(),
            LockState::Fault(FaultReason::Unauthorized)
        );
        assert_eq!(ctrl.lock(LockId::Payment).state(), LockState::Locked);
        assert_eq!(ctrl.device_status().dropped_events, 1);

        Ok(())
    }

    #[tokio::test]
    async fn faulted_lock_refuses_sessions() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;

        port.feed("EVENT:UNAUTHORIZED\n");
        ctrl.tick().await?;

        assert_eq!(
            ctrl.begin(LockId::Payment, SessionKind::Pickup, "X".into()),
            Err(Error::InvalidState)
        );

        port.reply("OK\nEVENT:DOOR_CLOSED 2\n");
        ctrl.reset(LockId::Payment).await?;
        ctrl.tick().await?;

        assert_eq!(ctrl.lock(LockId::Payment).state(), LockState::Locked);
        assert_eq!(
            ctrl.lock(LockId::Parcel).state(),
            LockState::Fault(FaultReason::Unauthorized),
            "other lock should stay faulted"
        );
        assert_eq!(ctrl.reset(LockId::Payment).await, Err(Error::InvalidState));

        Ok(())
    }

    #[tokio::test]
    async fn homing_is_retried() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = controller(&port);

        // Actuator controller not up yet
        ctrl.home().await?;

        assert!(!ctrl.is_homed(), "unanswered reset should not home");
        assert_eq!(
            ctrl.lock(LockId::Parcel).state(),
            LockState::Fault(FaultReason::Uninitialized)
        );

        port.reply("OK\nEVENT:DOOR_CLOSED 1\n");
        port.reply("OK\nEVENT:DOOR_CLOSED 2\n");
        ctrl.home().await?;
        ctrl.tick().await?;

        assert!(ctrl.is_homed());

        // Later faults need an explicit reset
        port.clear_sent();
        port.feed("EVENT:UNAUTHORIZED 2\n");
        ctrl.tick().await?;
        ctrl.home().await?;

        assert!(port.sent().is_empty(), "homing should not clear other faults");
        assert_eq!(
            ctrl.lock(LockId::Payment).state(),
            LockState::Fault(FaultReason::Unauthorized)
        );

        Ok(())
    }

    #[tokio::test]
    async fn cancel_relocks_door() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;

        port.reply("OK\n");
        ctrl.begin(LockId::Parcel, SessionKind::Pickup, "PX-3".into())?;
        ctrl.tick().await?;

        assert_eq!(ctrl.cancel(LockId::Payment), Err(Error::InvalidState));
        ctrl.cancel(LockId::Parcel)?;

        port.reply("OK\nEVENT:DOOR_CLOSED 1\n");
        port.reply("OK\n");
        ctrl.tick().await?;
        ctrl.tick().await?;

        assert_eq!(
            ctrl.archive().last().map(|record| &record.outcome),
            Some(&SessionState::Aborted(AbortReason::Cancelled))
        );
        assert_eq!(ctrl.lock(LockId::Parcel).state(), LockState::Locked);
        assert_eq!(
            port.sent(),
            vec!["AT+LOCK 1", "AT-LOCK 1", "AT+BUZZ ALERT"],
            "door should be relocked before signalling"
        );

        Ok(())
    }

    #[tokio::test]
    async fn health_check() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = Controller::new(
            port.clone(),
            ManualClock::new(),
            Config::default().with_health_check_interval(Duration::from_millis(100)),
        );

        port.reply("STATUS:DOOR1=CLOSED,DOOR2=OPEN,LOCK1=LOCKED,LOCK2=LOCKED\nOK\n");
        ctrl.tick().await?;
        ctrl.tick().await?;

        assert_eq!(port.sent(), vec!["AT+STATUS"]);

        let status = ctrl.device_status();

        assert!(status.reachable, "controller should be reachable");
        assert_eq!(
            status.report.and_then(|report| report.door(LockId::Payment)),
            Some(crate::frame::DoorState::Open)
        );

        let record = ctrl.next_record().expect("status should be published");

        assert_eq!(record.path(), crate::mirror::Path::DeviceStatus);

        Ok(())
    }

    #[tokio::test]
    async fn remote_config_changes_grace() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut ctrl = homed(&port).await?;

        ctrl.apply_config(&RemoteConfig {
            grace_period_ms: Some(500),
            ..RemoteConfig::default()
        });

        port.reply("OK\n");
        ctrl.begin(LockId::Parcel, SessionKind::Delivery, "PX-4".into())?;
        ctrl.tick().await?;

        for _ in 0..12 {
            ctrl.tick().await?;
        }

        assert_eq!(
            ctrl.lock(LockId::Parcel).state(),
            LockState::Unlocked,
            "shorter grace period should apply"
        );

        Ok(())
    }
}
