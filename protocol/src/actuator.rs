//! Actuator controller side of the link.
//!
//! A [`Station`] answers commands from the network controller by driving
//! [`Hardware`] and reports door changes as events. It is used by the
//! `simulate` binary and can run on the actuator firmware itself.

use crate::{
    Error, Result,
    clock::Clock,
    event::Event,
    frame::{Command, DoorState, Frame, LockId, Rejection, RelayState, StatusReport, Tone},
    framer::Framer,
};
use alloc::string::ToString;
use core::time::Duration;
use embedded_io_async::{Read, Write};
use log::{debug, info, warn};

/// Default interval between door sensor scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(20);

/// Relays, reed switches and buzzer of the actuator controller.
#[allow(async_fn_in_trait)]
pub trait Hardware {
    /// Energizes ([`RelayState::Unlocked`]) or releases a lock relay.
    fn set_relay(&mut self, id: LockId, relay: RelayState);

    /// Reads the reed switch of a door.
    fn read_sensor(&mut self, id: LockId) -> DoorState;

    /// Sounds the buzzer for the duration of the tone.
    async fn buzz(&mut self, tone: Tone);
}

/// Command server of the actuator controller.
pub struct Station<P, C, H> {
    framer: Framer<P>,
    clock: C,
    hw: H,
    relays: [RelayState; 2],
    doors: [DoorState; 2],
    scan_interval: Duration,
}

impl<P: Read + Write, C: Clock, H: Hardware> Station<P, C, H> {
    /// Constructs a new station and releases both relays.
    pub fn new(port: P, clock: C, mut hw: H) -> Self {
        for id in LockId::ALL {
            hw.set_relay(id, RelayState::Locked);
        }

        let doors = LockId::ALL.map(|id| hw.read_sensor(id));

        Self {
            framer: Framer::new(port),
            clock,
            hw,
            relays: [RelayState::Locked; 2],
            doors,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    /// Sets the interval between door sensor scans.
    #[must_use]
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Returns the hardware.
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Returns the hardware mutably.
    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Returns the full status of relays and doors.
    pub fn report(&self) -> StatusReport {
        LockId::ALL.iter().fold(StatusReport::default(), |report, &id| {
            report
                .with_door(id, self.doors[id.index()])
                .with_relay(id, self.relays[id.index()])
        })
    }

    /// Serves commands until the port fails.
    pub async fn serve(&mut self) -> Result<(), P::Error> {
        info!("Serving commands");

        loop {
            self.step().await?;
        }
    }

    /// Handles at most one incoming line, then scans the door sensors.
    pub async fn step(&mut self) -> Result<(), P::Error> {
        let deadline = self.clock.now() + self.scan_interval;

        match self.framer.poll_frame(&self.clock, deadline).await {
            Ok(Frame::Command(cmd)) => self.handle(&cmd).await?,
            Ok(Frame::Malformed(raw)) => {
                let rejection = Rejection::of(&raw);

                warn!("Rejecting {raw:?}: {rejection}");
                self.framer.send(&Frame::Error(rejection.to_string())).await?;
            }
            Ok(frame) => warn!("Ignoring unexpected frame: {frame}"),
            Err(Error::Timeout) => {}
            Err(err) => return Err(err),
        }

        self.scan().await
    }

    async fn handle(&mut self, cmd: &Command) -> Result<(), P::Error> {
        debug!("Handling {cmd}");

        match *cmd {
            Command::LockOpen(id) => {
                self.set_relay(id, RelayState::Unlocked);
                self.framer.send(&Frame::Ok).await?;
            }
            Command::LockClose(id) => {
                self.set_relay(id, RelayState::Locked);
                self.framer.send(&Frame::Ok).await?;

                let door = self.hw.read_sensor(id);

                self.doors[id.index()] = door;

                if door == DoorState::Closed {
                    self.emit(Event::DoorClosed(id)).await?;
                }
            }
            Command::Buzz(tone) => {
                self.hw.buzz(tone).await;
                self.framer.send(&Frame::Ok).await?;
            }
            Command::SensorRead(id) => {
                let door = self.hw.read_sensor(id);
                let report = StatusReport::default().with_door(id, door);

                self.framer.send(&Frame::Status(report.to_string())).await?;
                self.framer.send(&Frame::Ok).await?;
            }
            Command::StatusQuery => {
                for id in LockId::ALL {
                    self.doors[id.index()] = self.hw.read_sensor(id);
                }

                self.framer.send(&Frame::Status(self.report().to_string())).await?;
                self.framer.send(&Frame::Ok).await?;
            }
        }

        Ok(())
    }

    /// Reports door edges as events.
    async fn scan(&mut self) -> Result<(), P::Error> {
        for id in LockId::ALL {
            let door = self.hw.read_sensor(id);
            let prev = core::mem::replace(&mut self.doors[id.index()], door);

            match (prev, door) {
                (DoorState::Open, DoorState::Closed) => self.emit(Event::DoorClosed(id)).await?,
                (DoorState::Closed, DoorState::Open)
                    if self.relays[id.index()] == RelayState::Locked =>
                {
                    warn!("{id} forced open");
                    self.emit(Event::Unauthorized(Some(id))).await?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn emit(&mut self, event: Event) -> Result<(), P::Error> {
        self.framer.send(&Frame::Event(event)).await
    }

    fn set_relay(&mut self, id: LockId, relay: RelayState) {
        info!("Relay of {id}: {relay}");

        self.relays[id.index()] = relay;
        self.hw.set_relay(id, relay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{ManualClock, MockPort, init_logger};
    use alloc::{string::String, vec, vec::Vec};
    use core::convert::Infallible;

    #[derive(Default)]
    struct MockHardware {
        relays: [Option<RelayState>; 2],
        doors: [Option<DoorState>; 2],
        buzzes: Vec<Tone>,
    }

    impl MockHardware {
        fn set_door(&mut self, id: LockId, door: DoorState) {
            self.doors[id.index()] = Some(door);
        }
    }

    impl Hardware for MockHardware {
        fn set_relay(&mut self, id: LockId, relay: RelayState) {
            self.relays[id.index()] = Some(relay);
        }

        fn read_sensor(&mut self, id: LockId) -> DoorState {
            self.doors[id.index()].unwrap_or(DoorState::Closed)
        }

        async fn buzz(&mut self, tone: Tone) {
            self.buzzes.push(tone);
        }
    }

    fn station(port: &MockPort, hw: MockHardware) -> Station<MockPort, ManualClock, MockHardware> {
        Station::new(port.clone(), ManualClock::new(), hw)
    }

    #[tokio::test]
    async fn open_and_close() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut station = station(&port, MockHardware::default());

        assert_eq!(
            station.hardware().relays,
            [Some(RelayState::Locked); 2],
            "relays should be released at startup"
        );

        port.feed("AT+LOCK 1\n");
        station.step().await?;

        assert_eq!(station.hardware().relays[0], Some(RelayState::Unlocked));

        port.feed("AT-LOCK=1\n");
        station.step().await?;

        assert_eq!(station.hardware().relays[0], Some(RelayState::Locked));
        assert_eq!(port.sent(), vec!["OK", "OK", "EVENT:DOOR_CLOSED 1"]);

        Ok(())
    }

    #[tokio::test]
    async fn close_with_open_door() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut hw = MockHardware::default();

        hw.set_door(LockId::Payment, DoorState::Open);

        let mut station = station(&port, hw);

        port.feed("AT+LOCK 2\nAT-LOCK 2\n");
        station.step().await?;
        station.step().await?;

        assert_eq!(
            port.sent(),
            vec!["OK", "OK"],
            "open door should not be reported as closed"
        );

        Ok(())
    }

    #[tokio::test]
    async fn rejects_bad_commands() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut station = station(&port, MockHardware::default());

        port.feed("AT+LOCK 3\nAT+OPEN\n");
        station.step().await?;
        station.step().await?;

        assert_eq!(
            port.sent(),
            vec!["ERROR:INVALID_TARGET", "ERROR:UNKNOWN_COMMAND"]
        );

        Ok(())
    }

    #[tokio::test]
    async fn sensor_and_status() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut hw = MockHardware::default();

        hw.set_door(LockId::Payment, DoorState::Open);

        let mut station = station(&port, hw);

        port.feed("AT+SENSOR 2\nAT+STATUS\nAT+BUZZ ALERT\n");

        for _ in 0..3 {
            station.step().await?;
        }

        assert_eq!(
            port.sent(),
            vec![
                "STATUS:DOOR2=OPEN",
                "OK",
                "STATUS:DOOR1=CLOSED,DOOR2=OPEN,LOCK1=LOCKED,LOCK2=LOCKED",
                "OK",
                "OK"
            ]
        );
        assert_eq!(station.hardware().buzzes, vec![Tone::Alert]);

        Ok(())
    }

    #[tokio::test]
    async fn forced_door() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut station = station(&port, MockHardware::default());

        station.hardware_mut().set_door(LockId::Parcel, DoorState::Open);
        station.step().await?;
        station.step().await?;

        assert_eq!(
            port.sent(),
            vec!["EVENT:UNAUTHORIZED 1"],
            "forced opening should be reported once"
        );

        station.hardware_mut().set_door(LockId::Parcel, DoorState::Closed);
        station.step().await?;

        assert_eq!(port.sent().last().map(String::as_str), Some("EVENT:DOOR_CLOSED 1"));

        Ok(())
    }

    #[tokio::test]
    async fn authorized_opening() -> Result<(), Infallible> {
        init_logger();

        let port = MockPort::new();
        let mut station = station(&port, MockHardware::default());

        port.feed("AT+LOCK 1\n");
        station.step().await?;
        station.hardware_mut().set_door(LockId::Parcel, DoorState::Open);
        station.step().await?;
        station.hardware_mut().set_door(LockId::Parcel, DoorState::Closed);
        station.step().await?;

        assert_eq!(
            port.sent(),
            vec!["OK", "EVENT:DOOR_CLOSED 1"],
            "opening an unlocked door should not be unauthorized"
        );

        Ok(())
    }
}
