//! Wire vocabulary of the inter-controller link.
//!
//! Every line on the wire is parsed exactly once into a [`Frame`].
//! The frame tag is inferred from a fixed prefix:
//!
//! | Prefix    | Frame                 | Direction          |
//! |-----------|-----------------------|--------------------|
//! | `AT+`/`AT-` | [`Frame::Command`]  | network → actuator |
//! | `OK`      | [`Frame::Ok`]         | actuator → network |
//! | `ERROR:`  | [`Frame::Error`]      | actuator → network |
//! | `EVENT:`  | [`Frame::Event`]      | actuator → network |
//! | `STATUS:` | [`Frame::Status`]     | actuator → network |
//!
//! Arguments follow the tag, separated by a space or `=` (`AT+LOCK 1`, `AT+LOCK=1`).
//! Anything else, including empty lines, parses to [`Frame::Malformed`].

use crate::event::Event;
use alloc::string::{String, ToString};
use core::{
    fmt::{Display, Formatter},
    str::FromStr,
    time::Duration,
};
use serde::{Serialize, Serializer};
use strum::{AsRefStr, Display, EnumString, FromRepr, IntoStaticStr};

/// Baud rate of the link between the two controllers (8N1).
pub const BAUD_RATE: u32 = 115_200;

/// Identifies one of the two locks of the locker.
///
/// The discriminant is the number used on the wire.
#[derive(FromRepr, Display, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash, Debug)]
#[repr(u8)]
pub enum LockId {
    /// Parcel door lock (relay 1, door sensor 1).
    #[strum(serialize = "parcel door")]
    Parcel = 1,
    /// Payment box lock (relay 2, door sensor 2).
    #[strum(serialize = "payment box")]
    Payment = 2,
}

impl LockId {
    /// Both locks, in wire order.
    pub const ALL: [Self; 2] = [Self::Parcel, Self::Payment];

    /// Returns the number identifying the lock on the wire.
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Returns a zero-based index, e.g. for per-lock arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize - 1
    }
}

impl FromStr for LockId {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u8>()
            .ok()
            .and_then(Self::from_repr)
            .ok_or(strum::ParseError::VariantNotFound)
    }
}

impl Serialize for LockId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.number())
    }
}

/// Buzzer duration class.
#[derive(EnumString, Display, AsRefStr, Serialize, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    /// Short confirmation beep.
    Success,
    /// Longer warning beep.
    Alert,
}

impl Tone {
    /// Returns how long the buzzer sounds for this tone.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Success => Duration::from_millis(200),
            Self::Alert => Duration::from_millis(300),
        }
    }
}

/// Door state as reported by a reed switch.
#[derive(
    EnumString, Display, AsRefStr, IntoStaticStr, Serialize, PartialEq, Eq, Copy, Clone, Debug,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum DoorState {
    /// Door is open.
    Open,
    /// Door is closed.
    Closed,
}

/// Relay (solenoid) state as reported by the actuator controller.
#[derive(
    EnumString, Display, AsRefStr, IntoStaticStr, Serialize, PartialEq, Eq, Copy, Clone, Debug,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    /// Relay released, bolt extended.
    Locked,
    /// Relay energized, bolt retracted.
    Unlocked,
}

/// Imperative command sent by the network controller.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Command {
    /// Energize the relay of a lock (`AT+LOCK`).
    LockOpen(LockId),
    /// Release the relay of a lock (`AT-LOCK`).
    LockClose(LockId),
    /// Sound the buzzer (`AT+BUZZ`).
    Buzz(Tone),
    /// Query the full actuator status (`AT+STATUS`).
    StatusQuery,
    /// Read the door sensor of a lock (`AT+SENSOR`).
    SensorRead(LockId),
}

#[derive(EnumString, AsRefStr, Copy, Clone, Debug)]
enum CommandTag {
    #[strum(serialize = "AT+LOCK")]
    LockOpen,
    #[strum(serialize = "AT-LOCK")]
    LockClose,
    #[strum(serialize = "AT+BUZZ")]
    Buzz,
    #[strum(serialize = "AT+STATUS")]
    Status,
    #[strum(serialize = "AT+SENSOR")]
    Sensor,
}

impl Command {
    /// Returns the lock targeted by the command, if any.
    #[must_use]
    pub fn lock(&self) -> Option<LockId> {
        match *self {
            Self::LockOpen(id) | Self::LockClose(id) | Self::SensorRead(id) => Some(id),
            Self::Buzz(_) | Self::StatusQuery => None,
        }
    }

    fn tag(&self) -> CommandTag {
        match self {
            Self::LockOpen(_) => CommandTag::LockOpen,
            Self::LockClose(_) => CommandTag::LockClose,
            Self::Buzz(_) => CommandTag::Buzz,
            Self::StatusQuery => CommandTag::Status,
            Self::SensorRead(_) => CommandTag::Sensor,
        }
    }

    /// Parses a command line such as `AT+LOCK 2`.
    ///
    /// A missing lock target refers to the parcel door,
    /// a missing tone to [`Tone::Success`].
    fn parse(line: &str) -> Option<Self> {
        let (tag, arg) = split_argument(line);
        let lock = || arg.map_or(Ok(LockId::Parcel), str::parse);

        match tag.parse::<CommandTag>().ok()? {
            CommandTag::LockOpen => lock().ok().map(Self::LockOpen),
            CommandTag::LockClose => lock().ok().map(Self::LockClose),
            CommandTag::Buzz => arg
                .map_or(Ok(Tone::Success), str::parse)
                .ok()
                .map(Self::Buzz),
            CommandTag::Status => Some(Self::StatusQuery),
            CommandTag::Sensor => lock().ok().map(Self::SensorRead),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        let tag = self.tag();

        match self {
            Self::LockOpen(id) | Self::LockClose(id) | Self::SensorRead(id) => {
                write!(f, "{} {}", tag.as_ref(), id.number())
            }
            Self::Buzz(tone) => write!(f, "{} {tone}", tag.as_ref()),
            Self::StatusQuery => f.write_str(tag.as_ref()),
        }
    }
}

/// Reason code the actuator controller replies with when it cannot run a command.
#[derive(EnumString, Display, AsRefStr, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Rejection {
    /// The line is not a known command.
    UnknownCommand,
    /// The command names a lock or tone that does not exist.
    InvalidTarget,
}

impl Rejection {
    /// Classifies a line that did not parse as a [`Command`].
    #[must_use]
    pub fn of(line: &str) -> Self {
        let (tag, _) = split_argument(line.trim_end());

        if tag.parse::<CommandTag>().is_ok() {
            Self::InvalidTarget
        } else {
            Self::UnknownCommand
        }
    }
}

/// One parsed line of wire communication.
///
/// Frames are immutable once parsed.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Frame {
    /// Command issued by the network controller.
    Command(Command),
    /// Successful terminal response.
    Ok,
    /// Failed terminal response carrying a reason code.
    Error(String),
    /// Unsolicited notification from the actuator controller.
    Event(Event),
    /// Status payload, see [`StatusReport`].
    Status(String),
    /// Line that matched no known prefix, kept verbatim for logging.
    Malformed(String),
}

const PREFIX_EVENT: &str = "EVENT:";
const PREFIX_STATUS: &str = "STATUS:";
const PREFIX_ERROR: &str = "ERROR:";
const LITERAL_OK: &str = "OK";

impl Frame {
    /// Parses a single line (without its terminator).
    ///
    /// Trailing whitespace is trimmed first. Never fails: unrecognized
    /// input yields [`Frame::Malformed`].
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end();
        let frame = if line == LITERAL_OK {
            Some(Self::Ok)
        } else if let Some(code) = line.strip_prefix(PREFIX_ERROR) {
            Some(Self::Error(code.trim().to_string()))
        } else if let Some(rest) = line.strip_prefix(PREFIX_EVENT) {
            Event::parse(rest).map(Self::Event)
        } else if let Some(payload) = line.strip_prefix(PREFIX_STATUS) {
            Some(Self::Status(payload.trim().to_string()))
        } else if line.starts_with("AT+") || line.starts_with("AT-") {
            Command::parse(line).map(Self::Command)
        } else {
            None
        };

        frame.unwrap_or_else(|| Self::Malformed(line.to_string()))
    }

    /// Returns `true` for frames that terminate a pending command.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Ok | Self::Error(_))
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Command(cmd) => write!(f, "{cmd}"),
            Self::Ok => f.write_str(LITERAL_OK),
            Self::Error(code) => write!(f, "{PREFIX_ERROR}{code}"),
            Self::Event(event) => write!(f, "{PREFIX_EVENT}{event}"),
            Self::Status(payload) => write!(f, "{PREFIX_STATUS}{payload}"),
            Self::Malformed(raw) => f.write_str(raw),
        }
    }
}

impl From<Command> for Frame {
    fn from(cmd: Command) -> Self {
        Self::Command(cmd)
    }
}

impl From<Event> for Frame {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Splits `TAG ARG` or `TAG=ARG` into its parts.
///
/// An empty argument is reported as `None`.
pub(crate) fn split_argument(s: &str) -> (&str, Option<&str>) {
    match s.split_once([' ', '=']) {
        Some((tag, arg)) => {
            let arg = arg.trim();

            (tag, (!arg.is_empty()).then_some(arg))
        }
        None => (s, None),
    }
}

/// Decoded `STATUS:` payload.
///
/// The payload is a comma-separated list of `KEY=VALUE` pairs, e.g.
/// `DOOR1=CLOSED,DOOR2=OPEN,LOCK1=LOCKED,LOCK2=UNLOCKED`.
/// `AT+SENSOR` answers with a single `DOOR<n>` pair.
/// Unknown keys are ignored.
#[derive(Serialize, PartialEq, Eq, Copy, Clone, Default, Debug)]
pub struct StatusReport {
    doors: [Option<DoorState>; 2],
    relays: [Option<RelayState>; 2],
}

impl StatusReport {
    /// Parses a status payload.
    ///
    /// Returns `None` if the payload contains no recognized key.
    #[must_use]
    pub fn parse(payload: &str) -> Option<Self> {
        let mut report = Self::default();
        let mut recognized = false;

        for (key, val) in payload
            .split(',')
            .filter_map(|pair| pair.trim().split_once('='))
        {
            let Some(split) = key.find(|c: char| c.is_ascii_digit()) else {
                continue;
            };
            let (name, num) = key.split_at(split);
            let Ok(id) = num.parse::<LockId>() else {
                continue;
            };

            match name {
                "DOOR" => {
                    if let Ok(door) = val.parse() {
                        report.doors[id.index()] = Some(door);
                        recognized = true;
                    }
                }
                "LOCK" => {
                    if let Ok(relay) = val.parse() {
                        report.relays[id.index()] = Some(relay);
                        recognized = true;
                    }
                }
                _ => {}
            }
        }

        recognized.then_some(report)
    }

    /// Returns the reported door state of a lock.
    #[must_use]
    pub fn door(&self, id: LockId) -> Option<DoorState> {
        self.doors[id.index()]
    }

    /// Returns the reported relay state of a lock.
    #[must_use]
    pub fn relay(&self, id: LockId) -> Option<RelayState> {
        self.relays[id.index()]
    }

    /// Sets the door state of a lock.
    #[must_use]
    pub fn with_door(mut self, id: LockId, door: DoorState) -> Self {
        self.doors[id.index()] = Some(door);
        self
    }

    /// Sets the relay state of a lock.
    #[must_use]
    pub fn with_relay(mut self, id: LockId, relay: RelayState) -> Self {
        self.relays[id.index()] = Some(relay);
        self
    }
}

impl Display for StatusReport {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        let doors = LockId::ALL.iter().filter_map(|&id| {
            self.door(id)
                .map(|door| ("DOOR", id, <&'static str>::from(door)))
        });
        let relays = LockId::ALL.iter().filter_map(|&id| {
            self.relay(id)
                .map(|relay| ("LOCK", id, <&'static str>::from(relay)))
        });

        for (i, (name, id, val)) in doors.chain(relays).enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }

            write!(f, "{name}{}={val}", id.number())?;
        }

        Ok(())
    }
}
