//! Unsolicited notifications from the actuator controller.
//!
//! Events can arrive at any time, including between a command and its
//! response. The [`Link`](crate::link::Link) forwards them into an
//! [`EventQueue`], which the control loop drains once per tick.

use crate::frame::{LockId, split_argument};
use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::{
    cell::Cell,
    fmt::{Display, Formatter},
};
use embassy_sync::{
    blocking_mutex::raw::NoopRawMutex,
    channel::{Channel, TrySendError},
};
use log::{error, trace, warn};
use serde::Serialize;
use strum::{AsRefStr, EnumString};

/// Maximum number of undrained events.
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Asynchronous notification from the actuator controller.
#[derive(Serialize, PartialEq, Eq, Clone, Debug)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum Event {
    /// A door sensor reported a closed door (`EVENT:DOOR_CLOSED <n>`).
    DoorClosed(LockId),
    /// A door was opened without authorization (`EVENT:UNAUTHORIZED [n]`).
    ///
    /// Without a target, the event applies to every lock.
    Unauthorized(Option<LockId>),
    /// The actuator controller reported an internal error (`EVENT:SYSTEM_ERROR <detail>`).
    SystemError(String),
    /// Unsolicited status payload (`STATUS:<payload>`).
    Status(String),
}

#[derive(EnumString, AsRefStr, Copy, Clone, Debug)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum EventTag {
    DoorClosed,
    Unauthorized,
    SystemError,
}

impl Event {
    /// Parses the part of an `EVENT:` line after the prefix.
    ///
    /// A door event without a target refers to the parcel door.
    pub(crate) fn parse(s: &str) -> Option<Self> {
        let (tag, arg) = split_argument(s.trim());

        match tag.parse::<EventTag>().ok()? {
            EventTag::DoorClosed => arg
                .map_or(Ok(LockId::Parcel), str::parse)
                .ok()
                .map(Self::DoorClosed),
            EventTag::Unauthorized => match arg {
                Some(arg) => arg.parse().ok().map(|id| Self::Unauthorized(Some(id))),
                None => Some(Self::Unauthorized(None)),
            },
            EventTag::SystemError => Some(Self::SystemError(
                arg.map(ToString::to_string).unwrap_or_default(),
            )),
        }
    }

    /// Returns `true` for events that must reach the control loop even
    /// when the queue overflows.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::SystemError(_))
    }

    /// Returns `true` if the event is about the given lock.
    #[must_use]
    pub fn concerns(&self, id: LockId) -> bool {
        match *self {
            Self::DoorClosed(target) => target == id,
            Self::Unauthorized(target) => target.is_none_or(|target| target == id),
            Self::SystemError(_) | Self::Status(_) => false,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::DoorClosed(id) => write!(f, "{} {}", EventTag::DoorClosed.as_ref(), id.number()),
            Self::Unauthorized(Some(id)) => {
                write!(f, "{} {}", EventTag::Unauthorized.as_ref(), id.number())
            }
            Self::Unauthorized(None) => f.write_str(EventTag::Unauthorized.as_ref()),
            Self::SystemError(detail) if detail.is_empty() => {
                f.write_str(EventTag::SystemError.as_ref())
            }
            Self::SystemError(detail) => write!(f, "{} {detail}", EventTag::SystemError.as_ref()),
            Self::Status(payload) => write!(f, "STATUS {payload}"),
        }
    }
}

/// Ordered, bounded queue of received events.
///
/// Pushing never blocks. When the queue is full the newest event is
/// dropped and counted, see [`EventQueue::dropped`]. Critical events
/// (see [`Event::is_critical`]) instead evict the oldest non-critical
/// event, and are only dropped if an identical event is still queued.
/// No other de-duplication is performed.
pub struct EventQueue {
    channel: Channel<NoopRawMutex, Event, EVENT_QUEUE_DEPTH>,
    dropped: Cell<u32>,
}

impl EventQueue {
    /// Constructs an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            dropped: Cell::new(0),
        }
    }

    /// Appends an event in arrival order.
    pub fn push(&self, event: Event) {
        trace!("Queueing event: {event:?}");

        let Err(TrySendError::Full(event)) = self.channel.try_send(event) else {
            return;
        };

        if event.is_critical() {
            self.make_room_for(event);
        } else {
            error!("Event queue full, dropping event: {event:?}");
            self.count_drop();
        }
    }

    fn make_room_for(&self, event: Event) {
        let mut queued: Vec<Event> =
            core::iter::from_fn(|| self.channel.try_receive().ok()).collect();

        if queued.contains(&event) {
            warn!("Event queue full, {event} already queued");
            self.count_drop();
        } else {
            // Oldest one goes if every slot is critical
            let victim = queued
                .iter()
                .position(|queued| !queued.is_critical())
                .unwrap_or(0);
            let evicted = queued.remove(victim);

            error!("Event queue full, evicting {evicted} for {event}");
            self.count_drop();
            queued.push(event);
        }

        for event in queued {
            // Cannot fail, at most the drained number of events is re-queued
            let _ = self.channel.try_send(event);
        }
    }

    fn count_drop(&self) {
        self.dropped.set(self.dropped.get().saturating_add(1));
    }

    /// Removes and returns the oldest event, if any.
    pub fn next_event(&self) -> Option<Event> {
        self.channel.try_receive().ok()
    }

    /// Waits for the next event.
    pub async fn wait(&self) -> Event {
        self.channel.receive().await
    }

    /// Returns the number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channel.len()
    }

    /// Returns `true` if no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    /// Returns the number of events lost to overflow.
    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.dropped.get()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;

    #[test]
    fn parse_events() {
        init_logger();

        assert_eq!(
            Event::parse("DOOR_CLOSED"),
            Some(Event::DoorClosed(LockId::Parcel))
        );
        assert_eq!(
            Event::parse("UNAUTHORIZED=2"),
            Some(Event::Unauthorized(Some(LockId::Payment)))
        );
        assert_eq!(
            Event::parse("SYSTEM_ERROR low voltage"),
            Some(Event::SystemError("low voltage".into()))
        );
        assert_eq!(Event::parse("UNAUTHORIZED 7"), None);
        assert_eq!(Event::parse("door_closed 1"), None);
    }

    #[test]
    fn concerns() {
        assert!(Event::DoorClosed(LockId::Parcel).concerns(LockId::Parcel));
        assert!(!Event::DoorClosed(LockId::Parcel).concerns(LockId::Payment));
        assert!(Event::Unauthorized(None).concerns(LockId::Payment));
        assert!(!Event::Unauthorized(Some(LockId::Parcel)).concerns(LockId::Payment));
        assert!(!Event::SystemError("x".into()).concerns(LockId::Parcel));
    }

    #[test]
    fn arrival_order_and_overflow() {
        init_logger();

        let queue = EventQueue::new();

        for _ in 0..EVENT_QUEUE_DEPTH {
            queue.push(Event::DoorClosed(LockId::Parcel));
        }

        // Duplicates are kept, overflow is counted
        queue.push(Event::DoorClosed(LockId::Payment));

        assert_eq!(queue.len(), EVENT_QUEUE_DEPTH);
        assert_eq!(queue.dropped(), 1, "overflowing event should be counted");

        let mut count = 0;

        while let Some(event) = queue.next_event() {
            assert_eq!(event, Event::DoorClosed(LockId::Parcel));
            count += 1;
        }

        assert_eq!(count, EVENT_QUEUE_DEPTH, "all queued events should be drained");
        assert!(queue.is_empty());
    }

    #[test]
    fn critical_event_evicts_oldest_door_event() {
        init_logger();

        let queue = EventQueue::new();

        queue.push(Event::DoorClosed(LockId::Parcel));

        for _ in 1..EVENT_QUEUE_DEPTH {
            queue.push(Event::DoorClosed(LockId::Payment));
        }

        queue.push(Event::Unauthorized(Some(LockId::Parcel)));

        assert_eq!(queue.len(), EVENT_QUEUE_DEPTH);
        assert_eq!(queue.dropped(), 1);

        let events: Vec<_> = core::iter::from_fn(|| queue.next_event()).collect();

        assert!(
            !events.contains(&Event::DoorClosed(LockId::Parcel)),
            "oldest door event should be evicted"
        );
        assert_eq!(
            events.last(),
            Some(&Event::Unauthorized(Some(LockId::Parcel))),
            "critical event should keep arrival order"
        );
    }

    #[test]
    fn full_of_critical_events() {
        init_logger();

        let queue = EventQueue::new();

        queue.push(Event::Unauthorized(None));

        for i in 1..EVENT_QUEUE_DEPTH {
            queue.push(Event::SystemError(i.to_string()));
        }

        // Identical event still queued, the new one adds nothing
        queue.push(Event::Unauthorized(None));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.next_event(), Some(Event::Unauthorized(None)));

        queue.push(Event::SystemError("late".into()));
        queue.push(Event::Unauthorized(Some(LockId::Payment)));

        assert_eq!(queue.dropped(), 2, "oldest critical event should make room");

        let events: Vec<_> = core::iter::from_fn(|| queue.next_event()).collect();

        assert_eq!(events.len(), EVENT_QUEUE_DEPTH);
        assert_eq!(events[0], Event::SystemError("2".into()));
        assert_eq!(events.last(), Some(&Event::Unauthorized(Some(LockId::Payment))));
    }
}
