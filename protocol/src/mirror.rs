//! Buffered synchronization with the cloud mirror.
//!
//! The controller produces [`Record`]s. A [`MirrorSync`] publishes them to a
//! [`Mirror`] as JSON, keeps them in a bounded backlog while the network is
//! down and flushes the backlog in order once it is back.

use crate::{
    clock::Instant,
    config::{Config, RemoteConfig},
    controller::DeviceStatus,
    history::HistoryEntry,
    lock::LockSnapshot,
    session::SessionRecord,
};
use alloc::{collections::vec_deque::VecDeque, string::String};
use core::{fmt::Debug, time::Duration};
use log::{debug, error, info, warn};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};

/// Path of the cloud mirror a record is published to.
#[derive(EnumString, Display, AsRefStr, PartialEq, Eq, Copy, Clone, Hash, Debug)]
pub enum Path {
    /// Finished sessions.
    #[strum(serialize = "/parcels")]
    Parcels,
    /// Health of the actuator controller.
    #[strum(serialize = "/device_status")]
    DeviceStatus,
    /// Snapshots of both locks.
    #[strum(serialize = "/locks_status")]
    LocksStatus,
    /// Lock transitions.
    #[strum(serialize = "/history")]
    History,
    /// Configuration updates, read only.
    #[strum(serialize = "/config")]
    Config,
}

/// Data produced by the controller for the cloud mirror.
#[derive(Serialize, PartialEq, Eq, Clone, Debug)]
#[serde(untagged)]
pub enum Record {
    /// Current state of both locks.
    Locks([LockSnapshot; 2]),
    /// A logged lock transition.
    History(HistoryEntry),
    /// A finished session.
    Session(SessionRecord),
    /// Health of the actuator controller.
    Device(DeviceStatus),
}

impl Record {
    /// Returns the path the record is published to.
    #[must_use]
    pub fn path(&self) -> Path {
        match self {
            Self::Locks(_) => Path::LocksStatus,
            Self::History(_) => Path::History,
            Self::Session(_) => Path::Parcels,
            Self::Device(_) => Path::DeviceStatus,
        }
    }

    /// Encodes the record as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Remote data store the locker reports to.
#[allow(async_fn_in_trait)]
pub trait Mirror {
    /// Error returned by [`Mirror::publish`].
    type Error: Debug;

    /// Publishes a JSON payload to a path.
    async fn publish(&mut self, path: Path, payload: &str) -> Result<(), Self::Error>;

    /// Returns the next pending update of a path, without waiting.
    async fn next_update(&mut self, path: Path) -> Option<String>;
}

/// Network link used by the mirror.
pub trait Connectivity {
    /// Returns `true` while the network is usable.
    fn is_connected(&self) -> bool;

    /// Starts a reconnection attempt.
    fn reconnect(&mut self);
}

/// Bounded, ordered publishing of [`Record`]s.
pub struct MirrorSync<M, N> {
    mirror: M,
    net: N,
    backlog: VecDeque<Record>,
    capacity: usize,
    reconnect_interval: Duration,
    last_reconnect: Option<Instant>,
    dropped: u32,
}

impl<M: Mirror, N: Connectivity> MirrorSync<M, N> {
    /// Constructs a new synchronizer.
    ///
    /// Uses [`Config::mirror_backlog`] and [`Config::reconnect_interval`].
    pub fn new(mirror: M, net: N, config: &Config) -> Self {
        Self {
            mirror,
            net,
            backlog: VecDeque::new(),
            capacity: config.mirror_backlog.max(1),
            reconnect_interval: config.reconnect_interval,
            last_reconnect: None,
            dropped: 0,
        }
    }

    /// Returns the mirror.
    pub fn mirror(&self) -> &M {
        &self.mirror
    }

    /// Returns the network link.
    pub fn connectivity(&self) -> &N {
        &self.net
    }

    /// Returns the network link mutably.
    pub fn connectivity_mut(&mut self) -> &mut N {
        &mut self.net
    }

    /// Returns the number of records waiting to be published.
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    /// Returns the number of records lost to a full backlog.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Queues a record for publishing.
    ///
    /// Drops the oldest record if the backlog is full.
    pub fn push(&mut self, record: Record) {
        if self.backlog.len() >= self.capacity {
            warn!("Mirror backlog full, dropping oldest record");

            self.backlog.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }

        self.backlog.push_back(record);
    }

    /// Publishes the backlog in order.
    ///
    /// While disconnected, requests a reconnection at most once per
    /// reconnect interval instead.
    /// Returns the number of records published.
    pub async fn sync(&mut self, now: Instant) -> usize {
        if !self.net.is_connected() {
            let due = self
                .last_reconnect
                .is_none_or(|last| now >= last + self.reconnect_interval);

            if due {
                info!("Network down, reconnecting");

                self.last_reconnect = Some(now);
                self.net.reconnect();
            }

            return 0;
        }

        let mut count = 0;

        while let Some(record) = self.backlog.front() {
            let path = record.path();
            let payload = match record.to_json() {
                Ok(payload) => payload,
                Err(err) => {
                    error!("Failed to encode record for {path}: {err}");

                    self.backlog.pop_front();

                    continue;
                }
            };

            if let Err(err) = self.mirror.publish(path, &payload).await {
                warn!("Failed to publish to {path}: {err:?}");

                break;
            }

            debug!("Published to {path}: {payload}");

            self.backlog.pop_front();
            count += 1;
        }

        count
    }

    /// Returns the next configuration update, if one is pending.
    ///
    /// Malformed updates are logged and skipped.
    pub async fn poll_config(&mut self) -> Option<RemoteConfig> {
        if !self.net.is_connected() {
            return None;
        }

        let payload = self.mirror.next_update(Path::Config).await?;

        match RemoteConfig::from_json(&payload) {
            Ok(update) => Some(update),
            Err(err) => {
                warn!("Ignoring malformed configuration update: {err}");

                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::LockId,
        history::Trigger,
        lock::LockState,
        tests::init_logger,
    };
    use alloc::{string::ToString, vec::Vec};

    #[derive(Default)]
    struct MockMirror {
        published: Vec<(Path, String)>,
        updates: VecDeque<String>,
        fail: bool,
    }

    impl Mirror for MockMirror {
        type Error = ();

        async fn publish(&mut self, path: Path, payload: &str) -> Result<(), Self::Error> {
            if self.fail {
                return Err(());
            }

            self.published.push((path, payload.to_string()));

            Ok(())
        }

        async fn next_update(&mut self, path: Path) -> Option<String> {
            assert_eq!(path, Path::Config);

            self.updates.pop_front()
        }
    }

    #[derive(Default)]
    struct MockNet {
        connected: bool,
        reconnects: u32,
    }

    impl Connectivity for MockNet {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn reconnect(&mut self) {
            self.reconnects += 1;
        }
    }

    fn sync(capacity: usize) -> MirrorSync<MockMirror, MockNet> {
        let config = Config {
            mirror_backlog: capacity,
            ..Config::default()
        };

        MirrorSync::new(MockMirror::default(), MockNet::default(), &config)
    }

    fn device(millis: u64) -> Record {
        Record::Device(DeviceStatus {
            at: Instant::from_millis(millis),
            reachable: true,
            ..DeviceStatus::default()
        })
    }

    #[test]
    fn paths() {
        assert_eq!(Path::LocksStatus.as_ref(), "/locks_status");
        assert_eq!("/config".parse::<Path>(), Ok(Path::Config));
        assert_eq!(device(0).path(), Path::DeviceStatus);
    }

    #[test]
    fn history_payload() -> serde_json::Result<()> {
        let record = Record::History(HistoryEntry {
            at: Instant::from_millis(42),
            lock: LockId::Parcel,
            from: LockState::Transitioning,
            to: LockState::Locked,
            trigger: Trigger::GraceExpired,
        });

        assert_eq!(
            record.to_json()?,
            r#"{"at":42,"lock":1,"from":"transitioning","to":"locked","trigger":"grace period expired"}"#,
            "payload should be correct"
        );

        Ok(())
    }

    #[tokio::test]
    async fn backlog_flushes_in_order() {
        init_logger();

        let mut sync = sync(128);

        for t in 0..3 {
            sync.push(device(t));
        }

        assert_eq!(sync.sync(Instant::from_millis(0)).await, 0);
        assert_eq!(sync.sync(Instant::from_millis(1000)).await, 0);
        assert_eq!(sync.connectivity().reconnects, 1, "reconnect should be throttled");
        assert_eq!(sync.sync(Instant::from_millis(5000)).await, 0);
        assert_eq!(sync.connectivity().reconnects, 2);

        sync.connectivity_mut().connected = true;

        assert_eq!(sync.sync(Instant::from_millis(6000)).await, 3);
        assert_eq!(sync.backlog(), 0);

        let ats: Vec<_> = sync
            .mirror()
            .published
            .iter()
            .map(|(path, payload)| {
                assert_eq!(*path, Path::DeviceStatus);

                payload.split(',').next().map(ToString::to_string)
            })
            .collect();

        assert_eq!(
            ats,
            [
                Some(r#"{"at":0"#.to_string()),
                Some(r#"{"at":1"#.to_string()),
                Some(r#"{"at":2"#.to_string())
            ],
            "records should be published in order"
        );
    }

    #[tokio::test]
    async fn full_backlog_drops_oldest() {
        init_logger();

        let mut sync = sync(2);

        for t in 0..3 {
            sync.push(device(t));
        }

        assert_eq!(sync.backlog(), 2);
        assert_eq!(sync.dropped(), 1);

        sync.connectivity_mut().connected = true;
        sync.sync(Instant::ZERO).await;

        assert!(
            sync.mirror().published[0].1.starts_with(r#"{"at":1,"#),
            "oldest record should be dropped"
        );
    }

    #[tokio::test]
    async fn failed_publish_is_retried() {
        init_logger();

        let mut sync = sync(8);

        sync.connectivity_mut().connected = true;
        sync.mirror.fail = true;
        sync.push(device(7));

        assert_eq!(sync.sync(Instant::ZERO).await, 0);
        assert_eq!(sync.backlog(), 1, "record should be kept");

        sync.mirror.fail = false;

        assert_eq!(sync.sync(Instant::ZERO).await, 1);
    }

    #[tokio::test]
    async fn config_updates() {
        init_logger();

        let mut sync = sync(8);

        sync.mirror.updates.push_back("not json".into());
        sync.mirror
            .updates
            .push_back(r#"{"grace_period_ms":3000,"max_retries":5}"#.into());

        assert_eq!(sync.poll_config().await, None, "offline should not poll");

        sync.connectivity_mut().connected = true;

        assert_eq!(sync.poll_config().await, None, "malformed update should be skipped");
        assert_eq!(
            sync.poll_config().await,
            Some(RemoteConfig {
                grace_period_ms: Some(3000),
                max_retries: Some(5),
                ..RemoteConfig::default()
            })
        );
        assert_eq!(sync.poll_config().await, None);
    }
}
