use anyhow::{Context, Result};
use log::{debug, error, info};
use parcelbox::{
    Error,
    clock::Instant,
    config::Config,
    controller::{Controller, DeviceStatus},
    frame::{LockId, Tone},
    history::HistoryEntry,
    lock::LockSnapshot,
    serial::{Port, TokioClock},
    session::{SessionKind, SessionRecord, SessionState},
};
use std::fmt::{self, Display, Formatter};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
};

// Number of history entries passed to the UI
const HISTORY_LEN: usize = 64;

#[derive(Debug)]
pub enum Request {
    Begin(LockId, SessionKind, String),
    Cancel(LockId),
    Reset(LockId),
    Buzz(Tone),
    QueryStatus,
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Begin(id, kind, reference) => write!(f, "{kind} {reference:?} on {id}"),
            Self::Cancel(id) => write!(f, "cancel session on {id}"),
            Self::Reset(id) => write!(f, "reset {id}"),
            Self::Buzz(tone) => write!(f, "buzz {tone}"),
            Self::QueryStatus => write!(f, "status query"),
        }
    }
}

#[derive(Debug)]
pub struct SessionView {
    pub kind: SessionKind,
    pub reference: String,
    pub state: SessionState,
    pub deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct Snapshot {
    pub now: Instant,
    pub config: Config,
    pub locks: [LockSnapshot; 2],
    pub sessions: [Option<SessionView>; 2],
    pub history: Vec<HistoryEntry>,
    pub archive: Vec<SessionRecord>,
    pub device: DeviceStatus,
}

#[derive(Debug)]
pub enum Response {
    Updated(Box<Snapshot>),
    Refused(String),
    Stopped(String),
}

pub struct Worker<'a> {
    ctrl: Controller<Port, TokioClock>,
    tx: &'a UnboundedSender<Response>,
}

impl Worker<'_> {
    pub fn start(port: Port, config: Config) -> (UnboundedSender<Request>, UnboundedReceiver<Response>) {
        let (req_tx, mut req_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();

        task::spawn_local(async move {
            let mut worker = Worker {
                ctrl: Controller::new(port, TokioClock::new(), config),
                tx: &tx,
            };

            if let Err(err) = worker.run(&mut req_rx).await {
                error!("Control loop stopped: {err:#}");

                let _ = tx.send(Response::Stopped(format!("{err:#}")));
            }
        });

        (req_tx, rx)
    }

    async fn run(&mut self, rx: &mut UnboundedReceiver<Request>) -> Result<()> {
        self.ctrl.home().await.context("Failed to home locks")?;

        loop {
            self.ctrl.tick().await.context("Failed to run control loop")?;

            // Requests are only handled between ticks
            while let Ok(req) = rx.try_recv() {
                self.handle_request(req).await?;
            }

            // No cloud mirror on the console
            while let Some(record) = self.ctrl.next_record() {
                debug!("Discarding record for {}", record.path());
            }

            self.tx.send(Response::Updated(Box::new(self.snapshot())))?;
        }
    }

    async fn handle_request(&mut self, req: Request) -> Result<()> {
        let desc = req.to_string();
        let res = match req {
            Request::Begin(id, kind, reference) => self.ctrl.begin(id, kind, reference),
            Request::Cancel(id) => self.ctrl.cancel(id),
            Request::Reset(id) => self.ctrl.reset(id).await,
            Request::Buzz(tone) => self.ctrl.buzz(tone).await.map(|_| ()),
            Request::QueryStatus => self.ctrl.query_status().await.map(|_| ()),
        };

        match res {
            Ok(()) => info!("Handled {desc}"),
            Err(Error::Io(err)) => return Err(err).context("Failed to access serial port"),
            Err(err) => self.tx.send(Response::Refused(format!("Cannot {desc}: {err}.")))?,
        }

        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        let history = self.ctrl.history().entries();
        let skip = history.len().saturating_sub(HISTORY_LEN);

        Snapshot {
            now: self.ctrl.now(),
            config: *self.ctrl.config(),
            locks: self.ctrl.snapshots(),
            sessions: LockId::ALL.map(|id| {
                self.ctrl.session(id).map(|sess| SessionView {
                    kind: sess.kind(),
                    reference: sess.reference().to_string(),
                    state: sess.state().clone(),
                    deadline: sess.next_deadline(),
                })
            }),
            history: history.skip(skip).cloned().collect(),
            archive: self.ctrl.archive().cloned().collect(),
            device: self.ctrl.device_status().clone(),
        }
    }
}
