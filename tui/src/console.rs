use crate::{
    bar::{CommandBar, Operation},
    popup::{Popup, State},
    table::{Cell, InfoTable},
    worker::{Request, Response, Snapshot},
};
use anyhow::Result;
use parcelbox::{
    frame::{LockId, Tone},
    lock::Actuation,
    session::SessionState,
};
use ratatui::{
    buffer::Buffer,
    crossterm::event::Event,
    layout::{Constraint, Layout, Position, Rect},
    style::{Color, Stylize},
    text::Line,
    widgets::{Block, Borders, Padding, StatefulWidget, Widget},
};
use tokio::sync::mpsc::UnboundedSender;
use tui_input::Input;

#[derive(Debug)]
pub struct Console {
    locks: [InfoTable; 2],
    controller: InfoTable,
    history: InfoTable,
    bar: CommandBar,
    popup: Option<Popup>,
    uptime: Option<String>,
    update_counter: usize,
    tx: UnboundedSender<Request>,
}

impl Console {
    pub fn new(tx: UnboundedSender<Request>) -> Self {
        Self {
            locks: [
                InfoTable::new("Parcel Door", Color::Green),
                InfoTable::new("Payment Box", Color::Blue),
            ],
            controller: InfoTable::new("Actuator Controller", Color::Magenta),
            history: InfoTable::new("Lock History", Color::Red),
            bar: CommandBar::new(Operation::ALL),
            popup: None,
            uptime: None,
            update_counter: 0,
            tx,
        }
    }

    pub fn handle_event(&mut self, event: &Event) -> Result<bool> {
        if let Some(popup) = &mut self.popup {
            match popup.handle_event(event) {
                State::Dismissed => {
                    self.popup = None;
                }
                State::Confirmed => {
                    let req = match popup {
                        Popup::Reference(Operation::Begin(id, kind), input) => {
                            let reference = input.value().trim();

                            // Keep prompting until a reference was entered
                            if reference.is_empty() {
                                return Ok(true);
                            }

                            Some(Request::Begin(*id, *kind, reference.to_string()))
                        }
                        Popup::Confirm(Operation::Cancel(id)) => Some(Request::Cancel(*id)),
                        Popup::Confirm(Operation::Reset(id)) => Some(Request::Reset(*id)),
                        _ => None,
                    };

                    if let Some(req) = req {
                        self.tx.send(req)?;
                    }

                    self.popup = None;
                }
                State::Open => {}
            }

            Ok(true)
        } else if let Some(op) = self.bar.event_to_operation(event) {
            match op {
                Operation::Begin(..) => self.popup = Some(Popup::Reference(op, Input::default())),
                Operation::Cancel(_) | Operation::Reset(_) => self.popup = Some(Popup::Confirm(op)),
                Operation::Buzz => self.tx.send(Request::Buzz(Tone::Success))?,
                Operation::Status => self.tx.send(Request::QueryStatus)?,
            }

            Ok(true)
        } else {
            // Event wasn't handled
            Ok(false)
        }
    }

    pub fn handle_worker_response(&mut self, resp: Response) {
        match resp {
            Response::Updated(snapshot) => {
                for id in LockId::ALL {
                    self.locks[id.index()].update(lock_rows(&snapshot, id));
                }

                self.controller.update(controller_rows(&snapshot));
                self.history.update(history_rows(&snapshot));
                self.uptime = Some(snapshot.now.to_string());
                self.update_counter += 1;
            }
            Response::Refused(reason) => {
                self.popup = Some(Popup::Refused(reason));
            }
            Response::Stopped(_) => {}
        }
    }

    fn render_tables(&self, area: Rect, buf: &mut Buffer) {
        let [top, bottom] = Layout::vertical(vec![Constraint::Fill(1); 2])
            .spacing(1)
            .areas(area);
        let [top_left, top_right] = Layout::horizontal(vec![Constraint::Fill(1); 2])
            .spacing(2)
            .areas(top);
        let [bottom_left, bottom_right] = Layout::horizontal(vec![Constraint::Fill(1); 2])
            .spacing(2)
            .areas(bottom);

        self.locks[0].render(top_left, buf);
        self.locks[1].render(top_right, buf);
        self.controller.render(bottom_left, buf);
        self.history.render(bottom_right, buf);
    }

    fn render_bar(&self, area: Rect, buf: &mut Buffer) {
        let status = match &self.uptime {
            Some(uptime) => format!("Uptime: {uptime}"),
            None => "Homing locks...".to_string(),
        };
        let block = Block::bordered()
            .borders(Borders::TOP)
            .padding(Padding::proportional(1))
            .title("Operations ".bold())
            .title(
                Line::from(vec![
                    " ".into(),
                    status.into(),
                    " ".into(),
                    self.spinner().green(),
                    " ".into(),
                ])
                .bold()
                .right_aligned(),
            );

        self.bar.render(block.inner(area), buf);
        block.render(area, buf);
    }

    fn spinner(&self) -> String {
        let symbols = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
        let index = self.update_counter % symbols.len();

        symbols[index].to_string()
    }
}

fn lock_rows(snapshot: &Snapshot, id: LockId) -> Vec<(String, Cell)> {
    let lock = &snapshot.locks[id.index()];
    let relay = match lock.commanded {
        Some(Actuation::Open) => "Energized",
        Some(Actuation::Close) => "Released",
        None => "Unknown",
    };
    let mut rows: Vec<(String, Cell)> = vec![
        ("State".to_string(), lock.state.to_string().into()),
        (
            "Door".to_string(),
            Cell::Text(lock.door.map_or("Unknown".to_string(), |door| door.to_string())),
        ),
        ("Relay".to_string(), relay.into()),
        ("Since".to_string(), lock.since.to_string().into()),
    ];

    if let Some(sess) = &snapshot.sessions[id.index()] {
        rows.push((
            "Session".to_string(),
            format!("{} {}", sess.kind, sess.reference).into(),
        ));
        rows.push(("Progress".to_string(), sess.state.to_string().into()));

        if let (SessionState::AwaitingDoorEvent, Some(deadline)) = (&sess.state, sess.deadline) {
            let left = deadline.saturating_duration_since(snapshot.now);
            let total = snapshot.config.door_timeout.as_secs_f64();
            let ratio = if total > 0.0 {
                (left.as_secs_f64() / total).clamp(0.0, 1.0)
            } else {
                0.0
            };

            rows.push((
                "Door timeout".to_string(),
                Cell::Gauge(format!("{}s left", left.as_secs()), ratio),
            ));
        }
    } else {
        rows.push(("Session".to_string(), "None".into()));
    }

    if let Some(rec) = snapshot.archive.iter().rev().find(|rec| rec.lock == id) {
        rows.push((
            "Last session".to_string(),
            format!("{} {}: {}", rec.kind, rec.reference, rec.outcome).into(),
        ));
    }

    rows
}

fn controller_rows(snapshot: &Snapshot) -> Vec<(String, Cell)> {
    let dev = &snapshot.device;
    let mut rows: Vec<(String, Cell)> = vec![
        (
            "Reachable".to_string(),
            if dev.reachable { "Yes" } else { "No" }.into(),
        ),
        ("Last check".to_string(), dev.at.to_string().into()),
    ];

    if let Some(report) = &dev.report {
        for id in LockId::ALL {
            let door = report.door(id).map_or("?".to_string(), |door| door.to_string());
            let relay = report.relay(id).map_or("?".to_string(), |relay| relay.to_string());

            rows.push((
                format!("Lock {}", id.number()),
                format!("door {door}, relay {relay}").into(),
            ));
        }
    }

    rows.push((
        "Last error".to_string(),
        dev.last_error.as_deref().unwrap_or("None").into(),
    ));
    rows.push((
        "Dropped events".to_string(),
        dev.dropped_events.to_string().into(),
    ));

    rows
}

fn history_rows(snapshot: &Snapshot) -> Vec<(String, Cell)> {
    // Newest first
    snapshot
        .history
        .iter()
        .rev()
        .map(|entry| {
            (
                entry.at.to_string(),
                format!(
                    "{}: {} -> {} ({})",
                    entry.lock, entry.from, entry.to, entry.trigger
                )
                .into(),
            )
        })
        .collect()
}

impl StatefulWidget for &Console {
    type State = Option<Position>;

    fn render(self, area: Rect, buf: &mut Buffer, state: &mut Self::State) {
        let [top, bottom] = Layout::vertical([Constraint::Fill(1), Constraint::Length(4)])
            .spacing(1)
            .areas(area);

        self.render_tables(top, buf);
        self.render_bar(bottom, buf);

        if let Some(popup) = &self.popup {
            // Pass cursor position state to popup
            popup.render(top, buf, state);
        }
    }
}
