mod bar;
mod console;
mod popup;
mod table;
mod worker;

use crate::{
    console::Console,
    worker::{Response, Worker},
};
use anyhow::{Context, Result};
use clap::Parser;
use futures::{StreamExt, future::FutureExt};
use parcelbox::{
    config::Config,
    serial::{self, Port},
};
use ratatui::{
    DefaultTerminal,
    buffer::Buffer,
    crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyModifiers},
    layout::{Constraint, Flex, Layout, Margin, Position, Rect},
    style::Stylize,
    text::Line,
    widgets::{Block, BorderType, Borders, Padding, StatefulWidget, Widget},
};
use std::time::Duration;
use tokio::task::LocalSet;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Serial port of the actuator controller (e.g. /dev/ttyUSB0)
    serial_port: String,

    /// Seconds a session waits for the door to be closed
    #[arg(long, default_value_t = 60)]
    door_timeout: u64,

    /// Milliseconds the door sensor may lag behind an actuation
    #[arg(long, default_value_t = 2000)]
    grace_period: u64,
}

#[derive(Default, Debug)]
struct App {
    console: Option<Console>,
    stopped: Option<String>,
    should_exit: bool,
}

impl App {
    async fn run(&mut self, port: Port, config: Config, term: &mut DefaultTerminal) -> Result<()> {
        let mut events = EventStream::new();
        let (tx, mut rx) = Worker::start(port, config);

        self.console = Some(Console::new(tx));

        while !self.should_exit {
            // Draw terminal widgets
            term.draw(|frame| {
                let mut cursor_pos = None;

                frame.render_stateful_widget(&*self, frame.area(), &mut cursor_pos);

                if let Some(pos) = cursor_pos {
                    frame.set_cursor_position(pos);
                }
            })?;

            // Handle terminal events and worker responses
            tokio::select! {
                Some(evt) = events.next().fuse() => self
                    .handle_event(&evt?).context("Failed to handle event")?,
                Some(resp) = rx.recv() => self.handle_worker_response(resp),
            }
        }

        Ok(())
    }

    fn handle_event(&mut self, event: &Event) -> Result<()> {
        if let Some(console) = &mut self.console
            && console.handle_event(event)?
        {
            // Event was handled by console
            return Ok(());
        }

        if let Some(KeyEvent {
            code, modifiers, ..
        }) = event.as_key_press_event()
        {
            match code {
                KeyCode::Char('q') => self.should_exit = true,
                KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                    self.should_exit = true;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn handle_worker_response(&mut self, resp: Response) {
        match resp {
            Response::Stopped(reason) => {
                self.console = None;
                self.stopped = Some(reason);
            }
            _ => {
                if let Some(console) = &mut self.console {
                    console.handle_worker_response(resp);
                }
            }
        }
    }
}

impl StatefulWidget for &App {
    type State = Option<Position>;

    fn render(self, area: Rect, buf: &mut Buffer, state: &mut Self::State) {
        let area = area.inner(Margin::new(1, 0));
        let block = Block::bordered()
            .borders(Borders::TOP)
            .border_type(BorderType::Double)
            .padding(Padding::top(1))
            .title(
                Line::from(vec![
                    " ".into(),
                    "Parcel Box Console ".into(),
                    env!("CARGO_PKG_VERSION").into(),
                    " ".into(),
                ])
                .bold()
                .centered(),
            );
        let inner = block.inner(area);

        if let Some(console) = &self.console {
            // Console might set cursor position state
            console.render(inner, buf, state);
        } else {
            let [center] = Layout::vertical([Constraint::Length(1)])
                .flex(Flex::Center)
                .areas(inner);
            let msg = match &self.stopped {
                Some(reason) => format!("Control loop stopped: {reason}. Press q to quit."),
                None => "Starting control loop...".to_string(),
            };

            msg.bold().into_centered_line().render(center, buf);
        }

        block.render(area, buf);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = Config::default()
        .with_door_timeout(Duration::from_secs(args.door_timeout))
        .with_grace_period(Duration::from_millis(args.grace_period));
    let port = serial::open(&args.serial_port).context("Failed to open serial port")?;
    let mut term = ratatui::init();
    let res = LocalSet::new()
        .run_until(async move { App::default().run(port, config, &mut term).await })
        .await;

    ratatui::restore();

    res
}
