use crate::bar::Operation;
use ratatui::{
    buffer::Buffer,
    crossterm::event::{Event, KeyCode, KeyEvent},
    layout::{Constraint, Layout, Margin, Position, Rect},
    style::Stylize,
    text::Line,
    widgets::{Block, BorderType, Clear, Padding, Paragraph, StatefulWidget, Widget, Wrap},
};
use tui_input::{Input, backend::crossterm::EventHandler};

#[derive(Debug)]
pub enum State {
    Open,
    Confirmed,
    Dismissed,
}

#[derive(Debug)]
pub enum Popup {
    /// Asks for the parcel or payment reference of a new session.
    Reference(Operation, Input),
    Confirm(Operation),
    Refused(String),
}

impl Popup {
    pub fn handle_event(&mut self, event: &Event) -> State {
        if let Some(KeyEvent { code, .. }) = event.as_key_press_event() {
            match code {
                KeyCode::Enter => {
                    return State::Confirmed;
                }
                KeyCode::Esc => {
                    return State::Dismissed;
                }
                _ => {}
            }
        }

        if let Self::Reference(_, input) = self {
            input.handle_event(event);
        }

        State::Open
    }

    fn render_reference_prompt(area: Rect, buf: &mut Buffer, op: &str, input: &Input) -> Position {
        let par = Paragraph::new(vec![
            Line::from(vec![
                "Please enter the reference for the ".into(),
                op.bold(),
                " session.".into(),
            ]),
            Line::default(),
            Line::from(vec![
                "Scanned codes use the form ".into(),
                "DELIVERY:<REFERENCE>".bold(),
                ", enter only the reference.".into(),
            ]),
        ])
        .wrap(Wrap { trim: false });

        // Split message into multiple lines if too long
        let width = par.line_width().min(area.width.saturating_sub(50) as usize);
        let lines = par.line_count(width as u16);

        let inner = Self::render_popup(area, buf, "Start session", width, lines + 2);
        let [top, bottom] =
            Layout::vertical([Constraint::Fill(1), Constraint::Length(1)]).areas(inner);

        par.render(top, buf);
        input.value().render(bottom, buf);

        (bottom.x + input.visual_cursor() as u16, bottom.y).into()
    }

    fn render_confirm(area: Rect, buf: &mut Buffer, op: &str) {
        let msg = Line::from(vec!["Press enter to ".into(), op.to_lowercase().bold(), ".".into()]);
        let inner = Self::render_popup(area, buf, "Confirm", msg.width(), 1);

        msg.render(inner, buf);
    }

    fn render_refused(area: Rect, buf: &mut Buffer, reason: &str) {
        let msg = Line::from(reason);
        let inner = Self::render_popup(area, buf, "Request refused", msg.width(), 1);

        msg.render(inner, buf);
    }

    fn render_popup(
        area: Rect,
        buf: &mut Buffer,
        title: &str,
        width: usize,
        height: usize,
    ) -> Rect {
        // Increase size by block padding and border
        let pad = Padding::proportional(1);
        let width = (width as u16) + pad.left + pad.right + 2;
        let height = (height as u16) + pad.top + pad.bottom + 2;
        let popup = area.centered(Constraint::Length(width), Constraint::Length(height));
        let block = Block::bordered()
            .border_type(BorderType::Rounded)
            .padding(pad)
            .title(Line::from(vec![" ".into(), title.bold(), " ".into()]).centered());
        let inner = block.inner(popup);

        // Clear area around the block with additional margin
        Clear.render(popup.outer(Margin::new(2, 1)), buf);
        block.render(popup, buf);

        inner
    }
}

impl StatefulWidget for &Popup {
    type State = Option<Position>;

    fn render(self, area: Rect, buf: &mut Buffer, state: &mut Self::State) {
        match self {
            Popup::Reference(op, input) => {
                // Update state with current input prompt cursor position
                *state = Some(Popup::render_reference_prompt(area, buf, op.name(), input));
            }
            Popup::Confirm(op) => Popup::render_confirm(area, buf, op.name()),
            Popup::Refused(reason) => Popup::render_refused(area, buf, reason),
        }
    }
}
