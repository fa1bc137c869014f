use parcelbox::{frame::LockId, session::SessionKind};
use ratatui::{
    buffer::Buffer,
    crossterm::event::{Event, KeyCode, KeyEvent},
    layout::Rect,
    style::Stylize,
    text::Line,
    widgets::Widget,
};

// Maximum number of rendered operations, limited by number of usable function keys
const MAX_NUM_OPERATIONS: usize = 10;

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Operation {
    Begin(LockId, SessionKind),
    Cancel(LockId),
    Reset(LockId),
    Buzz,
    Status,
}

impl Operation {
    pub const ALL: &'static [Self] = &[
        Self::Begin(LockId::Parcel, SessionKind::Delivery),
        Self::Begin(LockId::Parcel, SessionKind::Pickup),
        Self::Begin(LockId::Payment, SessionKind::Pickup),
        Self::Cancel(LockId::Parcel),
        Self::Cancel(LockId::Payment),
        Self::Reset(LockId::Parcel),
        Self::Reset(LockId::Payment),
        Self::Buzz,
        Self::Status,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Begin(LockId::Parcel, SessionKind::Delivery) => "Deliver",
            Self::Begin(LockId::Parcel, SessionKind::Pickup) => "Collect",
            Self::Begin(LockId::Payment, SessionKind::Delivery) => "Deposit",
            Self::Begin(LockId::Payment, SessionKind::Pickup) => "Pay out",
            Self::Cancel(LockId::Parcel) => "Cancel door",
            Self::Cancel(LockId::Payment) => "Cancel box",
            Self::Reset(LockId::Parcel) => "Reset door",
            Self::Reset(LockId::Payment) => "Reset box",
            Self::Buzz => "Buzz",
            Self::Status => "Status",
        }
    }
}

#[derive(Debug)]
pub struct CommandBar {
    operations: &'static [Operation],
}

impl CommandBar {
    pub fn new(operations: &'static [Operation]) -> Self {
        Self { operations }
    }

    pub fn event_to_operation(&self, event: &Event) -> Option<Operation> {
        if let Some(KeyEvent {
            code: KeyCode::F(key),
            ..
        }) = event.as_key_press_event()
        {
            self.operations.get((key as usize).checked_sub(1)?).copied()
        } else {
            None
        }
    }
}

impl Widget for &CommandBar {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let len = MAX_NUM_OPERATIONS.min(self.operations.len());
        let spans = self
            .operations
            .iter()
            .take(MAX_NUM_OPERATIONS)
            .enumerate()
            .flat_map(|(i, op)| {
                // Map operations to function keys
                let name = op.name().into();
                let key = format!("<F{}>", i + 1).bold();

                if i + 1 == len {
                    [name, " ".into(), key, "".into()]
                } else {
                    [name, " ".into(), key, " | ".into()]
                }
            })
            .collect::<Vec<_>>();

        if spans.is_empty() {
            "No operations available.".render(area, buf);
        } else {
            Line::from(spans).render(area, buf);
        }
    }
}
