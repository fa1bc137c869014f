//! QR code input of the network controller.
//!
//! Codes have the form `<KIND>:<REFERENCE>`:
//!
//! | Kind       | Lock                    | Session                   |
//! |------------|-------------------------|---------------------------|
//! | `DELIVERY` | [`LockId::Parcel`]      | [`SessionKind::Delivery`] |
//! | `PICKUP`   | [`LockId::Parcel`]      | [`SessionKind::Pickup`]   |
//! | `PAYMENT`  | [`LockId::Payment`]     | [`SessionKind::Pickup`]   |

use crate::{clock::Instant, frame::LockId, session::SessionKind};
use alloc::string::{String, ToString};
use core::time::Duration;
use log::debug;
use strum::EnumString;

/// Time during which a repeated scan of the same code is ignored.
pub const SCAN_DEBOUNCE: Duration = Duration::from_millis(500);

/// Source of decoded QR codes.
#[allow(async_fn_in_trait)]
pub trait Scanner {
    /// Waits for the next decoded code.
    async fn read_qr(&mut self) -> Option<String>;
}

#[derive(EnumString, Copy, Clone, Debug)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum CodeKind {
    Delivery,
    Pickup,
    Payment,
}

/// Session requested by a scanned code.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ScanRequest {
    /// Lock to open.
    pub lock: LockId,
    /// Kind of transaction.
    pub kind: SessionKind,
    /// Parcel or payment reference.
    pub reference: String,
}

impl ScanRequest {
    /// Parses a scanned code.
    ///
    /// Returns `None` for unknown kinds and empty references.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        let (kind, reference) = code.trim().split_once(':')?;
        let reference = reference.trim();

        if reference.is_empty() {
            return None;
        }

        let (lock, kind) = match kind.parse().ok()? {
            CodeKind::Delivery => (LockId::Parcel, SessionKind::Delivery),
            CodeKind::Pickup => (LockId::Parcel, SessionKind::Pickup),
            CodeKind::Payment => (LockId::Payment, SessionKind::Pickup),
        };

        Some(Self {
            lock,
            kind,
            reference: reference.to_string(),
        })
    }
}

/// Suppresses repeated reads of the same code.
#[derive(Default, Debug)]
pub struct Debouncer {
    last: Option<(String, Instant)>,
}

impl Debouncer {
    /// Constructs a new debouncer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the code should be handled.
    pub fn accept(&mut self, code: &str, now: Instant) -> bool {
        let repeated = self
            .last
            .as_ref()
            .is_some_and(|(last, at)| last == code && now < *at + SCAN_DEBOUNCE);

        if repeated {
            debug!("Ignoring repeated scan of {code:?}");

            return false;
        }

        self.last = Some((code.to_string(), now));

        true
    }
}
