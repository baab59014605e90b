use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds; the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted ranges.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict on both bounds: spans that only share an endpoint do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Canceled,
    Completed,
}

impl ReservationStatus {
    /// Pending and confirmed reservations hold the vehicle.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Completed)
    }

    /// Allowed lifecycle edges. Staying in the same status is not a transition.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Canceled) | (Confirmed, Canceled) | (Confirmed, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Canceled => "canceled",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// A client's claim on a vehicle for a time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub client_id: Ulid,
    pub carrier_id: Option<Ulid>,
    pub span: Span,
    pub status: ReservationStatus,
    /// Where reminders for this trip are delivered.
    pub contact: String,
    pub notification_sent: bool,
    pub created_at: Ms,
}

/// Input to `Engine::create_reservation`.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub client_id: Ulid,
    pub carrier_id: Option<Ulid>,
    pub span: Span,
    pub contact: String,
}

/// Partial update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub resource_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<ReservationStatus>,
}

impl ReservationPatch {
    pub fn status(status: ReservationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn range(span: Span) -> Self {
        Self {
            start: Some(span.start),
            end: Some(span.end),
            ..Self::default()
        }
    }
}

/// Per-vehicle conflict set. Reservations of every status are kept, sorted by `span.start`;
/// only blocking ones count toward conflicts.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps the query window, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Overlapping reservations that still hold the vehicle.
    pub fn blocking(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.status.is_blocking())
    }
}

// ── Mailings ─────────────────────────────────────────────────────

/// Opaque reference to one scheduled firing of a mailing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub Ulid);

impl JobHandle {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MailingKind {
    #[default]
    Notification,
    Promotion,
    Reminder,
}

impl MailingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::Promotion => "promotion",
            Self::Reminder => "reminder",
        }
    }
}

impl FromStr for MailingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "notification" => Ok(Self::Notification),
            "promotion" => Ok(Self::Promotion),
            "reminder" => Ok(Self::Reminder),
            other => Err(format!("unknown mailing kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailing {
    pub id: Ulid,
    pub subject: String,
    pub body: String,
    pub send_time: Ms,
    pub kind: MailingKind,
    /// Dispatch was initiated; per-address results live in `failed_recipients`.
    pub is_sent: bool,
    pub job_handle: Option<JobHandle>,
    /// Append-only audit trail of addresses that could not be delivered.
    pub failed_recipients: Vec<String>,
    /// Set when a fire found nothing to do (e.g. no subscribers).
    pub skipped: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone)]
pub struct NewMailing {
    pub id: Ulid,
    pub subject: String,
    pub body: String,
    pub send_time: Ms,
    pub kind: MailingKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailingPatch {
    pub subject: Option<String>,
    pub body: Option<String>,
    pub send_time: Option<Ms>,
    pub kind: Option<MailingKind>,
}

/// Opt-in state of one user for one mailing. Unique per `(user_id, mailing_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub mailing_id: Ulid,
    pub user_id: Ulid,
    pub email: String,
    pub subscribed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Reminder,
    Status,
    Custom,
}

/// Informational record of a message sent about a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub kind: NotificationKind,
    pub message: String,
    pub sent_at: Ms,
    pub read: bool,
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        id: Ulid,
        /// Resource the reservation was on before this update.
        from_resource: Ulid,
        resource_id: Ulid,
        span: Span,
        status: ReservationStatus,
    },
    ReservationDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
    ReminderFlagSet {
        id: Ulid,
        resource_id: Ulid,
        sent: bool,
    },
    NotificationRecorded {
        notification: Notification,
    },
    MailingCreated {
        mailing: Mailing,
    },
    MailingUpdated {
        id: Ulid,
        subject: String,
        body: String,
        send_time: Ms,
        kind: MailingKind,
        updated_at: Ms,
    },
    MailingDeleted {
        id: Ulid,
    },
    MailingArmed {
        id: Ulid,
        job: Option<JobHandle>,
    },
    MailingSent {
        id: Ulid,
    },
    MailingSkipped {
        id: Ulid,
        reason: String,
    },
    FailedRecipientsRecorded {
        id: Ulid,
        recipients: Vec<String>,
    },
    SubscriptionSet {
        subscription: Subscription,
    },
}

impl Event {
    /// The vehicle whose conflict set this event touches, if any.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::ReservationCreated { reservation } => Some(reservation.resource_id),
            Event::ReservationUpdated { resource_id, .. }
            | Event::ReservationDeleted { resource_id, .. }
            | Event::ReminderFlagSet { resource_id, .. } => Some(*resource_id),
            _ => None,
        }
    }
}
