use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// ── Time primitives ──────────────────────────────────────────────

/// Minute-precision time of day on a 24-hour clock.
///
/// Stored as minutes since midnight; rendered as `HH:MM`. `Ord` follows clock
/// order, which matches the lexicographic order of the `HH:MM` form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self(u16::from(hour) * 60 + u16::from(minute)))
    }

    pub fn hour(self) -> u8 {
        (self.0 / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.0 % 60) as u8
    }

    /// Absolute instant of this time on the given calendar day (coach-local
    /// wall clock, no timezone normalization).
    pub fn on_date(self, date: NaiveDate) -> NaiveDateTime {
        date.and_hms_opt(u32::from(self.hour()), u32::from(self.minute()), 0)
            .expect("TimeOfDay is always a valid wall-clock time")
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl fmt::Debug for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseTimeError;

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "time must be HH:MM on a 24h clock")
    }
}

impl std::error::Error for ParseTimeError {}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s.split_once(':').ok_or(ParseTimeError)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(ParseTimeError);
        }
        let hour: u8 = h.parse().map_err(|_| ParseTimeError)?;
        let minute: u8 = m.parse().map_err(|_| ParseTimeError)?;
        TimeOfDay::new(hour, minute).ok_or(ParseTimeError)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ParseTimeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

/// Half-open same-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Window {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    /// The overlap predicate every conflict check in the engine reduces to.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_min(&self) -> u32 {
        u32::from(self.end.0 - self.start.0)
    }
}

/// Which days a slot applies to: a weekly recurrence (0 = Sunday … 6 =
/// Saturday) or a single calendar date. Mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DayKey {
    Week(u8),
    Date(NaiveDate),
}

impl DayKey {
    pub fn covers(&self, date: NaiveDate) -> bool {
        match self {
            DayKey::Week(dow) => *dow == weekday_index(date),
            DayKey::Date(d) => *d == date,
        }
    }
}

pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Domain enums ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Medium {
    Online,
    InPerson,
    Both,
}

impl Medium {
    /// Whether a slot declared with this medium accepts a session of `requested`.
    pub fn permits(&self, requested: Medium) -> bool {
        matches!(self, Medium::Both) || *self == requested
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Medium::Online => "online",
            Medium::InPerson => "in-person",
            Medium::Both => "both",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Medium {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Medium::Online),
            "in-person" => Ok(Medium::InPerson),
            "both" => Ok(Medium::Both),
            other => Err(format!("unknown medium: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Canceled,
    NoShow,
}

impl SessionStatus {
    /// Terminal states are final; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Canceled | SessionStatus::NoShow
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::InProgress => "in-progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Canceled => "canceled",
            SessionStatus::NoShow => "no-show",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "confirmed" => Ok(SessionStatus::Confirmed),
            "in-progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            "canceled" => Ok(SessionStatus::Canceled),
            "no-show" => Ok(SessionStatus::NoShow),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Which side of a session an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coach,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coach => write!(f, "coach"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Reminder thresholds, each with its own idempotency flag on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderKind {
    Hour,
    HalfHour,
    StartingNow,
}

impl ReminderKind {
    pub fn minutes(&self) -> i64 {
        match self {
            ReminderKind::Hour => 60,
            ReminderKind::HalfHour => 30,
            ReminderKind::StartingNow => 0,
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

/// A declared availability window owned by a coach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub coach_id: Ulid,
    pub day: DayKey,
    pub window: Window,
    pub duration_min: u32,
    pub medium: Medium,
    pub available: bool,
    pub note: Option<String>,
}

/// A concrete booked appointment between one coach and one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub coach_id: Ulid,
    pub client_id: Ulid,
    pub slot_id: Option<Ulid>,
    pub date: NaiveDate,
    pub window: Window,
    pub duration_min: u32,
    pub medium: Medium,
    pub status: SessionStatus,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub coach_notes: Option<String>,
    pub client_notes: Option<String>,
    pub meeting_link: Option<String>,
    pub location: Option<String>,
    pub canceled_at: Option<NaiveDateTime>,
    pub canceled_by: Option<Role>,
    pub cancel_reason: Option<String>,
    pub completed_at: Option<NaiveDateTime>,
    pub reminder60_sent: bool,
    pub reminder30_sent: bool,
    pub starting_now_sent: bool,
}

impl Session {
    /// Non-terminal sessions hold their date/time against other bookings.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.window.start.on_date(self.date)
    }

    pub fn role_of(&self, user_id: Ulid) -> Option<Role> {
        if user_id == self.coach_id {
            Some(Role::Coach)
        } else if user_id == self.client_id {
            Some(Role::Client)
        } else {
            None
        }
    }

    pub fn counterparty(&self, role: Role) -> Ulid {
        match role {
            Role::Coach => self.client_id,
            Role::Client => self.coach_id,
        }
    }

    pub fn reminder_sent(&self, kind: ReminderKind) -> bool {
        match kind {
            ReminderKind::Hour => self.reminder60_sent,
            ReminderKind::HalfHour => self.reminder30_sent,
            ReminderKind::StartingNow => self.starting_now_sent,
        }
    }

    pub fn mark_reminder(&mut self, kind: ReminderKind) {
        match kind {
            ReminderKind::Hour => self.reminder60_sent = true,
            ReminderKind::HalfHour => self.reminder30_sent = true,
            ReminderKind::StartingNow => self.starting_now_sent = true,
        }
    }
}

/// In-memory schedule for one coach: declared slots plus all sessions ever
/// booked with them, both kept sorted for scan-by-day queries.
#[derive(Debug, Clone)]
pub struct CoachSchedule {
    pub coach_id: Ulid,
    /// Sorted by (day key, window start).
    pub slots: Vec<TimeSlot>,
    /// Sorted by (date, window start).
    pub sessions: Vec<Session>,
}

impl CoachSchedule {
    pub fn new(coach_id: Ulid) -> Self {
        Self {
            coach_id,
            slots: Vec::new(),
            sessions: Vec::new(),
        }
    }

    pub fn insert_slot(&mut self, slot: TimeSlot) {
        let key = (slot.day, slot.window.start);
        let pos = self
            .slots
            .binary_search_by_key(&key, |s| (s.day, s.window.start))
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<TimeSlot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: Ulid) -> Option<&TimeSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: Ulid) -> Option<&mut TimeSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn insert_session(&mut self, session: Session) {
        let key = (session.date, session.window.start);
        let pos = self
            .sessions
            .binary_search_by_key(&key, |s| (s.date, s.window.start))
            .unwrap_or_else(|e| e);
        self.sessions.insert(pos, session);
    }

    pub fn session(&self, id: Ulid) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn session_mut(&mut self, id: Ulid) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// The non-terminal session occupying (date, start), if any. At most one
    /// exists; the booking path enforces that.
    pub fn active_session_at(&self, date: NaiveDate, start: TimeOfDay) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|s| s.is_active() && s.date == date && s.window.start == start)
    }
}

// ── Event log record format ──────────────────────────────────────

/// Everything the engine persists. Replaying these in order rebuilds the
/// full in-memory state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        slot: TimeSlot,
    },
    /// Full replacement of the slot after a patch was applied.
    SlotUpdated {
        slot: TimeSlot,
    },
    SlotDeleted {
        id: Ulid,
        coach_id: Ulid,
    },
    SessionBooked {
        session: Session,
    },
    SessionStatusChanged {
        id: Ulid,
        coach_id: Ulid,
        status: SessionStatus,
        at: NaiveDateTime,
        /// None for automatic transitions made by the scheduler sweeps.
        by: Option<Role>,
        reason: Option<String>,
    },
    SessionFieldsUpdated {
        id: Ulid,
        coach_id: Ulid,
        title: Option<String>,
        notes: Option<String>,
        coach_notes: Option<String>,
        client_notes: Option<String>,
        meeting_link: Option<String>,
        location: Option<String>,
    },
    ReminderMarked {
        id: Ulid,
        coach_id: Ulid,
        kind: ReminderKind,
    },
}

impl Event {
    /// Every event belongs to exactly one coach's schedule.
    pub fn coach_id(&self) -> Ulid {
        match self {
            Event::SlotCreated { slot } | Event::SlotUpdated { slot } => slot.coach_id,
            Event::SlotDeleted { coach_id, .. } => *coach_id,
            Event::SessionBooked { session } => session.coach_id,
            Event::SessionStatusChanged { coach_id, .. }
            | Event::SessionFieldsUpdated { coach_id, .. }
            | Event::ReminderMarked { coach_id, .. } => *coach_id,
        }
    }
}

// ── Request / result types ───────────────────────────────────────

/// Partial update to a slot. `None` fields are left untouched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SlotPatch {
    pub start: Option<TimeOfDay>,
    pub end: Option<TimeOfDay>,
    pub available: Option<bool>,
    pub duration_min: Option<u32>,
    pub medium: Option<Medium>,
    pub note: Option<String>,
}

/// A client's request to book a concrete session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub coach_id: Ulid,
    pub scheduled_date: NaiveDate,
    pub window: Window,
    pub medium: Option<Medium>,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub slot_id: Option<Ulid>,
}

/// Partial update to a session, routed through the state machine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub coach_notes: Option<String>,
    pub client_notes: Option<String>,
    pub meeting_link: Option<String>,
    pub location: Option<String>,
    pub cancel_reason: Option<String>,
}

impl SessionPatch {
    pub fn has_field_updates(&self) -> bool {
        self.title.is_some()
            || self.notes.is_some()
            || self.coach_notes.is_some()
            || self.client_notes.is_some()
            || self.meeting_link.is_some()
            || self.location.is_some()
    }
}

/// One bookable opening in a coach's day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOpening {
    pub slot_id: Ulid,
    pub window: Window,
    pub duration_min: u32,
    pub medium: Medium,
    pub is_booked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub slots: Vec<SlotOpening>,
}

/// Filters for session listing. All are conjunctive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub date: Option<NaiveDate>,
    pub upcoming: bool,
}

/// Counts from one reminder sweep tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub hour: usize,
    pub half_hour: usize,
    pub starting: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.hour + self.half_hour + self.starting
    }
}
