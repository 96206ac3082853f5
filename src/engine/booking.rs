use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits;
use crate::model::{
    BookingRequest, DayAvailability, Event, Medium, Session, SessionStatus, SlotOpening,
};
use crate::notify::{Notice, NotificationKind};

use super::{Engine, EngineError};

impl Engine {
    /// Book a session with a coach. The whole check-then-insert sequence runs
    /// under the coach's write lock, so two clients racing for the same time
    /// cannot both succeed.
    pub async fn book_session(
        &self,
        client_id: Ulid,
        req: BookingRequest,
    ) -> Result<Session, EngineError> {
        if client_id == req.coach_id {
            return Err(EngineError::Validation(
                "coach cannot book a session with themselves".into(),
            ));
        }
        if req.window.start >= req.window.end {
            return Err(EngineError::Validation(
                "start time must be before end time".into(),
            ));
        }
        if let Some(title) = &req.title
            && title.len() > limits::MAX_TITLE_LEN
        {
            return Err(EngineError::LimitExceeded("title length"));
        }
        if let Some(notes) = &req.notes
            && notes.len() > limits::MAX_NOTE_LEN
        {
            return Err(EngineError::LimitExceeded("notes length"));
        }

        // A coach with no schedule has no slots, so nothing can match.
        let shared = self.schedule(&req.coach_id).ok_or(EngineError::InvalidSlot)?;
        let mut sched = shared.write().await;

        if sched.session(req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if sched.sessions.len() >= limits::MAX_SESSIONS_PER_COACH {
            return Err(EngineError::LimitExceeded("sessions per coach"));
        }

        let slot = match req.slot_id {
            Some(slot_id) => sched.slot(slot_id).ok_or(EngineError::InvalidSlot)?,
            None => sched
                .slots
                .iter()
                .find(|s| s.day.covers(req.scheduled_date) && s.window == req.window)
                .ok_or(EngineError::InvalidSlot)?,
        };
        if !slot.available || !slot.day.covers(req.scheduled_date) || slot.window != req.window {
            return Err(EngineError::InvalidSlot);
        }

        let medium = match req.medium {
            Some(m) => {
                if m == Medium::Both || !slot.medium.permits(m) {
                    return Err(EngineError::Validation(format!(
                        "slot does not offer {m} sessions"
                    )));
                }
                m
            }
            // Caller didn't say; the slot's medium carries over, both
            // included.
            None => slot.medium,
        };
        let slot_id = slot.id;
        // The slot's declared session length, which may be shorter than its
        // window.
        let duration_min = slot.duration_min;

        if sched
            .active_session_at(req.scheduled_date, req.window.start)
            .is_some()
        {
            return Err(EngineError::SlotTaken);
        }

        let session = Session {
            id: req.id,
            coach_id: req.coach_id,
            client_id,
            slot_id: Some(slot_id),
            date: req.scheduled_date,
            window: req.window,
            duration_min,
            medium,
            status: SessionStatus::Scheduled,
            title: req.title,
            notes: req.notes,
            coach_notes: None,
            client_notes: None,
            meeting_link: None,
            location: None,
            canceled_at: None,
            canceled_by: None,
            cancel_reason: None,
            completed_at: None,
            reminder60_sent: false,
            reminder30_sent: false,
            starting_now_sent: false,
        };
        self.persist_and_apply(
            &mut sched,
            &Event::SessionBooked {
                session: session.clone(),
            },
        )
        .await?;
        drop(sched);

        tracing::info!(
            session_id = %session.id,
            coach_id = %session.coach_id,
            client_id = %client_id,
            date = %session.date,
            "session booked"
        );
        let client_name = self
            .directory
            .display_name(client_id)
            .unwrap_or_else(|| client_id.to_string());
        self.notify.deliver(Notice {
            recipient: session.coach_id,
            kind: NotificationKind::SessionBooked,
            payload: serde_json::json!({
                "session_id": session.id.to_string(),
                "client": client_name,
                "date": session.date.to_string(),
                "start": session.window.start.to_string(),
            }),
        });

        Ok(session)
    }

    /// Day-by-day availability for a coach over an inclusive date range.
    /// Read-only; never mutates state.
    pub async fn get_availability(
        &self,
        coach_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        if from > to {
            return Err(EngineError::Validation(
                "range start must not be after range end".into(),
            ));
        }
        if (to - from).num_days() >= limits::MAX_AVAILABILITY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("availability window days"));
        }

        let shared = match self.schedule(&coach_id) {
            Some(s) => s,
            None => {
                return Ok(from
                    .iter_days()
                    .take_while(|d| *d <= to)
                    .map(|date| DayAvailability {
                        date,
                        slots: Vec::new(),
                    })
                    .collect());
            }
        };
        let sched = shared.read().await;

        let mut days = Vec::new();
        for date in from.iter_days().take_while(|d| *d <= to) {
            let mut slots: Vec<SlotOpening> = sched
                .slots
                .iter()
                .filter(|s| s.available && s.day.covers(date))
                .map(|s| SlotOpening {
                    slot_id: s.id,
                    window: s.window,
                    duration_min: s.duration_min,
                    medium: s.medium,
                    is_booked: sched.sessions.iter().any(|sess| {
                        sess.is_active() && sess.date == date && sess.window == s.window
                    }),
                })
                .collect();
            slots.sort_by_key(|s| s.window.start);
            days.push(DayAvailability { date, slots });
        }
        Ok(days)
    }
}
