use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::limits;
use crate::model::{Event, Role, Session, SessionFilter, SessionPatch, SessionStatus};
use crate::notify::{Notice, NotificationKind};

use super::{Engine, EngineError};

/// Whether `role` may move a session from `from` to `to`.
///
/// Authority: cancellation is open to both participants (from scheduled or
/// confirmed only); every other transition belongs to the coach. Terminal
/// states are final.
pub fn check_transition(
    from: SessionStatus,
    to: SessionStatus,
    role: Role,
) -> Result<(), EngineError> {
    let invalid = || EngineError::InvalidTransition { from, to };
    if from.is_terminal() || to == from {
        return Err(invalid());
    }
    match to {
        SessionStatus::Canceled => {
            if !matches!(from, SessionStatus::Scheduled | SessionStatus::Confirmed) {
                return Err(invalid());
            }
            Ok(())
        }
        SessionStatus::Confirmed
        | SessionStatus::InProgress
        | SessionStatus::Completed
        | SessionStatus::NoShow => {
            if role != Role::Coach {
                return Err(invalid());
            }
            match (from, to) {
                (SessionStatus::Scheduled, SessionStatus::Confirmed)
                | (SessionStatus::Scheduled, SessionStatus::InProgress)
                | (SessionStatus::Confirmed, SessionStatus::InProgress)
                | (SessionStatus::Scheduled, SessionStatus::NoShow)
                | (SessionStatus::Confirmed, SessionStatus::NoShow)
                | (SessionStatus::InProgress, SessionStatus::NoShow)
                | (SessionStatus::InProgress, SessionStatus::Completed)
                | (SessionStatus::Confirmed, SessionStatus::Completed)
                | (SessionStatus::Scheduled, SessionStatus::Completed) => Ok(()),
                _ => Err(invalid()),
            }
        }
        // Nothing re-enters scheduled.
        SessionStatus::Scheduled => Err(invalid()),
    }
}

fn validate_patch(patch: &SessionPatch) -> Result<(), EngineError> {
    if let Some(title) = &patch.title
        && title.len() > limits::MAX_TITLE_LEN
    {
        return Err(EngineError::LimitExceeded("title length"));
    }
    for notes in [
        &patch.notes,
        &patch.coach_notes,
        &patch.client_notes,
        &patch.cancel_reason,
    ]
    .into_iter()
    .flatten()
    {
        if notes.len() > limits::MAX_NOTE_LEN {
            return Err(EngineError::LimitExceeded("notes length"));
        }
    }
    Ok(())
}

impl Engine {
    /// Update a session as `actor_id`. Status changes go through the state
    /// machine; field writes are permission-checked per field. A patch with
    /// `status = canceled` takes the cancellation path, recording who
    /// canceled and why.
    pub async fn update_session(
        &self,
        actor_id: Ulid,
        session_id: Ulid,
        patch: SessionPatch,
        now: NaiveDateTime,
    ) -> Result<Session, EngineError> {
        validate_patch(&patch)?;

        let coach_id = self
            .coach_of_session(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let shared = self
            .schedule(&coach_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let mut sched = shared.write().await;

        let session = sched
            .session(session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let role = session
            .role_of(actor_id)
            .ok_or(EngineError::Forbidden(actor_id))?;
        let from = session.status;

        // Field permissions: coach-only operational fields, client-only
        // client notes, shared title/notes. A write the actor is not
        // entitled to is rejected outright rather than dropped.
        if role != Role::Coach
            && (patch.coach_notes.is_some()
                || patch.meeting_link.is_some()
                || patch.location.is_some())
        {
            return Err(EngineError::Forbidden(actor_id));
        }
        if role != Role::Client && patch.client_notes.is_some() {
            return Err(EngineError::Forbidden(actor_id));
        }

        if let Some(to) = patch.status {
            check_transition(from, to, role)?;
            let reason = if to == SessionStatus::Canceled {
                patch.cancel_reason.clone()
            } else {
                None
            };
            self.persist_and_apply(
                &mut sched,
                &Event::SessionStatusChanged {
                    id: session_id,
                    coach_id,
                    status: to,
                    at: now,
                    by: Some(role),
                    reason,
                },
            )
            .await?;
        }

        if patch.has_field_updates() {
            self.persist_and_apply(
                &mut sched,
                &Event::SessionFieldsUpdated {
                    id: session_id,
                    coach_id,
                    title: patch.title.clone(),
                    notes: patch.notes.clone(),
                    coach_notes: patch.coach_notes.clone(),
                    client_notes: patch.client_notes.clone(),
                    meeting_link: patch.meeting_link.clone(),
                    location: patch.location.clone(),
                },
            )
            .await?;
        }

        let updated = sched
            .session(session_id)
            .cloned()
            .ok_or(EngineError::NotFound(session_id))?;
        drop(sched);

        match patch.status {
            Some(SessionStatus::Confirmed) => {
                self.notify_participant(&updated, Role::Client, NotificationKind::SessionConfirmed);
            }
            Some(SessionStatus::Canceled) => {
                // Tell the party that didn't cancel.
                let other = match role {
                    Role::Coach => Role::Client,
                    Role::Client => Role::Coach,
                };
                self.notify_participant(&updated, other, NotificationKind::SessionCanceled);
            }
            _ => {}
        }

        Ok(updated)
    }

    /// Cancel shortcut: equivalent to an update with `status = canceled`.
    pub async fn cancel_session(
        &self,
        actor_id: Ulid,
        session_id: Ulid,
        reason: Option<String>,
        now: NaiveDateTime,
    ) -> Result<Session, EngineError> {
        self.update_session(
            actor_id,
            session_id,
            SessionPatch {
                status: Some(SessionStatus::Canceled),
                cancel_reason: reason,
                ..Default::default()
            },
            now,
        )
        .await
    }

    /// Fetch one session; only its two participants may see it.
    pub async fn get_session(
        &self,
        actor_id: Ulid,
        session_id: Ulid,
    ) -> Result<Session, EngineError> {
        let coach_id = self
            .coach_of_session(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let shared = self
            .schedule(&coach_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let sched = shared.read().await;
        let session = sched
            .session(session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        if session.role_of(actor_id).is_none() {
            return Err(EngineError::Forbidden(actor_id));
        }
        Ok(session.clone())
    }

    /// Sessions visible to `actor_id` (as coach or as client), filtered and
    /// sorted by (date, start time).
    pub async fn list_sessions(
        &self,
        actor_id: Ulid,
        filter: SessionFilter,
        today: chrono::NaiveDate,
    ) -> Vec<Session> {
        let mut out: Vec<Session> = Vec::new();

        if let Some(shared) = self.schedule(&actor_id) {
            let sched = shared.read().await;
            out.extend(sched.sessions.iter().cloned());
        }

        if let Some(ids) = self.client_sessions.get(&actor_id) {
            let ids = ids.value().clone();
            for id in ids {
                let Some(coach_id) = self.coach_of_session(&id) else {
                    continue;
                };
                let Some(shared) = self.schedule(&coach_id) else {
                    continue;
                };
                let sched = shared.read().await;
                if let Some(s) = sched.session(id) {
                    out.push(s.clone());
                }
            }
        }

        out.retain(|s| {
            if let Some(status) = filter.status
                && s.status != status
            {
                return false;
            }
            if let Some(date) = filter.date
                && s.date != date
            {
                return false;
            }
            if filter.upcoming {
                let pending = matches!(
                    s.status,
                    SessionStatus::Scheduled | SessionStatus::Confirmed
                );
                if !pending || s.date < today {
                    return false;
                }
            }
            true
        });
        out.sort_by_key(|s| (s.date, s.window.start));
        out
    }

    pub(super) fn notify_participant(
        &self,
        session: &Session,
        recipient_role: Role,
        kind: NotificationKind,
    ) {
        let recipient = match recipient_role {
            Role::Coach => session.coach_id,
            Role::Client => session.client_id,
        };
        let other = session.counterparty(recipient_role);
        let other_name = self
            .directory
            .display_name(other)
            .unwrap_or_else(|| other.to_string());
        self.notify.deliver(Notice {
            recipient,
            kind,
            payload: serde_json::json!({
                "session_id": session.id.to_string(),
                "with": other_name,
                "date": session.date.to_string(),
                "start": session.window.start.to_string(),
                "status": session.status.to_string(),
            }),
        });
    }
}
