use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits;
use crate::model::{DayKey, Event, SlotPatch, TimeSlot};

use super::{Engine, EngineError};

fn validate_slot(slot: &TimeSlot) -> Result<(), EngineError> {
    if slot.window.start >= slot.window.end {
        return Err(EngineError::Validation(
            "start time must be before end time".into(),
        ));
    }
    if let DayKey::Week(dow) = slot.day
        && dow > 6
    {
        return Err(EngineError::Validation(format!(
            "day of week must be 0..=6, got {dow}"
        )));
    }
    if !(limits::MIN_SESSION_MINUTES..=limits::MAX_SESSION_MINUTES).contains(&slot.duration_min) {
        return Err(EngineError::Validation(format!(
            "session duration must be {}..={} minutes",
            limits::MIN_SESSION_MINUTES,
            limits::MAX_SESSION_MINUTES
        )));
    }
    if let Some(note) = &slot.note
        && note.len() > limits::MAX_NOTE_LEN
    {
        return Err(EngineError::LimitExceeded("note length"));
    }
    Ok(())
}

impl Engine {
    /// Declare a new availability slot for `slot.coach_id`.
    ///
    /// Rejects a window that overlaps a currently available slot on the same
    /// day key. Disabled siblings don't count, so a coach who switched a slot
    /// off can publish a replacement over the same window.
    pub async fn create_slot(&self, slot: TimeSlot) -> Result<TimeSlot, EngineError> {
        validate_slot(&slot)?;

        let shared = self.schedule_entry(slot.coach_id)?;
        let mut sched = shared.write().await;

        if sched.slot(slot.id).is_some() {
            return Err(EngineError::AlreadyExists(slot.id));
        }
        if sched.slots.len() >= limits::MAX_SLOTS_PER_COACH {
            return Err(EngineError::LimitExceeded("slots per coach"));
        }
        if let Some(existing) = sched
            .slots
            .iter()
            .find(|s| s.available && s.day == slot.day && s.window.overlaps(&slot.window))
        {
            return Err(EngineError::Overlap(existing.id));
        }

        self.persist_and_apply(&mut sched, &Event::SlotCreated { slot: slot.clone() })
            .await?;
        tracing::debug!(slot_id = %slot.id, coach_id = %slot.coach_id, "slot created");
        Ok(slot)
    }

    /// Partial update of a slot the actor owns. The patched window is
    /// validated for shape, but not re-checked against sibling slots.
    pub async fn update_slot(
        &self,
        coach_id: Ulid,
        slot_id: Ulid,
        patch: SlotPatch,
    ) -> Result<TimeSlot, EngineError> {
        let owner = self
            .coach_of_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        if owner != coach_id {
            return Err(EngineError::Forbidden(coach_id));
        }
        let shared = self
            .schedule(&owner)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut sched = shared.write().await;

        let mut slot = sched
            .slot(slot_id)
            .cloned()
            .ok_or(EngineError::NotFound(slot_id))?;
        if let Some(start) = patch.start {
            slot.window.start = start;
        }
        if let Some(end) = patch.end {
            slot.window.end = end;
        }
        if let Some(available) = patch.available {
            slot.available = available;
        }
        if let Some(duration) = patch.duration_min {
            slot.duration_min = duration;
        }
        if let Some(medium) = patch.medium {
            slot.medium = medium;
        }
        if let Some(note) = patch.note {
            slot.note = Some(note);
        }
        validate_slot(&slot)?;

        self.persist_and_apply(&mut sched, &Event::SlotUpdated { slot: slot.clone() })
            .await?;
        Ok(slot)
    }

    /// Remove a slot, unless any future (or today's) active session still
    /// references it.
    pub async fn delete_slot(
        &self,
        coach_id: Ulid,
        slot_id: Ulid,
        today: NaiveDate,
    ) -> Result<(), EngineError> {
        let owner = self
            .coach_of_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        if owner != coach_id {
            return Err(EngineError::Forbidden(coach_id));
        }
        let shared = self
            .schedule(&owner)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut sched = shared.write().await;

        if sched.slot(slot_id).is_none() {
            return Err(EngineError::NotFound(slot_id));
        }
        let pending = sched
            .sessions
            .iter()
            .filter(|s| s.slot_id == Some(slot_id) && s.is_active() && s.date >= today)
            .count();
        if pending > 0 {
            return Err(EngineError::Conflict(pending));
        }

        self.persist_and_apply(
            &mut sched,
            &Event::SlotDeleted {
                id: slot_id,
                coach_id: owner,
            },
        )
        .await?;
        tracing::debug!(slot_id = %slot_id, coach_id = %owner, "slot deleted");
        Ok(())
    }

    /// All of a coach's slots, ordered by (day key, start time).
    pub async fn list_slots(&self, coach_id: Ulid) -> Vec<TimeSlot> {
        match self.schedule(&coach_id) {
            Some(shared) => shared.read().await.slots.clone(),
            None => Vec::new(),
        }
    }
}
