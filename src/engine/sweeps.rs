use chrono::{Duration, NaiveDateTime};
use ulid::Ulid;

use crate::model::{Event, ReminderKind, Role, SessionStatus, SweepReport};
use crate::notify::NotificationKind;

use super::{Engine, EngineError};

/// Tolerance around each reminder threshold. A sweep that fires every five
/// minutes lands somewhere inside the window; the flags keep repeats out.
const WINDOW_SLACK_MIN: i64 = 5;

impl Engine {
    /// One reminder pass over every schedule, against the provided clock.
    ///
    /// Only sessions scheduled for `now`'s calendar day are scanned, so a
    /// session shortly after midnight is reminded after midnight, not the
    /// evening before. Sessions in `scheduled` or `confirmed` get a reminder
    /// when their start
    /// falls inside the 60- or 30-minute window; sessions whose start is
    /// within the next ten minutes get a starting-now notice and are moved to
    /// `in-progress`. Each threshold fires at most once per session: the flag
    /// is persisted before delivery is attempted, so a failed delivery is
    /// not retried.
    pub async fn run_reminder_sweep(&self, now: NaiveDateTime) -> Result<SweepReport, EngineError> {
        // Skip if another sweep is still running; the next tick catches up.
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            tracing::warn!("reminder sweep still running, skipping tick");
            return Ok(SweepReport::default());
        };

        let mut report = SweepReport::default();
        let coach_ids: Vec<_> = self.state.iter().map(|e| *e.key()).collect();

        for coach_id in coach_ids {
            let Some(shared) = self.schedule(&coach_id) else {
                continue;
            };
            let mut sched = shared.write().await;

            let due: Vec<_> = sched
                .sessions
                .iter()
                .filter(|s| {
                    s.date == now.date()
                        && matches!(
                            s.status,
                            SessionStatus::Scheduled | SessionStatus::Confirmed
                        )
                })
                .filter_map(|s| due_reminder(s.starts_at(), now, s).map(|k| (s.id, k)))
                .collect();

            for (session_id, kind) in due {
                let result = self
                    .send_reminder(&mut sched, session_id, kind, now)
                    .await;
                match result {
                    Ok(()) => match kind {
                        ReminderKind::Hour => report.hour += 1,
                        ReminderKind::HalfHour => report.half_hour += 1,
                        ReminderKind::StartingNow => report.starting += 1,
                    },
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "reminder failed");
                    }
                }
            }
        }

        metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL)
            .increment(report.total() as u64);
        tracing::debug!(
            hour = report.hour,
            half_hour = report.half_hour,
            starting = report.starting,
            "reminder sweep done"
        );
        Ok(report)
    }

    async fn send_reminder(
        &self,
        sched: &mut crate::model::CoachSchedule,
        session_id: Ulid,
        kind: ReminderKind,
        now: NaiveDateTime,
    ) -> Result<(), EngineError> {
        let coach_id = sched.coach_id;
        self.persist_and_apply(
            sched,
            &Event::ReminderMarked {
                id: session_id,
                coach_id,
                kind,
            },
        )
        .await?;

        if kind == ReminderKind::StartingNow {
            self.persist_and_apply(
                sched,
                &Event::SessionStatusChanged {
                    id: session_id,
                    coach_id,
                    status: SessionStatus::InProgress,
                    at: now,
                    by: None,
                    reason: None,
                },
            )
            .await?;
        }

        let Some(session) = sched.session(session_id).cloned() else {
            return Ok(());
        };
        let notice_kind = if kind == ReminderKind::StartingNow {
            NotificationKind::SessionStarting
        } else {
            NotificationKind::SessionReminder
        };
        self.notify_participant(&session, Role::Coach, notice_kind);
        self.notify_participant(&session, Role::Client, notice_kind);
        Ok(())
    }

    /// Mark every unfinished session from the previous calendar day as a
    /// no-show. Returns how many were marked.
    pub async fn run_no_show_sweep(&self, now: NaiveDateTime) -> Result<usize, EngineError> {
        let Some(yesterday) = now.date().pred_opt() else {
            return Ok(0);
        };
        let mut marked = 0usize;

        let coach_ids: Vec<_> = self.state.iter().map(|e| *e.key()).collect();
        for coach_id in coach_ids {
            let Some(shared) = self.schedule(&coach_id) else {
                continue;
            };
            let mut sched = shared.write().await;
            let stale: Vec<_> = sched
                .sessions
                .iter()
                .filter(|s| {
                    s.date == yesterday
                        && matches!(
                            s.status,
                            SessionStatus::Scheduled
                                | SessionStatus::Confirmed
                                | SessionStatus::InProgress
                        )
                })
                .map(|s| s.id)
                .collect();

            for session_id in stale {
                let result = self
                    .persist_and_apply(
                        &mut sched,
                        &Event::SessionStatusChanged {
                            id: session_id,
                            coach_id,
                            status: SessionStatus::NoShow,
                            at: now,
                            by: None,
                            reason: None,
                        },
                    )
                    .await;
                match result {
                    Ok(()) => marked += 1,
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "no-show mark failed");
                    }
                }
            }
        }

        if marked > 0 {
            metrics::counter!(crate::observability::NO_SHOWS_MARKED_TOTAL).increment(marked as u64);
            tracing::info!(count = marked, date = %yesterday, "no-show sweep marked sessions");
        }
        Ok(marked)
    }
}

/// Which reminder, if any, is due for a session starting at `starts_at`.
/// Windows are `[threshold - slack, threshold + slack]` minutes before start,
/// except starting-now which covers the last ten minutes before start.
fn due_reminder(
    starts_at: NaiveDateTime,
    now: NaiveDateTime,
    session: &crate::model::Session,
) -> Option<ReminderKind> {
    let until_start = starts_at - now;

    // Most imminent threshold wins; earlier ones are skipped, not queued.
    if until_start >= Duration::zero() && until_start <= Duration::minutes(2 * WINDOW_SLACK_MIN) {
        return (!session.starting_now_sent).then_some(ReminderKind::StartingNow);
    }
    for kind in [ReminderKind::HalfHour, ReminderKind::Hour] {
        let lo = Duration::minutes(kind.minutes() - WINDOW_SLACK_MIN);
        let hi = Duration::minutes(kind.minutes() + WINDOW_SLACK_MIN);
        if until_start >= lo && until_start <= hi && !session.reminder_sent(kind) {
            return Some(kind);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Medium, Session, TimeOfDay, Window};
    use chrono::NaiveDate;

    fn session_at(date: NaiveDate, start: TimeOfDay) -> Session {
        Session {
            id: Ulid::new(),
            coach_id: Ulid::new(),
            client_id: Ulid::new(),
            slot_id: None,
            date,
            window: Window::new(start, TimeOfDay::new(start.hour() + 1, start.minute()).unwrap()),
            duration_min: 60,
            medium: Medium::Online,
            status: SessionStatus::Scheduled,
            title: None,
            notes: None,
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
        }
    }

    #[test]
    fn due_reminder_thresholds() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let s = session_at(date, TimeOfDay::new(12, 0).unwrap());
        let starts = s.starts_at();

        let at = |mins_before: i64| starts - Duration::minutes(mins_before);
        assert_eq!(due_reminder(starts, at(60), &s), Some(ReminderKind::Hour));
        assert_eq!(due_reminder(starts, at(57), &s), Some(ReminderKind::Hour));
        assert_eq!(due_reminder(starts, at(30), &s), Some(ReminderKind::HalfHour));
        assert_eq!(
            due_reminder(starts, at(5), &s),
            Some(ReminderKind::StartingNow)
        );
        assert_eq!(due_reminder(starts, at(0), &s), Some(ReminderKind::StartingNow));
        // Between windows: nothing due.
        assert_eq!(due_reminder(starts, at(45), &s), None);
        // Already started more than the tolerance ago.
        assert_eq!(due_reminder(starts, starts + Duration::minutes(11), &s), None);
    }

    #[test]
    fn due_reminder_respects_flags() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let mut s = session_at(date, TimeOfDay::new(12, 0).unwrap());
        let starts = s.starts_at();
        s.reminder60_sent = true;
        assert_eq!(due_reminder(starts, starts - Duration::minutes(60), &s), None);
        s.starting_now_sent = true;
        assert_eq!(due_reminder(starts, starts, &s), None);
    }
}
