use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use super::*;
use crate::notify::{BroadcastHub, MemoryDirectory};

fn wal_path(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("coachd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> (Engine, Arc<BroadcastHub>, std::path::PathBuf) {
    let hub = Arc::new(BroadcastHub::new());
    let path = wal_path(name);
    let engine = Engine::new(
        path.clone(),
        hub.clone(),
        Arc::new(MemoryDirectory::new()),
    )
    .unwrap();
    (engine, hub, path)
}

fn t(s: &str) -> TimeOfDay {
    s.parse().unwrap()
}

fn w(start: &str, end: &str) -> Window {
    Window::new(t(start), t(end))
}

/// 2024-06-03 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
}

fn monday_slot(coach_id: Ulid, start: &str, end: &str) -> TimeSlot {
    TimeSlot {
        id: Ulid::new(),
        coach_id,
        day: DayKey::Week(1),
        window: w(start, end),
        duration_min: 60,
        medium: Medium::Both,
        available: true,
        note: None,
    }
}

fn booking(coach_id: Ulid, date: NaiveDate, start: &str, end: &str) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        coach_id,
        scheduled_date: date,
        window: w(start, end),
        medium: None,
        title: None,
        notes: None,
        slot_id: None,
    }
}

fn noon(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(12, 0, 0).unwrap()
}

// ── Slots ────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_slots() {
    let (engine, _, _) = new_engine("create_list");
    let coach = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "14:00", "15:00"))
        .await
        .unwrap();
    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();

    let slots = engine.list_slots(coach).await;
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].window.start, t("09:00"));
    assert_eq!(slots[1].window.start, t("14:00"));
}

#[tokio::test]
async fn overlapping_slot_rejected() {
    let (engine, _, _) = new_engine("overlap");
    let coach = Ulid::new();

    let first = engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let err = engine
        .create_slot(monday_slot(coach, "09:30", "10:30"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Overlap(id) if id == first.id));
}

#[tokio::test]
async fn adjacent_slots_allowed() {
    let (engine, _, _) = new_engine("adjacent");
    let coach = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .create_slot(monday_slot(coach, "10:00", "11:00"))
        .await
        .unwrap();
    assert_eq!(engine.list_slots(coach).await.len(), 2);
}

#[tokio::test]
async fn disabled_slot_does_not_block_replacement() {
    let (engine, _, _) = new_engine("disabled_replacement");
    let coach = Ulid::new();

    let mut disabled = monday_slot(coach, "09:00", "10:00");
    disabled.available = false;
    engine.create_slot(disabled).await.unwrap();

    // Only available siblings count for the overlap check, so the coach can
    // publish a fresh slot over the switched-off window.
    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    assert_eq!(engine.list_slots(coach).await.len(), 2);
}

#[tokio::test]
async fn slots_on_different_days_never_overlap() {
    let (engine, _, _) = new_engine("different_days");
    let coach = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let mut tuesday = monday_slot(coach, "09:00", "10:00");
    tuesday.day = DayKey::Week(2);
    engine.create_slot(tuesday).await.unwrap();

    let mut dated = monday_slot(coach, "09:00", "10:00");
    dated.day = DayKey::Date(monday());
    // Same wall-clock window but keyed to a specific date, not the weekday.
    engine.create_slot(dated).await.unwrap();
}

#[tokio::test]
async fn create_slot_validation() {
    let (engine, _, _) = new_engine("slot_validation");
    let coach = Ulid::new();

    let mut inverted = monday_slot(coach, "09:00", "10:00");
    inverted.window = Window {
        start: t("10:00"),
        end: t("09:00"),
    };
    assert!(matches!(
        engine.create_slot(inverted).await.unwrap_err(),
        EngineError::Validation(_)
    ));

    let mut bad_day = monday_slot(coach, "09:00", "10:00");
    bad_day.day = DayKey::Week(7);
    assert!(matches!(
        engine.create_slot(bad_day).await.unwrap_err(),
        EngineError::Validation(_)
    ));

    let mut too_short = monday_slot(coach, "09:00", "10:00");
    too_short.duration_min = 5;
    assert!(matches!(
        engine.create_slot(too_short).await.unwrap_err(),
        EngineError::Validation(_)
    ));
}

#[tokio::test]
async fn update_slot_ownership() {
    let (engine, _, _) = new_engine("update_ownership");
    let coach = Ulid::new();
    let stranger = Ulid::new();

    let slot = engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();

    let err = engine
        .update_slot(
            stranger,
            slot.id,
            SlotPatch {
                available: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let updated = engine
        .update_slot(
            coach,
            slot.id,
            SlotPatch {
                available: Some(false),
                note: Some("away".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.available);
    assert_eq!(updated.note.as_deref(), Some("away"));
}

#[tokio::test]
async fn update_slot_rejects_inverted_window() {
    let (engine, _, _) = new_engine("update_inverted");
    let coach = Ulid::new();
    let slot = engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();

    let err = engine
        .update_slot(
            coach,
            slot.id,
            SlotPatch {
                end: Some(t("08:00")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn delete_slot_with_future_session_conflicts() {
    let (engine, _, _) = new_engine("delete_conflict");
    let coach = Ulid::new();
    let client = Ulid::new();

    let slot = engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();

    let today = monday().pred_opt().unwrap();
    let err = engine.delete_slot(coach, slot.id, today).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(1)));

    // Once the date has passed, the slot can go.
    let later = monday().succ_opt().unwrap();
    engine.delete_slot(coach, slot.id, later).await.unwrap();
    assert!(engine.list_slots(coach).await.is_empty());
}

#[tokio::test]
async fn delete_slot_after_cancellation_succeeds() {
    let (engine, _, _) = new_engine("delete_after_cancel");
    let coach = Ulid::new();
    let client = Ulid::new();

    let slot = engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .cancel_session(client, session.id, None, noon(monday()))
        .await
        .unwrap();

    let today = monday().pred_opt().unwrap();
    engine.delete_slot(coach, slot.id, today).await.unwrap();
}

// ── Booking ──────────────────────────────────────────────────────

#[tokio::test]
async fn book_session_happy_path() {
    let (engine, hub, _) = new_engine("book_happy");
    let coach = Ulid::new();
    let client = Ulid::new();
    let mut coach_rx = hub.subscribe(coach);

    let slot = engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Scheduled);
    assert_eq!(session.slot_id, Some(slot.id));
    assert_eq!(session.duration_min, 60);
    // Nothing requested, so the slot's medium carries over.
    assert_eq!(session.medium, Medium::Both);

    let notice = coach_rx.recv().await.unwrap();
    assert_eq!(notice.kind, crate::notify::NotificationKind::SessionBooked);
}

#[tokio::test]
async fn booking_carries_slot_duration_and_medium() {
    let (engine, _, _) = new_engine("slot_carry");
    let coach = Ulid::new();

    // An hour-long window declaring 30-minute in-person sessions.
    let mut slot = monday_slot(coach, "09:00", "10:00");
    slot.duration_min = 30;
    slot.medium = Medium::InPerson;
    engine.create_slot(slot).await.unwrap();

    let session = engine
        .book_session(Ulid::new(), booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();
    assert_eq!(session.duration_min, 30);
    assert_eq!(session.medium, Medium::InPerson);
}

#[tokio::test]
async fn book_session_no_matching_slot() {
    let (engine, _, _) = new_engine("book_no_slot");
    let coach = Ulid::new();
    let client = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();

    // Wrong time.
    let err = engine
        .book_session(client, booking(coach, monday(), "11:00", "12:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSlot));

    // Right time, wrong day (Tuesday).
    let tuesday = monday().succ_opt().unwrap();
    let err = engine
        .book_session(client, booking(coach, tuesday, "09:00", "10:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSlot));
}

#[tokio::test]
async fn book_session_unavailable_slot_rejected() {
    let (engine, _, _) = new_engine("book_unavailable");
    let coach = Ulid::new();
    let client = Ulid::new();

    let mut slot = monday_slot(coach, "09:00", "10:00");
    slot.available = false;
    engine.create_slot(slot).await.unwrap();

    let err = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSlot));
}

#[tokio::test]
async fn book_session_taken_time() {
    let (engine, _, _) = new_engine("book_taken");
    let coach = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .book_session(Ulid::new(), booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();

    let err = engine
        .book_session(Ulid::new(), booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotTaken));
}

#[tokio::test]
async fn canceled_session_frees_the_time() {
    let (engine, _, _) = new_engine("cancel_frees");
    let coach = Ulid::new();
    let client = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .cancel_session(client, session.id, Some("sick".into()), noon(monday()))
        .await
        .unwrap();

    engine
        .book_session(Ulid::new(), booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();
}

#[tokio::test]
async fn book_session_medium_mismatch() {
    let (engine, _, _) = new_engine("book_medium");
    let coach = Ulid::new();

    let mut slot = monday_slot(coach, "09:00", "10:00");
    slot.medium = Medium::Online;
    engine.create_slot(slot).await.unwrap();

    let mut req = booking(coach, monday(), "09:00", "10:00");
    req.medium = Some(Medium::InPerson);
    let err = engine.book_session(Ulid::new(), req).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn concurrent_booking_single_winner() {
    let (engine, _, _) = new_engine("concurrent_booking");
    let engine = Arc::new(engine);
    let coach = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .book_session(Ulid::new(), booking(coach, monday(), "09:00", "10:00"))
                .await
        }));
    }

    let mut wins = 0;
    let mut taken = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::SlotTaken) => taken += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(taken, 7);
}

// ── Availability ─────────────────────────────────────────────────

#[tokio::test]
async fn availability_week_view() {
    let (engine, _, _) = new_engine("availability_week");
    let coach = Ulid::new();
    let client = Ulid::new();

    // Recurring Monday 09:00–10:00, plus a one-off on Wednesday.
    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let wednesday = NaiveDate::from_ymd_opt(2024, 6, 5).unwrap();
    let mut one_off = monday_slot(coach, "13:00", "14:00");
    one_off.day = DayKey::Date(wednesday);
    engine.create_slot(one_off).await.unwrap();

    engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();

    let sunday = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
    let saturday = NaiveDate::from_ymd_opt(2024, 6, 8).unwrap();
    let days = engine
        .get_availability(coach, sunday, saturday)
        .await
        .unwrap();
    assert_eq!(days.len(), 7);

    let mon = days.iter().find(|d| d.date == monday()).unwrap();
    assert_eq!(mon.slots.len(), 1);
    assert!(mon.slots[0].is_booked);

    let wed = days.iter().find(|d| d.date == wednesday).unwrap();
    assert_eq!(wed.slots.len(), 1);
    assert!(!wed.slots[0].is_booked);
    assert_eq!(wed.slots[0].window.start, t("13:00"));

    // Next Monday: the recurring slot shows again, unbooked.
    let next_monday = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
    let days = engine
        .get_availability(coach, next_monday, next_monday)
        .await
        .unwrap();
    assert!(!days[0].slots[0].is_booked);
}

#[tokio::test]
async fn availability_rejects_bad_ranges() {
    let (engine, _, _) = new_engine("availability_range");
    let coach = Ulid::new();

    let err = engine
        .get_availability(coach, monday(), monday().pred_opt().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine
        .get_availability(coach, monday(), monday() + Duration::days(365))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

// ── State machine ────────────────────────────────────────────────

#[test]
fn transition_authority_matrix() {
    use SessionStatus::*;

    // Either participant may cancel early states.
    for role in [Role::Coach, Role::Client] {
        assert!(check_transition(Scheduled, Canceled, role).is_ok());
        assert!(check_transition(Confirmed, Canceled, role).is_ok());
        assert!(check_transition(InProgress, Canceled, role).is_err());
    }

    // Coach-only transitions.
    assert!(check_transition(Scheduled, Confirmed, Role::Coach).is_ok());
    assert!(check_transition(Scheduled, Confirmed, Role::Client).is_err());
    assert!(check_transition(Confirmed, InProgress, Role::Coach).is_ok());
    assert!(check_transition(InProgress, Completed, Role::Coach).is_ok());
    assert!(check_transition(Confirmed, NoShow, Role::Coach).is_ok());
    assert!(check_transition(InProgress, Completed, Role::Client).is_err());

    // Terminal states are final.
    for from in [Completed, Canceled, NoShow] {
        for to in [Scheduled, Confirmed, InProgress, Completed, Canceled, NoShow] {
            assert!(check_transition(from, to, Role::Coach).is_err(), "{from} -> {to}");
        }
    }

    // Nothing returns to scheduled; same-state is rejected.
    assert!(check_transition(Confirmed, Scheduled, Role::Coach).is_err());
    assert!(check_transition(Scheduled, Scheduled, Role::Coach).is_err());
}

#[tokio::test]
async fn full_session_lifecycle() {
    let (engine, hub, _) = new_engine("lifecycle");
    let coach = Ulid::new();
    let client = Ulid::new();
    let mut client_rx = hub.subscribe(client);

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();

    let confirm = SessionPatch {
        status: Some(SessionStatus::Confirmed),
        meeting_link: Some("https://meet.example/abc".into()),
        ..Default::default()
    };
    let s = engine
        .update_session(coach, session.id, confirm, noon(monday()))
        .await
        .unwrap();
    assert_eq!(s.status, SessionStatus::Confirmed);
    assert_eq!(s.meeting_link.as_deref(), Some("https://meet.example/abc"));

    let notice = client_rx.recv().await.unwrap();
    assert_eq!(notice.kind, crate::notify::NotificationKind::SessionConfirmed);

    let s = engine
        .update_session(
            coach,
            session.id,
            SessionPatch {
                status: Some(SessionStatus::InProgress),
                ..Default::default()
            },
            noon(monday()),
        )
        .await
        .unwrap();
    assert_eq!(s.status, SessionStatus::InProgress);

    let done_at = monday().and_hms_opt(10, 0, 0).unwrap();
    let s = engine
        .update_session(
            coach,
            session.id,
            SessionPatch {
                status: Some(SessionStatus::Completed),
                coach_notes: Some("good progress".into()),
                ..Default::default()
            },
            done_at,
        )
        .await
        .unwrap();
    assert_eq!(s.status, SessionStatus::Completed);
    assert_eq!(s.completed_at, Some(done_at));
    assert_eq!(s.coach_notes.as_deref(), Some("good progress"));
}

#[tokio::test]
async fn client_cannot_confirm_or_write_coach_fields() {
    let (engine, _, _) = new_engine("client_forbidden");
    let coach = Ulid::new();
    let client = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();

    let err = engine
        .update_session(
            client,
            session.id,
            SessionPatch {
                status: Some(SessionStatus::Confirmed),
                ..Default::default()
            },
            noon(monday()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let err = engine
        .update_session(
            client,
            session.id,
            SessionPatch {
                meeting_link: Some("https://hijack.example".into()),
                ..Default::default()
            },
            noon(monday()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    // The client's own notes are theirs alone; the coach can't write them.
    engine
        .update_session(
            client,
            session.id,
            SessionPatch {
                client_notes: Some("looking forward".into()),
                ..Default::default()
            },
            noon(monday()),
        )
        .await
        .unwrap();
    let err = engine
        .update_session(
            coach,
            session.id,
            SessionPatch {
                client_notes: Some("overwritten".into()),
                ..Default::default()
            },
            noon(monday()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
}

#[tokio::test]
async fn cancellation_records_who_and_why() {
    let (engine, hub, _) = new_engine("cancel_records");
    let coach = Ulid::new();
    let client = Ulid::new();
    let mut coach_rx = hub.subscribe(coach);

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();
    // Drain the booked notice.
    coach_rx.recv().await.unwrap();

    let at = noon(monday());
    let s = engine
        .cancel_session(client, session.id, Some("conflict came up".into()), at)
        .await
        .unwrap();
    assert_eq!(s.status, SessionStatus::Canceled);
    assert_eq!(s.canceled_by, Some(Role::Client));
    assert_eq!(s.canceled_at, Some(at));
    assert_eq!(s.cancel_reason.as_deref(), Some("conflict came up"));

    // The other party hears about it.
    let notice = coach_rx.recv().await.unwrap();
    assert_eq!(notice.kind, crate::notify::NotificationKind::SessionCanceled);

    // Cancel again: terminal.
    let err = engine
        .cancel_session(coach, session.id, None, at)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn get_session_requires_participation() {
    let (engine, _, _) = new_engine("get_participation");
    let coach = Ulid::new();
    let client = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();

    assert!(engine.get_session(coach, session.id).await.is_ok());
    assert!(engine.get_session(client, session.id).await.is_ok());
    let err = engine.get_session(Ulid::new(), session.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = engine.get_session(coach, Ulid::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn list_sessions_filters() {
    let (engine, _, _) = new_engine("list_filters");
    let coach = Ulid::new();
    let client = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .create_slot(monday_slot(coach, "11:00", "12:00"))
        .await
        .unwrap();

    let next_monday = monday() + Duration::days(7);
    let s1 = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .book_session(client, booking(coach, next_monday, "11:00", "12:00"))
        .await
        .unwrap();
    engine
        .cancel_session(client, s1.id, None, noon(monday()))
        .await
        .unwrap();

    // Client sees both, sorted by date.
    let all = engine
        .list_sessions(client, SessionFilter::default(), monday())
        .await;
    assert_eq!(all.len(), 2);
    assert!(all[0].date <= all[1].date);

    let canceled = engine
        .list_sessions(
            client,
            SessionFilter {
                status: Some(SessionStatus::Canceled),
                ..Default::default()
            },
            monday(),
        )
        .await;
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].id, s1.id);

    // Upcoming excludes the canceled one.
    let upcoming = engine
        .list_sessions(
            client,
            SessionFilter {
                upcoming: true,
                ..Default::default()
            },
            monday(),
        )
        .await;
    assert_eq!(upcoming.len(), 1);
    assert_eq!(upcoming[0].date, next_monday);

    // Coach sees their side too.
    let coach_view = engine
        .list_sessions(coach, SessionFilter::default(), monday())
        .await;
    assert_eq!(coach_view.len(), 2);

    // A stranger sees nothing.
    assert!(engine
        .list_sessions(Ulid::new(), SessionFilter::default(), monday())
        .await
        .is_empty());
}

// ── Sweeps ───────────────────────────────────────────────────────

#[tokio::test]
async fn reminder_sweep_sends_once() {
    let (engine, hub, _) = new_engine("reminder_once");
    let coach = Ulid::new();
    let client = Ulid::new();
    let mut client_rx = hub.subscribe(client);

    engine
        .create_slot(monday_slot(coach, "12:00", "13:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "12:00", "13:00"))
        .await
        .unwrap();

    let now = monday().and_hms_opt(11, 0, 0).unwrap();
    let report = engine.run_reminder_sweep(now).await.unwrap();
    assert_eq!(report.hour, 1);
    assert_eq!(report.total(), 1);

    let notice = client_rx.recv().await.unwrap();
    assert_eq!(notice.kind, crate::notify::NotificationKind::SessionReminder);

    // Same window again: flag set, nothing sent.
    let report = engine.run_reminder_sweep(now).await.unwrap();
    assert_eq!(report.total(), 0);

    let s = engine.get_session(client, session.id).await.unwrap();
    assert!(s.reminder60_sent);
    assert!(!s.reminder30_sent);
}

#[tokio::test]
async fn starting_now_moves_to_in_progress() {
    let (engine, _, _) = new_engine("starting_now");
    let coach = Ulid::new();
    let client = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "12:00", "13:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "12:00", "13:00"))
        .await
        .unwrap();

    let now = monday().and_hms_opt(11, 55, 0).unwrap();
    let report = engine.run_reminder_sweep(now).await.unwrap();
    assert_eq!(report.starting, 1);

    let s = engine.get_session(client, session.id).await.unwrap();
    assert_eq!(s.status, SessionStatus::InProgress);
    assert!(s.starting_now_sent);

    // In-progress sessions get no further reminders.
    let report = engine.run_reminder_sweep(now).await.unwrap();
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn reminder_sweep_skips_terminal_and_far_sessions() {
    let (engine, _, _) = new_engine("reminder_skips");
    let coach = Ulid::new();
    let client = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "12:00", "13:00"))
        .await
        .unwrap();
    let session = engine
        .book_session(client, booking(coach, monday(), "12:00", "13:00"))
        .await
        .unwrap();
    engine
        .cancel_session(client, session.id, None, noon(monday().pred_opt().unwrap()))
        .await
        .unwrap();

    let now = monday().and_hms_opt(11, 0, 0).unwrap();
    assert_eq!(engine.run_reminder_sweep(now).await.unwrap().total(), 0);
}

#[tokio::test]
async fn reminder_sweep_only_scans_todays_sessions() {
    let (engine, _, _) = new_engine("reminder_today");
    let coach = Ulid::new();
    let client = Ulid::new();

    let mut slot = monday_slot(coach, "00:30", "01:30");
    slot.day = DayKey::Week(2);
    engine.create_slot(slot).await.unwrap();
    let tuesday = monday().succ_opt().unwrap();
    engine
        .book_session(client, booking(coach, tuesday, "00:30", "01:30"))
        .await
        .unwrap();

    // Monday 23:35 is 55 minutes out by the clock, but the session is not
    // today's; nothing fires until midnight passes.
    let late_monday = monday().and_hms_opt(23, 35, 0).unwrap();
    assert_eq!(engine.run_reminder_sweep(late_monday).await.unwrap().total(), 0);

    let past_midnight = tuesday.and_hms_opt(0, 0, 0).unwrap();
    let report = engine.run_reminder_sweep(past_midnight).await.unwrap();
    assert_eq!(report.half_hour, 1);
}

#[tokio::test]
async fn no_show_sweep_marks_yesterday_only() {
    let (engine, _, _) = new_engine("no_show");
    let coach = Ulid::new();
    let client = Ulid::new();

    engine
        .create_slot(monday_slot(coach, "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .create_slot(monday_slot(coach, "11:00", "12:00"))
        .await
        .unwrap();

    let stale = engine
        .book_session(client, booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap();
    let done = engine
        .book_session(client, booking(coach, monday(), "11:00", "12:00"))
        .await
        .unwrap();
    engine
        .update_session(
            coach,
            done.id,
            SessionPatch {
                status: Some(SessionStatus::Completed),
                ..Default::default()
            },
            monday().and_hms_opt(12, 0, 0).unwrap(),
        )
        .await
        .unwrap();

    // Tuesday midnight: Monday's scheduled session becomes a no-show.
    let tuesday_midnight = monday().succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap();
    let marked = engine.run_no_show_sweep(tuesday_midnight).await.unwrap();
    assert_eq!(marked, 1);

    let s = engine.get_session(client, stale.id).await.unwrap();
    assert_eq!(s.status, SessionStatus::NoShow);
    let s = engine.get_session(client, done.id).await.unwrap();
    assert_eq!(s.status, SessionStatus::Completed);

    // Two days later the sweep no longer touches Monday.
    let (engine2, _, _) = new_engine("no_show_late");
    let coach2 = Ulid::new();
    engine2
        .create_slot(monday_slot(coach2, "09:00", "10:00"))
        .await
        .unwrap();
    engine2
        .book_session(client, booking(coach2, monday(), "09:00", "10:00"))
        .await
        .unwrap();
    let wednesday_midnight = (monday() + Duration::days(2)).and_hms_opt(0, 0, 0).unwrap();
    assert_eq!(engine2.run_no_show_sweep(wednesday_midnight).await.unwrap(), 0);
}

// ── Persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_full_state() {
    let hub = Arc::new(BroadcastHub::new());
    let dir = Arc::new(MemoryDirectory::new());
    let path = wal_path("replay_restores");
    let coach = Ulid::new();
    let client = Ulid::new();
    let (slot_id, session_id);

    {
        let engine = Engine::new(path.clone(), hub.clone(), dir.clone()).unwrap();
        let slot = engine
            .create_slot(monday_slot(coach, "09:00", "10:00"))
            .await
            .unwrap();
        slot_id = slot.id;
        let session = engine
            .book_session(client, booking(coach, monday(), "09:00", "10:00"))
            .await
            .unwrap();
        session_id = session.id;
        engine
            .update_session(
                coach,
                session.id,
                SessionPatch {
                    status: Some(SessionStatus::Confirmed),
                    meeting_link: Some("https://meet.example/xyz".into()),
                    ..Default::default()
                },
                noon(monday()),
            )
            .await
            .unwrap();
        engine
            .run_reminder_sweep(monday().and_hms_opt(8, 0, 0).unwrap())
            .await
            .unwrap();
    }

    let engine = Engine::new(path, hub, dir).unwrap();
    let slots = engine.list_slots(coach).await;
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].id, slot_id);

    let s = engine.get_session(client, session_id).await.unwrap();
    assert_eq!(s.status, SessionStatus::Confirmed);
    assert_eq!(s.meeting_link.as_deref(), Some("https://meet.example/xyz"));
    assert!(s.reminder60_sent);

    // Reverse indexes were rebuilt: the booked time is still held.
    let err = engine
        .book_session(Ulid::new(), booking(coach, monday(), "09:00", "10:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotTaken));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let hub = Arc::new(BroadcastHub::new());
    let dir = Arc::new(MemoryDirectory::new());
    let path = wal_path("compaction_preserves");
    let coach = Ulid::new();
    let client = Ulid::new();

    let session_id;
    {
        let engine = Engine::new(path.clone(), hub.clone(), dir.clone()).unwrap();
        engine
            .create_slot(monday_slot(coach, "09:00", "10:00"))
            .await
            .unwrap();
        let session = engine
            .book_session(client, booking(coach, monday(), "09:00", "10:00"))
            .await
            .unwrap();
        session_id = session.id;
        engine
            .cancel_session(client, session.id, Some("moved".into()), noon(monday()))
            .await
            .unwrap();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.appends_since_compact().await, 0);
    }

    let engine = Engine::new(path, hub, dir).unwrap();
    let s = engine.get_session(client, session_id).await.unwrap();
    // The snapshot carries the derived cancel fields.
    assert_eq!(s.status, SessionStatus::Canceled);
    assert_eq!(s.cancel_reason.as_deref(), Some("moved"));
}
