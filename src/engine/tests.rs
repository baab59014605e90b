use super::*;
use crate::clock::ManualClock;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const DAY: Ms = 24 * H;
/// 2027-01-15T08:00:00Z; every test works in the days after this instant.
const T0: Ms = 1_800_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("convoy_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_at(path: &PathBuf, now: Ms) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at(now));
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap();
    (engine, clock)
}

fn trip(resource_id: Ulid, start: Ms, end: Ms) -> NewReservation {
    NewReservation {
        id: Ulid::new(),
        resource_id,
        client_id: Ulid::new(),
        carrier_id: None,
        span: Span::new(start, end),
        contact: "rider@example.com".into(),
    }
}

fn mailing(send_time: Ms) -> NewMailing {
    NewMailing {
        id: Ulid::new(),
        subject: "Spring timetable".into(),
        body: "New routes from April.".into(),
        send_time,
        kind: MailingKind::Notification,
    }
}

// ── Availability and conflicts ───────────────────────────

#[tokio::test]
async fn overlapping_pending_reservation_conflicts() {
    let path = test_wal_path("overlap");
    let (engine, _) = engine_at(&path, T0);
    let bus = Ulid::new();

    let first = engine.create_reservation(trip(bus, T0 + 10 * H, T0 + 20 * H)).await.unwrap();
    assert_eq!(first.status, ReservationStatus::Pending);

    let err = engine
        .create_reservation(trip(bus, T0 + 15 * H, T0 + 25 * H))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::Conflict {
            resource_id: bus,
            conflicting: vec![first.id],
        }
    );

    // Touching endpoint is not an overlap.
    engine.create_reservation(trip(bus, T0 + 20 * H, T0 + 30 * H)).await.unwrap();
    assert_eq!(engine.reservations_for_resource(&bus).await.len(), 2);
}

#[tokio::test]
async fn other_vehicle_is_unaffected() {
    let path = test_wal_path("other_vehicle");
    let (engine, _) = engine_at(&path, T0);
    engine.create_reservation(trip(Ulid::new(), T0 + H, T0 + 5 * H)).await.unwrap();
    engine.create_reservation(trip(Ulid::new(), T0 + H, T0 + 5 * H)).await.unwrap();
}

#[tokio::test]
async fn cancel_frees_the_range() {
    let path = test_wal_path("cancel_frees");
    let (engine, _) = engine_at(&path, T0);
    let bus = Ulid::new();

    let r = engine.create_reservation(trip(bus, T0 + H, T0 + 3 * H)).await.unwrap();
    assert!(!engine.is_available(&bus, T0 + 2 * H, T0 + 4 * H).await.unwrap());

    let canceled = engine.cancel_reservation(r.id).await.unwrap();
    assert_eq!(canceled.status, ReservationStatus::Canceled);
    assert!(engine.is_available(&bus, T0 + 2 * H, T0 + 4 * H).await.unwrap());
    engine.create_reservation(trip(bus, T0 + 2 * H, T0 + 4 * H)).await.unwrap();
}

#[tokio::test]
async fn completed_trip_no_longer_blocks() {
    let path = test_wal_path("completed");
    let (engine, clock) = engine_at(&path, T0);
    let bus = Ulid::new();

    let r = engine.create_reservation(trip(bus, T0 + H, T0 + 2 * H)).await.unwrap();
    engine.confirm_reservation(r.id).await.unwrap();
    clock.set(T0 + 3 * H);
    assert_eq!(engine.collect_finished(clock.now_ms()).await, vec![r.id]);
    engine.complete_reservation(r.id).await.unwrap();

    assert!(engine.collect_finished(clock.now_ms()).await.is_empty());
    assert!(engine.conflicts(&bus, &Span::new(T0, T0 + 4 * H), None).await.is_empty());
}

#[tokio::test]
async fn free_windows_and_filter_available() {
    let path = test_wal_path("free_windows");
    let (engine, _) = engine_at(&path, T0);
    let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());

    engine.create_reservation(trip(a, T0 + 2 * H, T0 + 4 * H)).await.unwrap();
    let r = engine.create_reservation(trip(b, T0 + 5 * H, T0 + 6 * H)).await.unwrap();
    engine.confirm_reservation(r.id).await.unwrap();

    assert_eq!(
        engine.free_windows(&a, T0, T0 + 8 * H).await.unwrap(),
        vec![Span::new(T0, T0 + 2 * H), Span::new(T0 + 4 * H, T0 + 8 * H)]
    );
    assert_eq!(
        engine.free_windows(&c, T0, T0 + H).await.unwrap(),
        vec![Span::new(T0, T0 + H)]
    );
    assert_eq!(
        engine.filter_available(&[a, b, c, a], T0 + 3 * H, T0 + 5 * H + 1).await.unwrap(),
        vec![c]
    );
    assert_eq!(
        engine.filter_available(&[a, b, c], T0 + 4 * H, T0 + 5 * H).await.unwrap(),
        vec![a, b, c]
    );
}

#[tokio::test]
async fn free_windows_rejects_huge_window() {
    let path = test_wal_path("huge_window");
    let (engine, _) = engine_at(&path, T0);
    let result = engine
        .free_windows(&Ulid::new(), T0, T0 + MAX_QUERY_WINDOW_MS + 1)
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn conflicts_can_exclude_a_reservation() {
    let path = test_wal_path("exclude");
    let (engine, _) = engine_at(&path, T0);
    let bus = Ulid::new();
    let r = engine.create_reservation(trip(bus, T0 + H, T0 + 2 * H)).await.unwrap();
    let window = Span::new(T0, T0 + 3 * H);
    assert_eq!(engine.conflicts(&bus, &window, None).await.len(), 1);
    assert!(engine.conflicts(&bus, &window, Some(r.id)).await.is_empty());
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn rejects_bad_ranges() {
    let path = test_wal_path("bad_ranges");
    let (engine, _) = engine_at(&path, T0);
    let bus = Ulid::new();

    let mut inverted = trip(bus, T0 + H, T0 + 2 * H);
    inverted.span = Span { start: T0 + 2 * H, end: T0 + H };
    assert!(matches!(
        engine.create_reservation(inverted).await,
        Err(EngineError::Validation(_))
    ));

    assert!(matches!(
        engine.create_reservation(trip(bus, T0 - H, T0 + H)).await,
        Err(EngineError::Validation(_))
    ));

    assert!(matches!(
        engine
            .create_reservation(trip(bus, T0 + H, T0 + H + MAX_SPAN_DURATION_MS + 1))
            .await,
        Err(EngineError::LimitExceeded(_))
    ));

    let mut no_contact = trip(bus, T0 + H, T0 + 2 * H);
    no_contact.contact = "  ".into();
    assert!(matches!(
        engine.create_reservation(no_contact).await,
        Err(EngineError::Validation(_))
    ));

    assert!(engine.reservations_for_resource(&bus).await.is_empty());
}

#[tokio::test]
async fn duplicate_id_rejected() {
    let path = test_wal_path("duplicate");
    let (engine, _) = engine_at(&path, T0);
    let new = trip(Ulid::new(), T0 + H, T0 + 2 * H);
    let mut again = new.clone();
    again.resource_id = Ulid::new();

    engine.create_reservation(new).await.unwrap();
    assert!(matches!(
        engine.create_reservation(again).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

// ── State machine ────────────────────────────────────────

#[tokio::test]
async fn lifecycle_edges_are_enforced() {
    let path = test_wal_path("lifecycle");
    let (engine, _) = engine_at(&path, T0);
    let bus = Ulid::new();

    let r = engine.create_reservation(trip(bus, T0 + H, T0 + 2 * H)).await.unwrap();
    assert_eq!(
        engine.complete_reservation(r.id).await,
        Err(EngineError::InvalidTransition {
            id: r.id,
            from: ReservationStatus::Pending,
            to: ReservationStatus::Completed,
        })
    );

    engine.cancel_reservation(r.id).await.unwrap();
    assert!(matches!(
        engine.confirm_reservation(r.id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert_eq!(
        engine.get_reservation(&r.id).await.unwrap().status,
        ReservationStatus::Canceled
    );
}

#[tokio::test]
async fn unknown_reservation_is_not_found() {
    let path = test_wal_path("unknown");
    let (engine, _) = engine_at(&path, T0);
    let id = Ulid::new();
    assert_eq!(engine.confirm_reservation(id).await, Err(EngineError::NotFound(id)));
    assert_eq!(engine.delete_reservation(id).await, Err(EngineError::NotFound(id)));
    assert!(engine.get_reservation(&id).await.is_none());
}

#[tokio::test]
async fn range_update_rechecks_conflicts_but_ignores_itself() {
    let path = test_wal_path("range_update");
    let (engine, _) = engine_at(&path, T0);
    let bus = Ulid::new();

    let a = engine.create_reservation(trip(bus, T0 + H, T0 + 3 * H)).await.unwrap();
    let b = engine.create_reservation(trip(bus, T0 + 5 * H, T0 + 7 * H)).await.unwrap();

    // Sliding over its own old range is fine.
    let moved = engine
        .update_reservation(a.id, ReservationPatch::range(Span::new(T0 + 2 * H, T0 + 4 * H)))
        .await
        .unwrap();
    assert_eq!(moved.span, Span::new(T0 + 2 * H, T0 + 4 * H));

    let err = engine
        .update_reservation(
            a.id,
            ReservationPatch {
                end: Some(T0 + 6 * H),
                ..ReservationPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::Conflict {
            resource_id: bus,
            conflicting: vec![b.id],
        }
    );
    assert_eq!(
        engine.get_reservation(&a.id).await.unwrap().span,
        Span::new(T0 + 2 * H, T0 + 4 * H)
    );
}

#[tokio::test]
async fn update_into_the_past_rejected() {
    let path = test_wal_path("update_past");
    let (engine, clock) = engine_at(&path, T0);
    let r = engine
        .create_reservation(trip(Ulid::new(), T0 + 2 * H, T0 + 4 * H))
        .await
        .unwrap();
    clock.set(T0 + H);
    let result = engine
        .update_reservation(r.id, ReservationPatch::range(Span::new(T0, T0 + 3 * H)))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn status_only_update_skips_conflict_check() {
    let path = test_wal_path("status_only");
    let (engine, clock) = engine_at(&path, T0);
    let r = engine
        .create_reservation(trip(Ulid::new(), T0 + H, T0 + 2 * H))
        .await
        .unwrap();
    // Trip already started; confirming must not trip the past-start rule.
    clock.set(T0 + H + 1);
    let confirmed = engine.confirm_reservation(r.id).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    assert_eq!(confirmed.span, r.span);
}

#[tokio::test]
async fn move_to_other_vehicle() {
    let path = test_wal_path("move");
    let (engine, _) = engine_at(&path, T0);
    let (bus_a, bus_b) = (Ulid::new(), Ulid::new());

    let r = engine.create_reservation(trip(bus_a, T0 + H, T0 + 3 * H)).await.unwrap();
    let blocker = engine.create_reservation(trip(bus_b, T0 + 2 * H, T0 + 4 * H)).await.unwrap();

    let to_b = ReservationPatch {
        resource_id: Some(bus_b),
        ..ReservationPatch::default()
    };
    assert_eq!(
        engine.update_reservation(r.id, to_b.clone()).await,
        Err(EngineError::Conflict {
            resource_id: bus_b,
            conflicting: vec![blocker.id],
        })
    );

    engine.cancel_reservation(blocker.id).await.unwrap();
    let moved = engine.update_reservation(r.id, to_b).await.unwrap();
    assert_eq!(moved.resource_id, bus_b);
    assert_eq!(engine.reservation_resource(&r.id), Some(bus_b));
    assert!(engine.reservations_for_resource(&bus_a).await.is_empty());
    assert!(engine.is_available(&bus_a, T0 + H, T0 + 3 * H).await.unwrap());
    assert!(!engine.is_available(&bus_b, T0 + H, T0 + 3 * H).await.unwrap());
}

#[tokio::test]
async fn delete_removes_reservation() {
    let path = test_wal_path("delete");
    let (engine, _) = engine_at(&path, T0);
    let bus = Ulid::new();
    let r = engine.create_reservation(trip(bus, T0 + H, T0 + 2 * H)).await.unwrap();
    let removed = engine.delete_reservation(r.id).await.unwrap();
    assert_eq!(removed.id, r.id);
    assert!(engine.get_reservation(&r.id).await.is_none());
    assert!(engine.reservation_resource(&r.id).is_none());
}

#[tokio::test]
async fn reservations_for_client_spans_vehicles() {
    let path = test_wal_path("by_client");
    let (engine, _) = engine_at(&path, T0);
    let client = Ulid::new();
    let mut later = trip(Ulid::new(), T0 + 5 * H, T0 + 6 * H);
    later.client_id = client;
    let mut sooner = trip(Ulid::new(), T0 + H, T0 + 2 * H);
    sooner.client_id = client;
    engine.create_reservation(later.clone()).await.unwrap();
    engine.create_reservation(sooner.clone()).await.unwrap();
    engine.create_reservation(trip(Ulid::new(), T0 + H, T0 + 2 * H)).await.unwrap();

    let ids: Vec<_> = engine
        .reservations_for_client(&client)
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![sooner.id, later.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_one() {
    let path = test_wal_path("concurrent");
    let clock = Arc::new(ManualClock::at(T0));
    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap());
    let bus = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(trip(bus, T0 + H + i * 60_000, T0 + 3 * H + i * 60_000))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);

    let rows = engine.reservations_for_resource(&bus).await;
    for (i, a) in rows.iter().enumerate() {
        for b in &rows[i + 1..] {
            assert!(!(a.status.is_blocking() && b.status.is_blocking() && a.span.overlaps(&b.span)));
        }
    }
}

fn assert_conflict_free(rows: &[Reservation]) {
    for (i, a) in rows.iter().enumerate() {
        for b in &rows[i + 1..] {
            assert!(
                !(a.status.is_blocking() && b.status.is_blocking() && a.span.overlaps(&b.span)),
                "{} {:?} overlaps {} {:?}",
                a.id,
                a.span,
                b.id,
                b.span
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_moves_and_creates_stay_conflict_free() {
    let path = test_wal_path("concurrent_mixed");
    let clock = Arc::new(ManualClock::at(T0));
    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap());
    let vehicles = [Ulid::new(), Ulid::new()];

    let mut seeded = Vec::new();
    for (v, vehicle) in vehicles.iter().enumerate() {
        for slot in 0..4 {
            let start = T0 + H + slot * 3 * H;
            let r = engine.create_reservation(trip(*vehicle, start, start + 2 * H)).await.unwrap();
            seeded.push((v, r.id));
        }
    }

    // Each seeded trip gets one range update and one move; moves run in both
    // directions so both lock orders are taken.
    let mut handles = Vec::new();
    for i in 0..24usize {
        let engine = engine.clone();
        let (v, id) = seeded[i % seeded.len()];
        let start = T0 + H + ((i as Ms * 5) % 24) * (H / 2);
        let span = Some(start);
        let end = Some(start + 2 * H);
        handles.push(tokio::spawn(async move {
            match i % 3 {
                0 => engine
                    .update_reservation(
                        id,
                        ReservationPatch {
                            start: span,
                            end,
                            ..ReservationPatch::default()
                        },
                    )
                    .await
                    .map(|_| false),
                1 => engine
                    .update_reservation(
                        id,
                        ReservationPatch {
                            resource_id: Some(vehicles[1 - v]),
                            start: span,
                            end,
                            ..ReservationPatch::default()
                        },
                    )
                    .await
                    .map(|_| false),
                _ => engine
                    .create_reservation(trip(vehicles[i % 2], start, start + 2 * H))
                    .await
                    .map(|_| true),
            }
        }));
    }

    let mut created = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(true) => created += 1,
            Ok(false) | Err(EngineError::Conflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let mut total = 0;
    for vehicle in vehicles {
        let rows = engine.reservations_for_resource(&vehicle).await;
        assert_conflict_free(&rows);
        for r in &rows {
            assert_eq!(r.resource_id, vehicle);
            assert_eq!(engine.reservation_resource(&r.id), Some(vehicle));
        }
        total += rows.len();
    }
    assert_eq!(total, seeded.len() + created);
}

#[tokio::test]
async fn commit_notifies_watchers() {
    let path = test_wal_path("notify");
    let (engine, _) = engine_at(&path, T0);
    let bus = Ulid::new();
    let mut rx = engine.notify.subscribe(bus);

    let r = engine.create_reservation(trip(bus, T0 + H, T0 + 2 * H)).await.unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::ReservationCreated { reservation } if reservation.id == r.id
    ));

    engine.cancel_reservation(r.id).await.unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::ReservationUpdated { status: ReservationStatus::Canceled, .. }
    ));

    // Rejected writes publish nothing.
    engine.create_reservation(trip(bus, T0 + H, T0 + 2 * H)).await.unwrap();
    let _ = rx.recv().await.unwrap();
    let _ = engine.create_reservation(trip(bus, T0 + H, T0 + 2 * H)).await;
    assert!(rx.try_recv().is_err());
}

// ── Reminders ────────────────────────────────────────────

#[tokio::test]
async fn reminder_candidates_window_and_status() {
    let path = test_wal_path("reminder_window");
    let (engine, _) = engine_at(&path, T0);

    let inside = engine.create_reservation(trip(Ulid::new(), T0 + 2 * H, T0 + 3 * H)).await.unwrap();
    let edge = engine.create_reservation(trip(Ulid::new(), T0 + DAY, T0 + DAY + H)).await.unwrap();
    engine
        .create_reservation(trip(Ulid::new(), T0 + DAY + 1, T0 + DAY + H))
        .await
        .unwrap();
    let canceled = engine.create_reservation(trip(Ulid::new(), T0 + 4 * H, T0 + 5 * H)).await.unwrap();
    engine.cancel_reservation(canceled.id).await.unwrap();

    let due: Vec<_> = engine
        .reminder_candidates(T0, DAY)
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(due, vec![inside.id, edge.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reminder_claim_is_exclusive() {
    let path = test_wal_path("reminder_claim");
    let clock = Arc::new(ManualClock::at(T0));
    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap());
    let r = engine.create_reservation(trip(Ulid::new(), T0 + H, T0 + 2 * H)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.claim_reminder(r.id, T0, DAY).await }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(engine.get_reservation(&r.id).await.unwrap().notification_sent);
    assert!(engine.reminder_candidates(T0, DAY).await.is_empty());
}

#[tokio::test]
async fn released_reminder_becomes_eligible_again() {
    let path = test_wal_path("reminder_release");
    let (engine, _) = engine_at(&path, T0);
    let r = engine.create_reservation(trip(Ulid::new(), T0 + H, T0 + 2 * H)).await.unwrap();

    assert!(engine.claim_reminder(r.id, T0, DAY).await.unwrap().is_some());
    engine.release_reminder(r.id).await.unwrap();
    assert_eq!(engine.reminder_candidates(T0, DAY).await.len(), 1);
    assert!(engine.claim_reminder(r.id, T0, DAY).await.unwrap().is_some());
}

#[tokio::test]
async fn notifications_are_recorded_per_reservation() {
    let path = test_wal_path("notifications");
    let (engine, _) = engine_at(&path, T0);
    let r = engine.create_reservation(trip(Ulid::new(), T0 + H, T0 + 2 * H)).await.unwrap();

    let n = engine
        .record_notification(r.id, NotificationKind::Reminder, "see you tomorrow".into())
        .await
        .unwrap();
    assert_eq!(n.sent_at, T0);
    assert_eq!(engine.notifications_for(&r.id), vec![n]);
    assert!(matches!(
        engine
            .record_notification(Ulid::new(), NotificationKind::Custom, "x".into())
            .await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Mailings ─────────────────────────────────────────────

#[tokio::test]
async fn subscriptions_upsert_and_opt_out() {
    let path = test_wal_path("subscriptions");
    let (engine, _) = engine_at(&path, T0);
    let m = engine.create_mailing(mailing(T0 + DAY)).await.unwrap();

    let mut users: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
    users.sort();
    for (i, user) in users.iter().enumerate() {
        engine
            .set_subscription(Subscription {
                mailing_id: m.id,
                user_id: *user,
                email: format!("user{i}@example.com"),
                subscribed: true,
            })
            .await
            .unwrap();
    }
    engine
        .set_subscription(Subscription {
            mailing_id: m.id,
            user_id: users[1],
            email: "user1@example.com".into(),
            subscribed: false,
        })
        .await
        .unwrap();

    assert_eq!(
        engine.active_subscribers(&m.id).await.unwrap(),
        vec!["user0@example.com".to_string(), "user2@example.com".to_string()]
    );
    assert!(!engine.subscription(&m.id, &users[1]).await.unwrap().subscribed);
    assert!(matches!(
        engine.active_subscribers(&Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn shared_address_is_listed_once() {
    let path = test_wal_path("shared_address");
    let (engine, _) = engine_at(&path, T0);
    let m = engine.create_mailing(mailing(T0 + H)).await.unwrap();
    let mut users: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
    users.sort();
    for (user_id, email) in users.iter().zip(["family@example.com", "solo@example.com", "family@example.com"]) {
        engine
            .set_subscription(Subscription {
                mailing_id: m.id,
                user_id: *user_id,
                email: email.into(),
                subscribed: true,
            })
            .await
            .unwrap();
    }

    assert_eq!(
        engine.active_subscribers(&m.id).await.unwrap(),
        vec!["family@example.com", "solo@example.com"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mailing_creates_with_one_id_admit_one() {
    let path = test_wal_path("mailing_race");
    let clock = Arc::new(ManualClock::at(T0));
    let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap());
    let id = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut new = mailing(T0 + H);
            new.id = id;
            new.subject = format!("Draft {i}");
            engine.create_mailing(new).await
        }));
    }
    let mut winners = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(m) => winners.push(m.subject),
            Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(engine.get_mailing(&id).await.unwrap().subject, winners[0]);

    // Only the winner reached the log.
    drop(engine);
    let reopened = Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap();
    assert_eq!(reopened.get_mailing(&id).await.unwrap().subject, winners[0]);
    assert_eq!(reopened.list_mailings().await.len(), 1);
}

#[tokio::test]
async fn mailing_validation() {
    let path = test_wal_path("mailing_validation");
    let (engine, _) = engine_at(&path, T0);
    let mut blank = mailing(T0);
    blank.subject = String::new();
    assert!(matches!(engine.create_mailing(blank).await, Err(EngineError::Validation(_))));

    let mut long = mailing(T0);
    long.subject = "x".repeat(MAX_SUBJECT_LEN + 1);
    assert!(matches!(engine.create_mailing(long).await, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn mark_sent_is_idempotent() {
    let path = test_wal_path("mark_sent");
    let (engine, _) = engine_at(&path, T0);
    let m = engine.create_mailing(mailing(T0 + H)).await.unwrap();

    assert!(engine.mark_mailing_sent(m.id).await.unwrap());
    assert!(!engine.mark_mailing_sent(m.id).await.unwrap());
    assert!(engine.get_mailing(&m.id).await.unwrap().is_sent);
    assert!(engine.pending_mailings().await.is_empty());
}

#[tokio::test]
async fn clearing_a_replaced_handle_is_a_noop() {
    let path = test_wal_path("clear_handle");
    let (engine, _) = engine_at(&path, T0);
    let m = engine.create_mailing(mailing(T0 + H)).await.unwrap();
    let (old, new) = (JobHandle::new(), JobHandle::new());

    engine.set_job_handle(m.id, Some(old)).await.unwrap();
    engine.set_job_handle(m.id, Some(new)).await.unwrap();
    assert!(!engine.clear_job_handle(m.id, old).await.unwrap());
    assert_eq!(engine.get_mailing(&m.id).await.unwrap().job_handle, Some(new));

    assert!(engine.clear_job_handle(m.id, new).await.unwrap());
    assert_eq!(engine.get_mailing(&m.id).await.unwrap().job_handle, None);
}

#[tokio::test]
async fn failed_recipients_accumulate() {
    let path = test_wal_path("failed_recipients");
    let (engine, _) = engine_at(&path, T0);
    let m = engine.create_mailing(mailing(T0 + H)).await.unwrap();

    engine.record_failed_recipients(m.id, vec!["a@x".into()]).await.unwrap();
    engine.record_failed_recipients(m.id, vec![]).await.unwrap();
    engine
        .record_failed_recipients(m.id, vec!["b@x".into(), "c@x".into()])
        .await
        .unwrap();
    assert_eq!(
        engine.get_mailing(&m.id).await.unwrap().failed_recipients,
        vec!["a@x", "b@x", "c@x"]
    );
}

#[tokio::test]
async fn update_and_delete_mailing() {
    let path = test_wal_path("mailing_update");
    let (engine, clock) = engine_at(&path, T0);
    let m = engine.create_mailing(mailing(T0 + H)).await.unwrap();

    clock.advance(1_000);
    let updated = engine
        .update_mailing(
            m.id,
            MailingPatch {
                send_time: Some(T0 + 2 * H),
                kind: Some(MailingKind::Promotion),
                ..MailingPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.send_time, T0 + 2 * H);
    assert_eq!(updated.kind, MailingKind::Promotion);
    assert_eq!(updated.subject, m.subject);
    assert_eq!(updated.updated_at, T0 + 1_000);

    engine.delete_mailing(m.id).await.unwrap();
    assert!(engine.get_mailing(&m.id).await.is_none());
    assert!(matches!(
        engine.set_job_handle(m.id, Some(JobHandle::new())).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn skip_reason_is_truncated_on_char_boundary() {
    let path = test_wal_path("skip_reason");
    let (engine, _) = engine_at(&path, T0);
    let m = engine.create_mailing(mailing(T0 + H)).await.unwrap();
    let reason = "é".repeat(MAX_SKIP_REASON_LEN);
    engine.record_dispatch_skipped(m.id, &reason).await.unwrap();
    let stored = engine.get_mailing(&m.id).await.unwrap().skipped.unwrap();
    assert!(stored.len() <= MAX_SKIP_REASON_LEN);
    assert!(stored.chars().all(|c| c == 'é'));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("replay");
    let (bus_a, bus_b) = (Ulid::new(), Ulid::new());
    let (kept, moved, canceled, removed, m, job);
    {
        let (engine, _) = engine_at(&path, T0);
        kept = engine.create_reservation(trip(bus_a, T0 + H, T0 + 2 * H)).await.unwrap();
        engine.confirm_reservation(kept.id).await.unwrap();
        moved = engine.create_reservation(trip(bus_a, T0 + 3 * H, T0 + 4 * H)).await.unwrap();
        engine
            .update_reservation(
                moved.id,
                ReservationPatch {
                    resource_id: Some(bus_b),
                    ..ReservationPatch::default()
                },
            )
            .await
            .unwrap();
        canceled = engine.create_reservation(trip(bus_b, T0 + 5 * H, T0 + 6 * H)).await.unwrap();
        engine.cancel_reservation(canceled.id).await.unwrap();
        removed = engine.create_reservation(trip(bus_b, T0 + 7 * H, T0 + 8 * H)).await.unwrap();
        engine.delete_reservation(removed.id).await.unwrap();
        engine.claim_reminder(kept.id, T0, DAY).await.unwrap();

        m = engine.create_mailing(mailing(T0 + DAY)).await.unwrap();
        job = JobHandle::new();
        engine.set_job_handle(m.id, Some(job)).await.unwrap();
        engine
            .set_subscription(Subscription {
                mailing_id: m.id,
                user_id: Ulid::new(),
                email: "u@example.com".into(),
                subscribed: true,
            })
            .await
            .unwrap();
    }

    let (engine, _) = engine_at(&path, T0);
    let kept = engine.get_reservation(&kept.id).await.unwrap();
    assert_eq!(kept.status, ReservationStatus::Confirmed);
    assert!(kept.notification_sent);
    assert_eq!(engine.get_reservation(&moved.id).await.unwrap().resource_id, bus_b);
    assert_eq!(engine.reservation_resource(&moved.id), Some(bus_b));
    assert_eq!(
        engine.get_reservation(&canceled.id).await.unwrap().status,
        ReservationStatus::Canceled
    );
    assert!(engine.get_reservation(&removed.id).await.is_none());
    assert_eq!(engine.reservations_for_resource(&bus_a).await.len(), 1);

    let restored = engine.get_mailing(&m.id).await.unwrap();
    assert_eq!(restored.job_handle, Some(job));
    assert_eq!(engine.active_subscribers(&m.id).await.unwrap(), vec!["u@example.com"]);

    // Conflict index is rebuilt too.
    assert!(matches!(
        engine.create_reservation(trip(bus_b, T0 + 3 * H, T0 + 4 * H)).await,
        Err(EngineError::Conflict { .. })
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction");
    let bus = Ulid::new();
    let mut ids = Vec::new();
    let m;
    {
        let (engine, _) = engine_at(&path, T0);
        for i in 0..10 {
            let r = engine
                .create_reservation(trip(bus, T0 + i * H, T0 + i * H + H / 2))
                .await
                .unwrap();
            ids.push(r.id);
        }
        for id in &ids[..5] {
            engine.cancel_reservation(*id).await.unwrap();
        }
        engine
            .record_notification(ids[6], NotificationKind::Status, "confirmed".into())
            .await
            .unwrap();
        m = engine.create_mailing(mailing(T0 + DAY)).await.unwrap();
        engine.mark_mailing_sent(m.id).await.unwrap();

        assert!(engine.wal_appends_since_compact().await >= 17);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Writes after compaction land in the new log.
        engine.delete_reservation(ids[9]).await.unwrap();
    }

    let (engine, _) = engine_at(&path, T0);
    let rows = engine.reservations_for_resource(&bus).await;
    assert_eq!(rows.len(), 9);
    assert_eq!(
        rows.iter().filter(|r| r.status == ReservationStatus::Canceled).count(),
        5
    );
    assert_eq!(engine.notifications_for(&ids[6]).len(), 1);
    assert!(engine.get_mailing(&m.id).await.unwrap().is_sent);
}
