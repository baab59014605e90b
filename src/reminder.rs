use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::Engine;
use crate::mailer::{Message, Transport};
use crate::model::*;
use crate::observability::{REMINDERS_SENT_TOTAL, REMINDER_FAILURES_TOTAL};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub sent: usize,
    pub failed: usize,
    /// Candidates another scan claimed first, or that stopped being eligible.
    pub skipped: usize,
}

/// Sends one reminder per upcoming trip. Overlapping scans are safe: a reservation
/// is only messaged by the scan that flips its `notification_sent` flag.
pub struct ReminderScanner {
    engine: Arc<Engine>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    window_ms: Ms,
}

impl ReminderScanner {
    pub fn new(engine: Arc<Engine>, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, window_ms: Ms) -> Self {
        Self {
            engine,
            transport,
            clock,
            window_ms,
        }
    }

    pub async fn scan_once(&self) -> ScanReport {
        let now = self.clock.now_ms();
        let mut report = ScanReport::default();

        for candidate in self.engine.reminder_candidates(now, self.window_ms).await {
            let reservation = match self.engine.claim_reminder(candidate.id, now, self.window_ms).await {
                Ok(Some(r)) => r,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    debug!(reservation_id = %candidate.id, "reminder claim skipped: {e}");
                    report.skipped += 1;
                    continue;
                }
            };

            let message = reminder_message(&reservation);
            match self.transport.send(&reservation.contact, &message).await {
                Ok(()) => {
                    report.sent += 1;
                    metrics::counter!(REMINDERS_SENT_TOTAL).increment(1);
                    if let Err(e) = self
                        .engine
                        .record_notification(reservation.id, NotificationKind::Reminder, message.body)
                        .await
                    {
                        warn!(reservation_id = %reservation.id, "reminder sent but not recorded: {e}");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!(REMINDER_FAILURES_TOTAL).increment(1);
                    warn!(reservation_id = %reservation.id, "reminder delivery failed: {e}");
                    if let Err(e) = self.engine.release_reminder(reservation.id).await {
                        warn!(reservation_id = %reservation.id, "could not release reminder claim: {e}");
                    }
                }
            }
        }

        if report != ScanReport::default() {
            info!(sent = report.sent, failed = report.failed, skipped = report.skipped, "reminder scan");
        }
        report
    }

    /// Scan every `period` until `shutdown` fires.
    pub async fn run(self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.scan_once().await;
        }
        debug!("reminder scanner stopped");
    }
}

fn reminder_message(reservation: &Reservation) -> Message {
    let start = DateTime::<Utc>::from_timestamp_millis(reservation.span.start)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| reservation.span.start.to_string());
    Message {
        subject: "Upcoming trip reminder".into(),
        body: format!("Your trip (reservation {}) departs at {start}.", reservation.id),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ulid::Ulid;

    use super::*;
    use crate::clock::ManualClock;
    use crate::mailer::DeliveryError;
    use crate::mailer::transport::testing::ScriptedTransport;
    use crate::notify::NotifyHub;

    const T0: Ms = 1_800_000_000_000;
    const HOUR: Ms = 3_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("convoy_test_reminder");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{name}_{}.wal", Ulid::new()))
    }

    fn setup(name: &str) -> (Arc<Engine>, Arc<ScriptedTransport>, ReminderScanner) {
        let clock = Arc::new(ManualClock::at(T0));
        let engine = Arc::new(
            Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), clock.clone()).unwrap(),
        );
        let transport = Arc::new(ScriptedTransport::default());
        let scanner = ReminderScanner::new(engine.clone(), transport.clone(), clock, 24 * HOUR);
        (engine, transport, scanner)
    }

    async fn book(engine: &Engine, starts_in: Ms, contact: &str) -> Reservation {
        engine
            .create_reservation(NewReservation {
                id: Ulid::new(),
                resource_id: Ulid::new(),
                client_id: Ulid::new(),
                carrier_id: None,
                span: Span::new(T0 + starts_in, T0 + starts_in + 2 * HOUR),
                contact: contact.into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn overlapping_scans_send_once() {
        let (engine, transport, scanner) = setup("send_once");
        let r = book(&engine, 5 * HOUR, "rider@example.com").await;

        let first = scanner.scan_once().await;
        let second = scanner.scan_once().await;

        assert_eq!(first.sent, 1);
        assert_eq!(second, ScanReport::default());
        assert_eq!(transport.delivered_to(), vec!["rider@example.com"]);
        assert!(engine.get_reservation(&r.id).await.unwrap().notification_sent);

        let notes = engine.notifications_for(&r.id);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationKind::Reminder);
    }

    #[tokio::test]
    async fn failure_leaves_trip_eligible_and_others_proceed() {
        let (engine, transport, scanner) = setup("failure");
        let broken = book(&engine, HOUR, "down@example.com").await;
        let fine = book(&engine, 2 * HOUR, "up@example.com").await;
        transport.fail("down@example.com", [DeliveryError::Transient("timeout".into())]);

        let report = scanner.scan_once().await;
        assert_eq!((report.sent, report.failed), (1, 1));
        assert!(!engine.get_reservation(&broken.id).await.unwrap().notification_sent);
        assert!(engine.get_reservation(&fine.id).await.unwrap().notification_sent);

        // Next run retries the failed one only.
        let report = scanner.scan_once().await;
        assert_eq!((report.sent, report.failed), (1, 0));
        assert_eq!(transport.delivered_to(), vec!["up@example.com", "down@example.com"]);
    }

    #[tokio::test]
    async fn outside_window_or_cancelled_is_ignored() {
        let (engine, transport, scanner) = setup("window");
        book(&engine, 48 * HOUR, "later@example.com").await;
        let cancelled = book(&engine, HOUR, "gone@example.com").await;
        engine.cancel_reservation(cancelled.id).await.unwrap();

        assert_eq!(scanner.scan_once().await, ScanReport::default());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_scans_never_double_send() {
        let (engine, transport, scanner) = setup("concurrent");
        for i in 0..20 {
            book(&engine, HOUR + i, &format!("r{i}@example.com")).await;
        }
        let scanner = Arc::new(scanner);
        let (a, b) = tokio::join!(scanner.scan_once(), scanner.scan_once());
        assert_eq!(a.sent + b.sent, 20);
        assert_eq!(transport.calls(), 20);
    }

    #[test]
    fn message_renders_start_in_utc() {
        let r = Reservation {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            client_id: Ulid::new(),
            carrier_id: None,
            span: Span::new(1_700_000_000_000, 1_700_003_600_000),
            status: ReservationStatus::Confirmed,
            contact: "a@example.com".into(),
            notification_sent: false,
            created_at: 0,
        };
        assert!(reminder_message(&r).body.contains("2023-11-14 22:13 UTC"));
    }
}
