use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, reject_past_start, validate_range};
use super::{Engine, EngineError, MailingState, WalCommand, MAX_RESOLVE_ATTEMPTS};

fn validate_contact(contact: &str) -> Result<(), EngineError> {
    if contact.trim().is_empty() {
        return Err(EngineError::validation("contact address is required"));
    }
    if contact.len() > MAX_CONTACT_LEN {
        return Err(EngineError::LimitExceeded("contact address too long"));
    }
    Ok(())
}

fn validate_mailing_text(subject: &str, body: &str) -> Result<(), EngineError> {
    if subject.trim().is_empty() {
        return Err(EngineError::validation("mailing subject is required"));
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(EngineError::LimitExceeded("mailing subject too long"));
    }
    if body.len() > MAX_BODY_LEN {
        return Err(EngineError::LimitExceeded("mailing body too long"));
    }
    Ok(())
}

/// Work out the span and status a patch produces, enforcing the lifecycle edges.
fn plan_update(
    existing: &Reservation,
    patch: &ReservationPatch,
    now: Ms,
) -> Result<(Span, ReservationStatus), EngineError> {
    let span = validate_range(
        patch.start.unwrap_or(existing.span.start),
        patch.end.unwrap_or(existing.span.end),
    )?;
    if span != existing.span {
        reject_past_start(&span, now)?;
    }
    let status = match patch.status {
        Some(next) if next != existing.status => {
            if !existing.status.can_transition_to(next) {
                return Err(EngineError::InvalidTransition {
                    id: existing.id,
                    from: existing.status,
                    to: next,
                });
            }
            next
        }
        _ => existing.status,
    };
    Ok((span, status))
}

/// Whether the reminder scanner should pick this reservation up at `now`.
pub(crate) fn reminder_due(r: &Reservation, now: Ms, window: Ms) -> bool {
    r.status.is_blocking()
        && !r.notification_sent
        && r.span.start >= now
        && r.span.start <= now.saturating_add(window)
}

impl Engine {
    // ── Reservation state machine ────────────────────────────

    /// Create a pending reservation. The conflict check runs under the vehicle's
    /// write lock, together with the commit.
    pub async fn create_reservation(&self, new: NewReservation) -> Result<Reservation, EngineError> {
        let span = validate_range(new.span.start, new.span.end)?;
        let now = self.clock.now_ms();
        reject_past_start(&span, now)?;
        validate_contact(&new.contact)?;

        let _gate = self.commit_gate.read().await;
        let rs = self.resource_slot(new.resource_id);
        let mut guard = rs.write().await;
        if self.reservation_index.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        check_no_conflict(&guard, &span, None)?;

        let reservation = Reservation {
            id: new.id,
            resource_id: new.resource_id,
            client_id: new.client_id,
            carrier_id: new.carrier_id,
            span,
            status: ReservationStatus::Pending,
            contact: new.contact,
            notification_sent: false,
            created_at: now,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_reservation(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_COMMITTED_TOTAL, "op" => "create")
            .increment(1);
        Ok(reservation)
    }

    /// Change range, vehicle and/or status. A range or vehicle change on a blocking
    /// reservation is re-checked against every other blocking reservation.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.commit_gate.read().await;
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let current = self
                .reservation_resource(&id)
                .ok_or(EngineError::NotFound(id))?;
            let target = patch.resource_id.unwrap_or(current);
            let outcome = if target == current {
                self.update_in_place(id, current, &patch).await?
            } else {
                self.update_moving(id, current, target, &patch).await?
            };
            if let Some(updated) = outcome {
                metrics::counter!(crate::observability::RESERVATIONS_COMMITTED_TOTAL, "op" => "update")
                    .increment(1);
                return Ok(updated);
            }
        }
        Err(EngineError::NotFound(id))
    }

    /// `Ok(None)` if the reservation left `resource_id` before we got the lock.
    async fn update_in_place(
        &self,
        id: Ulid,
        resource_id: Ulid,
        patch: &ReservationPatch,
    ) -> Result<Option<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        let Some(existing) = guard.get(id).cloned() else {
            return Ok(None);
        };
        let (span, status) = plan_update(&existing, patch, self.clock.now_ms())?;
        if span == existing.span && status == existing.status {
            return Ok(Some(existing));
        }
        if status.is_blocking() && span != existing.span {
            check_no_conflict(&guard, &span, Some(id))?;
        }

        let event = Event::ReservationUpdated {
            id,
            from_resource: resource_id,
            resource_id,
            span,
            status,
        };
        self.persist_reservation(&mut guard, &event).await?;
        Ok(guard.get(id).cloned())
    }

    /// Move to another vehicle. Both write locks are taken in id order.
    async fn update_moving(
        &self,
        id: Ulid,
        from: Ulid,
        to: Ulid,
        patch: &ReservationPatch,
    ) -> Result<Option<Reservation>, EngineError> {
        let from_rs = self.get_resource(&from).ok_or(EngineError::NotFound(from))?;
        let to_rs = self.resource_slot(to);
        let (mut first, mut second) = if from < to {
            let a = from_rs.write_owned().await;
            (a, to_rs.write_owned().await)
        } else {
            let a = to_rs.write_owned().await;
            (a, from_rs.write_owned().await)
        };
        let (source, target) = if from < to {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        let Some(existing) = source.get(id).cloned() else {
            return Ok(None);
        };
        if target.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        let (span, status) = plan_update(&existing, patch, self.clock.now_ms())?;
        if status.is_blocking() {
            check_no_conflict(target, &span, None)?;
        }

        let event = Event::ReservationUpdated {
            id,
            from_resource: from,
            resource_id: to,
            span,
            status,
        };
        self.persist_move(target, source, &event).await?;
        Ok(target.get(id).cloned())
    }

    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.update_reservation(id, ReservationPatch::status(ReservationStatus::Confirmed))
            .await
    }

    /// Releases the vehicle; never conflict-checked.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.update_reservation(id, ReservationPatch::status(ReservationStatus::Canceled))
            .await
    }

    /// Releases the vehicle; never conflict-checked.
    pub async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.update_reservation(id, ReservationPatch::status(ReservationStatus::Completed))
            .await
    }

    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let removed = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::ReservationDeleted {
            id,
            resource_id: guard.id,
        };
        self.persist_reservation(&mut guard, &event).await?;
        Ok(removed)
    }

    // ── Reminder flags ───────────────────────────────────────

    /// Re-check reminder eligibility and set `notification_sent` in one locked step.
    /// Returns the reservation only to the single caller that flipped the flag.
    pub async fn claim_reminder(
        &self,
        id: Ulid,
        now: Ms,
        window: Ms,
    ) -> Result<Option<Reservation>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        match guard.get(id) {
            Some(r) if reminder_due(r, now, window) => {}
            _ => return Ok(None),
        }
        let event = Event::ReminderFlagSet {
            id,
            resource_id: guard.id,
            sent: true,
        };
        self.persist_reservation(&mut guard, &event).await?;
        Ok(guard.get(id).cloned())
    }

    /// Undo a claim after delivery failed, so the next scan picks the trip up again.
    pub async fn release_reminder(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        if !guard.get(id).is_some_and(|r| r.notification_sent) {
            return Ok(());
        }
        let event = Event::ReminderFlagSet {
            id,
            resource_id: guard.id,
            sent: false,
        };
        self.persist_reservation(&mut guard, &event).await
    }

    pub async fn record_notification(
        &self,
        reservation_id: Ulid,
        kind: NotificationKind,
        message: String,
    ) -> Result<Notification, EngineError> {
        if self.reservation_resource(&reservation_id).is_none() {
            return Err(EngineError::NotFound(reservation_id));
        }
        let notification = Notification {
            id: Ulid::new(),
            reservation_id,
            kind,
            message,
            sent_at: self.clock.now_ms(),
            read: false,
        };
        let event = Event::NotificationRecorded {
            notification: notification.clone(),
        };
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        super::record_notification(&self.notifications, &notification);
        Ok(notification)
    }

    // ── Mailings ─────────────────────────────────────────────

    pub async fn create_mailing(&self, new: NewMailing) -> Result<Mailing, EngineError> {
        validate_mailing_text(&new.subject, &new.body)?;
        let now = self.clock.now_ms();
        let mailing = Mailing {
            id: new.id,
            subject: new.subject,
            body: new.body,
            send_time: new.send_time,
            kind: new.kind,
            is_sent: false,
            job_handle: None,
            failed_recipients: Vec::new(),
            skipped: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::MailingCreated {
            mailing: mailing.clone(),
        };
        let _gate = self.commit_gate.read().await;
        let state = Arc::new(RwLock::new(MailingState {
            mailing: mailing.clone(),
            subscriptions: BTreeMap::new(),
        }));
        // Held until the WAL append lands so readers never see an uncommitted mailing.
        let _guard = state.write().await;
        match self.mailings.entry(mailing.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(mailing.id)),
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
            }
        }
        if let Err(e) = self.wal_append(&event).await {
            self.mailings.remove(&mailing.id);
            return Err(e);
        }
        Ok(mailing)
    }

    pub async fn update_mailing(&self, id: Ulid, patch: MailingPatch) -> Result<Mailing, EngineError> {
        let _gate = self.commit_gate.read().await;
        let state = self.get_mailing_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = state.write().await;
        let current = &guard.mailing;
        let subject = patch.subject.unwrap_or_else(|| current.subject.clone());
        let body = patch.body.unwrap_or_else(|| current.body.clone());
        validate_mailing_text(&subject, &body)?;
        let event = Event::MailingUpdated {
            id,
            subject,
            body,
            send_time: patch.send_time.unwrap_or(current.send_time),
            kind: patch.kind.unwrap_or(current.kind),
            updated_at: self.clock.now_ms(),
        };
        self.persist_mailing(&mut guard, &event).await?;
        Ok(guard.mailing.clone())
    }

    pub async fn delete_mailing(&self, id: Ulid) -> Result<Mailing, EngineError> {
        let _gate = self.commit_gate.read().await;
        let state = self.get_mailing_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = state.write().await;
        self.wal_append(&Event::MailingDeleted { id }).await?;
        self.mailings.remove(&id);
        Ok(guard.mailing.clone())
    }

    /// Record (or clear) the in-flight scheduled firing.
    pub async fn set_job_handle(&self, id: Ulid, job: Option<JobHandle>) -> Result<(), EngineError> {
        self.mutate_mailing(id, |_| Some(Event::MailingArmed { id, job }))
            .await
            .map(|_| ())
    }

    /// Clear the handle only if it is still `job`; a re-arm that raced the firing wins.
    pub async fn clear_job_handle(&self, id: Ulid, job: JobHandle) -> Result<bool, EngineError> {
        self.mutate_mailing(id, |m| {
            (m.job_handle == Some(job)).then_some(Event::MailingArmed { id, job: None })
        })
        .await
    }

    /// Idempotent; returns whether this call flipped `is_sent`.
    pub async fn mark_mailing_sent(&self, id: Ulid) -> Result<bool, EngineError> {
        self.mutate_mailing(id, |m| (!m.is_sent).then_some(Event::MailingSent { id }))
            .await
    }

    /// Append to the mailing's failure audit trail.
    pub async fn record_failed_recipients(
        &self,
        id: Ulid,
        recipients: Vec<String>,
    ) -> Result<(), EngineError> {
        if recipients.is_empty() {
            return Ok(());
        }
        self.mutate_mailing(id, |_| Some(Event::FailedRecipientsRecorded { id, recipients }))
            .await
            .map(|_| ())
    }

    pub async fn record_dispatch_skipped(&self, id: Ulid, reason: &str) -> Result<(), EngineError> {
        let mut end = reason.len().min(MAX_SKIP_REASON_LEN);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let reason = reason[..end].to_string();
        self.mutate_mailing(id, |_| Some(Event::MailingSkipped { id, reason }))
            .await
            .map(|_| ())
    }

    /// Upsert the `(user, mailing)` opt-in row.
    pub async fn set_subscription(&self, subscription: Subscription) -> Result<Subscription, EngineError> {
        validate_contact(&subscription.email)?;
        let id = subscription.mailing_id;
        let _gate = self.commit_gate.read().await;
        let state = self.get_mailing_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = state.write().await;
        if !guard.subscriptions.contains_key(&subscription.user_id)
            && guard.subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_MAILING
        {
            return Err(EngineError::LimitExceeded("too many subscriptions on mailing"));
        }
        let event = Event::SubscriptionSet {
            subscription: subscription.clone(),
        };
        self.persist_mailing(&mut guard, &event).await?;
        Ok(subscription)
    }

    /// Lock a mailing, let `f` decide on an event, persist it. Returns whether one was written.
    async fn mutate_mailing<F>(&self, id: Ulid, f: F) -> Result<bool, EngineError>
    where
        F: FnOnce(&Mailing) -> Option<Event>,
    {
        let _gate = self.commit_gate.read().await;
        let state = self.get_mailing_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = state.write().await;
        let Some(event) = f(&guard.mailing) else {
            return Ok(false);
        };
        self.persist_mailing(&mut guard, &event).await?;
        Ok(true)
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }
        for entry in self.notifications.iter() {
            events.extend(entry.value().iter().map(|n| Event::NotificationRecorded {
                notification: n.clone(),
            }));
        }
        let mailings: Vec<_> = self.mailings.iter().map(|e| e.value().clone()).collect();
        for state in mailings {
            let guard = state.read().await;
            events.push(Event::MailingCreated {
                mailing: guard.mailing.clone(),
            });
            events.extend(guard.subscriptions.values().map(|s| Event::SubscriptionSet {
                subscription: s.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
