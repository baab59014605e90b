use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability;
use super::conflict::validate_range;
use super::mutations::reminder_due;
use super::{Engine, EngineError};

impl Engine {
    // ── Reservations ─────────────────────────────────────────

    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        for _ in 0..super::MAX_RESOLVE_ATTEMPTS {
            let resource_id = self.reservation_resource(id)?;
            let rs = self.get_resource(&resource_id)?;
            let guard = rs.read().await;
            if let Some(r) = guard.get(*id) {
                return Some(r.clone());
            }
        }
        None
    }

    /// Every reservation on a vehicle, any status, ordered by start.
    pub async fn reservations_for_resource(&self, resource_id: &Ulid) -> Vec<Reservation> {
        let Some(rs) = self.get_resource(resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard.reservations.clone()
    }

    pub async fn reservations_for_client(&self, client_id: &Ulid) -> Vec<Reservation> {
        let mut out = Vec::new();
        for rs in self.snapshot_resources() {
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().filter(|r| r.client_id == *client_id).cloned());
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    // ── Availability index ───────────────────────────────────

    /// Blocking reservations on the vehicle overlapping `span`, other than `exclude`.
    pub async fn conflicts(
        &self,
        resource_id: &Ulid,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Vec<Reservation> {
        let Some(rs) = self.get_resource(resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .blocking(span)
            .filter(|r| Some(r.id) != exclude)
            .cloned()
            .collect()
    }

    pub async fn is_available(&self, resource_id: &Ulid, start: Ms, end: Ms) -> Result<bool, EngineError> {
        let span = validate_range(start, end)?;
        Ok(self.conflicts(resource_id, &span, None).await.is_empty())
    }

    pub async fn free_windows(&self, resource_id: &Ulid, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        let window = Span::checked(start, end)
            .ok_or_else(|| EngineError::validation(format!("window [{start}, {end}) is empty or inverted")))?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let Some(rs) = self.get_resource(resource_id) else {
            return Ok(vec![window]);
        };
        let guard = rs.read().await;
        Ok(availability::free_windows(&guard, &window))
    }

    /// The subset of `candidates` with no blocking reservation overlapping `[start, end)`.
    /// Input order is kept; duplicates are dropped.
    pub async fn filter_available(
        &self,
        candidates: &[Ulid],
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Ulid>, EngineError> {
        if candidates.len() > MAX_FILTER_RESOURCES {
            return Err(EngineError::LimitExceeded("too many candidate resources"));
        }
        let span = validate_range(start, end)?;
        let mut free = Vec::with_capacity(candidates.len());
        for id in candidates {
            if free.contains(id) {
                continue;
            }
            if self.conflicts(id, &span, None).await.is_empty() {
                free.push(*id);
            }
        }
        Ok(free)
    }

    // ── Background scans ─────────────────────────────────────

    /// Confirmed trips whose range has fully elapsed.
    pub async fn collect_finished(&self, now: Ms) -> Vec<Ulid> {
        let mut done = Vec::new();
        for rs in self.snapshot_resources() {
            let guard = rs.read().await;
            done.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.status == ReservationStatus::Confirmed && r.span.end <= now)
                    .map(|r| r.id),
            );
        }
        done
    }

    /// Blocking, not yet reminded, starting within `[now, now + window]`.
    pub async fn reminder_candidates(&self, now: Ms, window: Ms) -> Vec<Reservation> {
        let mut due = Vec::new();
        for rs in self.snapshot_resources() {
            let guard = rs.read().await;
            due.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| reminder_due(r, now, window))
                    .cloned(),
            );
        }
        due.sort_by_key(|r| (r.span.start, r.id));
        due
    }

    pub fn notifications_for(&self, reservation_id: &Ulid) -> Vec<Notification> {
        self.notifications
            .get(reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Mailings ─────────────────────────────────────────────

    pub async fn get_mailing(&self, id: &Ulid) -> Option<Mailing> {
        let state = self.get_mailing_state(id)?;
        let guard = state.read().await;
        Some(guard.mailing.clone())
    }

    pub async fn list_mailings(&self) -> Vec<Mailing> {
        let states: Vec<_> = self.mailings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for state in states {
            let guard = state.read().await;
            out.push(guard.mailing.clone());
        }
        out.sort_by_key(|m| (m.send_time, m.id));
        out
    }

    /// Unsent mailings; used to re-arm jobs after a restart.
    pub async fn pending_mailings(&self) -> Vec<Mailing> {
        let mut all = self.list_mailings().await;
        all.retain(|m| !m.is_sent);
        all
    }

    /// Distinct emails of users currently opted in to the mailing, in user-id order.
    /// An address shared by several users appears once, at its first position.
    pub async fn active_subscribers(&self, mailing_id: &Ulid) -> Result<Vec<String>, EngineError> {
        let state = self
            .get_mailing_state(mailing_id)
            .ok_or(EngineError::NotFound(*mailing_id))?;
        let guard = state.read().await;
        let mut seen = HashSet::new();
        Ok(guard
            .subscriptions
            .values()
            .filter(|s| s.subscribed && seen.insert(s.email.as_str()))
            .map(|s| s.email.clone())
            .collect())
    }

    pub async fn subscription(&self, mailing_id: &Ulid, user_id: &Ulid) -> Option<Subscription> {
        let state = self.get_mailing_state(mailing_id)?;
        let guard = state.read().await;
        guard.subscriptions.get(user_id).cloned()
    }

    fn snapshot_resources(&self) -> Vec<super::SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }
}
