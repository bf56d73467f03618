use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use reqwest::Method;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use booking_cell::models::{Booking, BookingStatus, SosBookingRequest};
use booking_cell::{BookingLifecycleService, BookingService};
use shared_config::AppConfig;
use shared_database::StoreClient;
use shared_gateways::{
    DistanceProvider, HaversineDistanceProvider, NotificationGateway, StoreNotificationGateway,
};

use crate::models::{
    Clinic, ClinicResponseRequest, MatchOutcome, MatchSession, MatchStatus, SosError,
    SosMatchRequest, SosMatchResponse, SosStatusEvent, SweepSummary,
};
use crate::services::events::SosEventChannel;
use crate::services::lease::BookingLease;
use crate::services::session::SosSessionRepository;

const NO_CLINICS_MESSAGE: &str = "No emergency clinics are available near you right now";
const ALL_DECLINED_MESSAGE: &str = "No clinic could take this emergency right now";
const SESSION_EXPIRED_MESSAGE: &str = "The emergency request expired before any clinic responded";
const OWNER_CANCELLED_MESSAGE: &str = "Cancelled by the pet owner";
const CONTACTING_FIRST_MESSAGE: &str = "Contacting the nearest clinic";
const CONTACTING_NEXT_MESSAGE: &str = "Contacting the next clinic";

/// Knobs for candidate search and escalation timing, lifted off the
/// environment config once at startup.
#[derive(Debug, Clone, Copy)]
pub struct MatchSettings {
    pub search_radius_km: f64,
    pub max_candidates: usize,
    pub confirm_timeout_secs: i64,
}

impl MatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            search_radius_km: config.sos_search_radius_km,
            max_candidates: config.sos_max_candidates,
            confirm_timeout_secs: config.sos_confirm_timeout_secs,
        }
    }
}

enum SweepAction {
    Escalated,
    Cancelled,
    Raced,
    Waiting,
}

// ==============================================================================
// SOS MATCH SERVICE
// ==============================================================================

/// Walks an emergency booking down the ranked clinic list until one clinic
/// accepts or the list runs out. Every step that mutates the booking runs
/// under that booking's lease.
pub struct SosMatchService {
    store: Arc<StoreClient>,
    gateway: Arc<dyn NotificationGateway>,
    bookings: BookingService,
    lifecycle: BookingLifecycleService,
    distance: Arc<dyn DistanceProvider>,
    sessions: Arc<dyn SosSessionRepository>,
    lease: Arc<dyn BookingLease>,
    events: Arc<SosEventChannel>,
    settings: MatchSettings,
}

impl SosMatchService {
    pub fn new(
        config: &AppConfig,
        sessions: Arc<dyn SosSessionRepository>,
        lease: Arc<dyn BookingLease>,
        events: Arc<SosEventChannel>,
    ) -> Self {
        let store = Arc::new(StoreClient::new(config));
        let gateway: Arc<dyn NotificationGateway> =
            Arc::new(StoreNotificationGateway::new(store.clone()));
        let distance: Arc<dyn DistanceProvider> = Arc::new(HaversineDistanceProvider);
        Self::with_parts(
            store,
            gateway,
            distance,
            sessions,
            lease,
            events,
            MatchSettings::from_config(config),
        )
    }

    pub fn with_parts(
        store: Arc<StoreClient>,
        gateway: Arc<dyn NotificationGateway>,
        distance: Arc<dyn DistanceProvider>,
        sessions: Arc<dyn SosSessionRepository>,
        lease: Arc<dyn BookingLease>,
        events: Arc<SosEventChannel>,
        settings: MatchSettings,
    ) -> Self {
        Self {
            bookings: BookingService::with_parts(store.clone(), gateway.clone()),
            lifecycle: BookingLifecycleService::with_parts(
                store.clone(),
                gateway.clone(),
                distance.clone(),
            ),
            store,
            gateway,
            distance,
            sessions,
            lease,
            events,
            settings,
        }
    }

    // ===== MATCHING LIFECYCLE =====

    /// Create the emergency booking and start walking the ranked clinic
    /// list. One active SOS per owner; a second request is rejected.
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    pub async fn start_matching(
        &self,
        request: SosMatchRequest,
    ) -> Result<SosMatchResponse, SosError> {
        if let Some(existing) = self.bookings.active_sos_for_owner(request.owner_id).await? {
            return Err(SosError::Conflict(format!(
                "Emergency booking {} is already in progress for this owner",
                existing.booking_code
            )));
        }

        let candidates = self
            .rank_clinics(request.latitude, request.longitude)
            .await?;
        let booking_request = SosBookingRequest {
            owner_id: request.owner_id,
            pet_id: request.pet_id,
            address: request.address,
            latitude: request.latitude,
            longitude: request.longitude,
            symptoms: request.symptoms,
        };

        if candidates.is_empty() {
            warn!(
                "No SOS candidates within {} km for owner {}",
                self.settings.search_radius_km, booking_request.owner_id
            );
            let booking = self
                .bookings
                .create_sos_booking(&booking_request, BookingStatus::Cancelled)
                .await?;
            self.record_cancellation_reason(booking.id, NO_CLINICS_MESSAGE)
                .await;
            self.events
                .publish(&SosStatusEvent {
                    booking_id: booking.id,
                    status: BookingStatus::Cancelled,
                    clinic_id: None,
                    clinic_name: None,
                    message: Some(NO_CLINICS_MESSAGE.to_string()),
                })
                .await;
            return Ok(SosMatchResponse {
                booking,
                candidates: 0,
                message: NO_CLINICS_MESSAGE.to_string(),
            });
        }

        let booking = self
            .bookings
            .create_sos_booking(&booking_request, BookingStatus::PendingClinicConfirm)
            .await?;

        let now = Utc::now();
        let session = MatchSession {
            clinic_ids: candidates.iter().map(|clinic| clinic.id).collect(),
            index: 0,
            created_at: now,
            notified_at: now,
        };
        // If this save fails the booking is left session-less in
        // PENDING_CLINIC_CONFIRM and the timeout sweep cancels it.
        self.sessions.save(booking.id, &session).await?;

        let first = &candidates[0];
        self.offer_to(first.id, Some(first.name.clone()), &booking, CONTACTING_FIRST_MESSAGE)
            .await;

        info!(
            "SOS matching started for booking {} with {} candidate clinics",
            booking.booking_code,
            candidates.len()
        );
        Ok(SosMatchResponse {
            message: format!(
                "Contacting {} nearby clinics, nearest first",
                candidates.len()
            ),
            candidates: candidates.len(),
            booking,
        })
    }

    /// Apply a clinic's accept or decline. Runs under the booking lease so
    /// a racing timeout sweep cannot double-advance the clinic list.
    #[instrument(skip(self, request), fields(clinic_id = %request.clinic_id, accept = request.accept))]
    pub async fn process_confirmation(
        &self,
        booking_id: Uuid,
        request: ClinicResponseRequest,
    ) -> Result<MatchOutcome, SosError> {
        if !self.lease.acquire(booking_id).await? {
            info!(
                "Booking {} is already being updated, ignoring clinic response",
                booking_id
            );
            return Ok(MatchOutcome::AlreadyHandled);
        }
        let outcome = self.respond_locked(booking_id, &request).await;
        self.release_lease(booking_id).await;
        outcome
    }

    /// Escalate every booking whose current clinic has been silent past the
    /// confirmation window. Each booking advances under its lease, so a
    /// clinic response landing mid-sweep wins or loses cleanly, never both.
    #[instrument(skip(self))]
    pub async fn check_timeouts(&self) -> Result<SweepSummary, SosError> {
        let pending = self.bookings.list_awaiting_clinic_confirm().await?;
        let mut summary = SweepSummary {
            examined: pending.len(),
            ..SweepSummary::default()
        };

        for booking in pending {
            match self.sweep_booking(&booking).await {
                Ok(SweepAction::Escalated) => summary.escalated += 1,
                Ok(SweepAction::Cancelled) => summary.cancelled += 1,
                Ok(SweepAction::Raced) => summary.raced += 1,
                Ok(SweepAction::Waiting) => {}
                Err(e) => {
                    error!(
                        "Timeout sweep failed for booking {}: {}",
                        booking.booking_code, e
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Owner withdraws the emergency request while it is still unassigned.
    #[instrument(skip(self))]
    pub async fn cancel_matching(
        &self,
        booking_id: Uuid,
        owner_id: Uuid,
    ) -> Result<MatchOutcome, SosError> {
        let booking = self.lifecycle.fetch(booking_id).await?;
        ensure_owner(&booking, owner_id, "cancel")?;
        ensure_awaiting_clinic(&booking, "cancel_matching")?;

        if !self.lease.acquire(booking_id).await? {
            info!(
                "Booking {} is already being updated, owner cancel not applied",
                booking_id
            );
            return Ok(MatchOutcome::AlreadyHandled);
        }
        let outcome = self.cancel_locked(booking_id).await;
        self.release_lease(booking_id).await;
        outcome
    }

    /// Where matching stands right now. Read-only; a terminal booking gets
    /// the same answer on every call.
    pub async fn get_matching_status(
        &self,
        booking_id: Uuid,
        owner_id: Uuid,
    ) -> Result<MatchStatus, SosError> {
        let booking = self.lifecycle.fetch(booking_id).await?;
        ensure_owner(&booking, owner_id, "view")?;

        let session = if booking.status == BookingStatus::PendingClinicConfirm {
            self.sessions.load(booking_id).await?
        } else {
            None
        };
        let (clinic_id, position, candidates) = match &session {
            Some(session) => (
                session.current_clinic(),
                Some(session.index + 1),
                Some(session.clinic_ids.len()),
            ),
            None => (None, None, None),
        };

        Ok(MatchStatus {
            booking,
            clinic_id,
            position,
            candidates,
        })
    }

    pub async fn get_active_sos_booking(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<Booking>, SosError> {
        Ok(self.bookings.active_sos_for_owner(owner_id).await?)
    }

    // ===== LOCKED STEPS =====

    async fn respond_locked(
        &self,
        booking_id: Uuid,
        request: &ClinicResponseRequest,
    ) -> Result<MatchOutcome, SosError> {
        let booking = self.lifecycle.fetch(booking_id).await?;
        ensure_awaiting_clinic(&booking, "process_confirmation")?;

        let Some(session) = self.sessions.load(booking_id).await? else {
            warn!(
                "No match session left for booking {}, cancelling",
                booking.booking_code
            );
            let cancelled = self
                .cancel_unmatched(&booking, SESSION_EXPIRED_MESSAGE, "system")
                .await?;
            return Ok(MatchOutcome::Cancelled(cancelled));
        };

        let Some(current) = session.current_clinic() else {
            let cancelled = self
                .cancel_unmatched(&booking, ALL_DECLINED_MESSAGE, "system")
                .await?;
            return Ok(MatchOutcome::Cancelled(cancelled));
        };
        if request.clinic_id != current {
            return Err(SosError::Conflict(
                "A different clinic currently holds this offer".to_string(),
            ));
        }

        if request.accept {
            self.accept_offer(&booking, request).await
        } else {
            info!(
                "Clinic {} declined booking {} ({})",
                request.clinic_id,
                booking.booking_code,
                request.reason.as_deref().unwrap_or("no reason given")
            );
            self.escalate(&booking, &session).await
        }
    }

    async fn accept_offer(
        &self,
        booking: &Booking,
        request: &ClinicResponseRequest,
    ) -> Result<MatchOutcome, SosError> {
        let clinic = self.fetch_clinic(request.clinic_id).await;

        let mut extra = json!({ "clinic_id": request.clinic_id });
        if let Some(staff_id) = request.staff_id {
            extra["staff_id"] = json!(staff_id);
        }
        if let (Some(clinic), Some(lat), Some(lng)) =
            (clinic.as_ref(), booking.latitude, booking.longitude)
        {
            let km = self
                .distance
                .distance_km(lat, lng, clinic.latitude, clinic.longitude)
                .await;
            extra["distance_km"] = json!(km);
        }
        let confirmed = self
            .lifecycle
            .transition(
                booking,
                "accept_sos_offer",
                &[BookingStatus::PendingClinicConfirm],
                BookingStatus::Confirmed,
                extra,
            )
            .await?;

        if let Err(e) = self.sessions.delete(booking.id).await {
            warn!(
                "Could not delete match session for booking {}: {}",
                booking.id, e
            );
        }

        let clinic_name = clinic.map(|clinic| clinic.name);
        info!(
            "Clinic {} accepted SOS booking {}",
            request.clinic_id, confirmed.booking_code
        );
        self.events
            .publish(&SosStatusEvent {
                booking_id: confirmed.id,
                status: BookingStatus::Confirmed,
                clinic_id: Some(request.clinic_id),
                message: Some(match &clinic_name {
                    Some(name) => format!("{} accepted your emergency request", name),
                    None => "A clinic accepted your emergency request".to_string(),
                }),
                clinic_name,
            })
            .await;
        self.events.remove_channel(confirmed.id).await;

        Ok(MatchOutcome::Confirmed(confirmed))
    }

    /// Move the offer to the next clinic, or cancel when the list runs
    /// out. Running out of clinics is a normal outcome, not an error.
    async fn escalate(
        &self,
        booking: &Booking,
        session: &MatchSession,
    ) -> Result<MatchOutcome, SosError> {
        let next_index = session.index + 1;
        if next_index >= session.clinic_ids.len() {
            let cancelled = self
                .cancel_unmatched(booking, ALL_DECLINED_MESSAGE, "system")
                .await?;
            return Ok(MatchOutcome::Cancelled(cancelled));
        }

        let advanced = MatchSession {
            index: next_index,
            notified_at: Utc::now(),
            ..session.clone()
        };
        self.sessions.save(booking.id, &advanced).await?;

        let next_clinic = advanced.clinic_ids[next_index];
        let clinic_name = self.fetch_clinic(next_clinic).await.map(|clinic| clinic.name);
        self.offer_to(next_clinic, clinic_name, booking, CONTACTING_NEXT_MESSAGE)
            .await;
        info!(
            "Escalated booking {} to clinic {} ({} of {})",
            booking.booking_code,
            next_clinic,
            next_index + 1,
            advanced.clinic_ids.len()
        );
        Ok(MatchOutcome::Escalated {
            clinic_id: next_clinic,
        })
    }

    async fn sweep_booking(&self, booking: &Booking) -> Result<SweepAction, SosError> {
        // Cheap pre-check before taking the lease.
        if let Some(session) = self.sessions.load(booking.id).await? {
            if !self.offer_timed_out(&session) {
                return Ok(SweepAction::Waiting);
            }
        }

        if !self.lease.acquire(booking.id).await? {
            debug!("Booking {} is being updated elsewhere, skipping", booking.id);
            return Ok(SweepAction::Raced);
        }
        let action = self.sweep_locked(booking.id).await;
        self.release_lease(booking.id).await;
        action
    }

    async fn sweep_locked(&self, booking_id: Uuid) -> Result<SweepAction, SosError> {
        // Everything is re-read under the lease; the pre-check can be stale.
        let booking = self.lifecycle.fetch(booking_id).await?;
        if booking.status != BookingStatus::PendingClinicConfirm {
            return Ok(SweepAction::Waiting);
        }

        let Some(session) = self.sessions.load(booking_id).await? else {
            self.cancel_unmatched(&booking, SESSION_EXPIRED_MESSAGE, "system")
                .await?;
            return Ok(SweepAction::Cancelled);
        };
        if !self.offer_timed_out(&session) {
            return Ok(SweepAction::Waiting);
        }

        warn!(
            "Clinic {:?} did not answer for booking {} within {}s",
            session.current_clinic(),
            booking.booking_code,
            self.settings.confirm_timeout_secs
        );
        match self.escalate(&booking, &session).await? {
            MatchOutcome::Cancelled(_) => Ok(SweepAction::Cancelled),
            _ => Ok(SweepAction::Escalated),
        }
    }

    async fn cancel_locked(&self, booking_id: Uuid) -> Result<MatchOutcome, SosError> {
        let booking = self.lifecycle.fetch(booking_id).await?;
        ensure_awaiting_clinic(&booking, "cancel_matching")?;
        let cancelled = self
            .cancel_unmatched(&booking, OWNER_CANCELLED_MESSAGE, "owner")
            .await?;
        Ok(MatchOutcome::Cancelled(cancelled))
    }

    // ===== SHARED PIECES =====

    async fn cancel_unmatched(
        &self,
        booking: &Booking,
        message: &str,
        cancelled_by: &str,
    ) -> Result<Booking, SosError> {
        let cancelled = self
            .lifecycle
            .transition(
                booking,
                "cancel_sos_matching",
                &[BookingStatus::PendingClinicConfirm],
                BookingStatus::Cancelled,
                json!({ "cancellation_reason": message, "cancelled_by": cancelled_by }),
            )
            .await?;

        if let Err(e) = self.sessions.delete(booking.id).await {
            warn!(
                "Could not delete match session for booking {}: {}",
                booking.id, e
            );
        }

        info!("SOS booking {} cancelled: {}", cancelled.booking_code, message);
        self.events
            .publish(&SosStatusEvent {
                booking_id: cancelled.id,
                status: BookingStatus::Cancelled,
                clinic_id: None,
                clinic_name: None,
                message: Some(message.to_string()),
            })
            .await;
        self.events.remove_channel(cancelled.id).await;

        Ok(cancelled)
    }

    /// Notify the clinic and mirror the offer on the event channels.
    async fn offer_to(
        &self,
        clinic_id: Uuid,
        clinic_name: Option<String>,
        booking: &Booking,
        message: &str,
    ) {
        self.gateway.notify_sos_offer(clinic_id, &booking.notice()).await;
        self.events
            .publish(&SosStatusEvent {
                booking_id: booking.id,
                status: BookingStatus::PendingClinicConfirm,
                clinic_id: Some(clinic_id),
                clinic_name,
                message: Some(message.to_string()),
            })
            .await;
    }

    /// Active SOS-accepting clinics within the search radius, nearest
    /// first, capped at `max_candidates`.
    async fn rank_clinics(&self, latitude: f64, longitude: f64) -> Result<Vec<Clinic>, SosError> {
        let clinics: Vec<Clinic> = self
            .store
            .request(
                Method::GET,
                "/rest/v1/clinics?is_active=eq.true&accepts_sos=eq.true",
                None,
            )
            .await?;

        let measured = join_all(clinics.into_iter().map(|clinic| {
            let distance = self.distance.clone();
            async move {
                let km = distance
                    .distance_km(latitude, longitude, clinic.latitude, clinic.longitude)
                    .await;
                (clinic, km)
            }
        }))
        .await;

        let mut in_range: Vec<(Clinic, f64)> = measured
            .into_iter()
            .filter(|(_, km)| *km <= self.settings.search_radius_km)
            .collect();
        in_range.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        in_range.truncate(self.settings.max_candidates);

        Ok(in_range.into_iter().map(|(clinic, _)| clinic).collect())
    }

    async fn fetch_clinic(&self, clinic_id: Uuid) -> Option<Clinic> {
        let result: Result<Vec<Clinic>, _> = self
            .store
            .request(
                Method::GET,
                &format!("/rest/v1/clinics?id=eq.{}", clinic_id),
                None,
            )
            .await;
        match result {
            Ok(mut rows) => rows.pop(),
            Err(e) => {
                warn!("Could not look up clinic {}: {}", clinic_id, e);
                None
            }
        }
    }

    /// The booking is already terminal here, so losing the annotation only
    /// loses the reason text.
    async fn record_cancellation_reason(&self, booking_id: Uuid, message: &str) {
        let body = json!({
            "cancellation_reason": message,
            "cancelled_by": "system",
            "updated_at": Utc::now().to_rfc3339(),
        });
        let result = self
            .store
            .request::<serde_json::Value>(
                Method::PATCH,
                &format!("/rest/v1/bookings?id=eq.{}", booking_id),
                Some(body),
            )
            .await;
        if let Err(e) = result {
            warn!(
                "Could not record cancellation reason on booking {}: {}",
                booking_id, e
            );
        }
    }

    async fn release_lease(&self, booking_id: Uuid) {
        if let Err(e) = self.lease.release(booking_id).await {
            warn!(
                "Failed to release matching lease for booking {}: {}",
                booking_id, e
            );
        }
    }

    fn offer_timed_out(&self, session: &MatchSession) -> bool {
        (Utc::now() - session.notified_at).num_seconds() > self.settings.confirm_timeout_secs
    }
}

fn ensure_owner(booking: &Booking, owner_id: Uuid, verb: &str) -> Result<(), SosError> {
    if booking.owner_id != owner_id {
        return Err(SosError::Security(format!(
            "Only the requesting owner can {} this emergency booking",
            verb
        )));
    }
    Ok(())
}

fn ensure_awaiting_clinic(booking: &Booking, action: &'static str) -> Result<(), SosError> {
    if booking.status != BookingStatus::PendingClinicConfirm {
        return Err(SosError::State {
            action,
            required: BookingStatus::PendingClinicConfirm.to_string(),
            actual: booking.status,
        });
    }
    Ok(())
}
