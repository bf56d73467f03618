use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::{ConflictKind, StoreClient};
use shared_gateways::{
    DistanceProvider, HaversineDistanceProvider, NotificationGateway, StoreNotificationGateway,
};

use crate::models::{Booking, BookingError, BookingStatus, OnWayRequest, StaffActionRequest};
use crate::services::representation_headers;

/// Rough door-to-door speed for the ETA estimate on mobile bookings.
const ASSUMED_TRAVEL_SPEED_KMH: f64 = 30.0;

/// Drives a booking through its confirmed service states. Every state flip
/// is guarded twice: checked in memory for a precise error, and filtered on
/// the stored status so a racing writer turns into a clean conflict.
pub struct BookingLifecycleService {
    store: Arc<StoreClient>,
    gateway: Arc<dyn NotificationGateway>,
    distance: Arc<dyn DistanceProvider>,
}

impl BookingLifecycleService {
    pub fn new(config: &AppConfig) -> Self {
        let store = Arc::new(StoreClient::new(config));
        let gateway = Arc::new(StoreNotificationGateway::new(store.clone()));
        Self::with_parts(store, gateway, Arc::new(HaversineDistanceProvider))
    }

    pub fn with_parts(
        store: Arc<StoreClient>,
        gateway: Arc<dyn NotificationGateway>,
        distance: Arc<dyn DistanceProvider>,
    ) -> Self {
        Self { store, gateway, distance }
    }

    /// PENDING -> CONFIRMED, the clinic accepting the request.
    pub async fn confirm(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        let booking = self.fetch(booking_id).await?;
        self.transition(&booking, "confirm_booking", &[BookingStatus::Pending], BookingStatus::Confirmed, Value::Null)
            .await
    }

    /// CONFIRMED -> ASSIGNED with the staff member who will serve it.
    pub async fn assign_staff(
        &self,
        booking_id: Uuid,
        staff_id: Uuid,
    ) -> Result<Booking, BookingError> {
        let booking = self.fetch(booking_id).await?;
        let assigned = self
            .transition(
                &booking,
                "assign_staff",
                &[BookingStatus::Confirmed],
                BookingStatus::Assigned,
                json!({ "staff_id": staff_id }),
            )
            .await?;
        info!("Assigned staff {} to booking {}", staff_id, assigned.booking_code);
        Ok(assigned)
    }

    /// ASSIGNED -> IN_PROGRESS when the assigned staff member starts the
    /// appointment.
    pub async fn check_in(
        &self,
        booking_id: Uuid,
        request: StaffActionRequest,
    ) -> Result<Booking, BookingError> {
        let booking = self.fetch(booking_id).await?;
        ensure_assigned_staff(&booking, request.staff_id)?;

        let updated = self
            .transition(
                &booking,
                "check_in",
                &[BookingStatus::Assigned],
                BookingStatus::InProgress,
                Value::Null,
            )
            .await?;

        self.gateway.notify_check_in(&updated.notice()).await;
        Ok(updated)
    }

    /// IN_PROGRESS -> COMPLETED.
    pub async fn complete(
        &self,
        booking_id: Uuid,
        request: StaffActionRequest,
    ) -> Result<Booking, BookingError> {
        let booking = self.fetch(booking_id).await?;
        ensure_assigned_staff(&booking, request.staff_id)?;

        let updated = self
            .transition(
                &booking,
                "complete_booking",
                &[BookingStatus::InProgress],
                BookingStatus::Completed,
                Value::Null,
            )
            .await?;

        self.gateway.notify_completed(&updated.notice()).await;
        Ok(updated)
    }

    /// Tells the owner their staff member left. Mobile bookings only, and
    /// deliberately NOT a state change: the booking stays ASSIGNED until
    /// check-in.
    pub async fn notify_on_way(
        &self,
        booking_id: Uuid,
        request: OnWayRequest,
    ) -> Result<Option<i64>, BookingError> {
        let booking = self.fetch(booking_id).await?;

        if !booking.booking_type.is_mobile() {
            return Err(BookingError::Validation(format!(
                "On-the-way notices only apply to mobile bookings, this one is {}",
                booking.booking_type
            )));
        }
        if booking.status != BookingStatus::Assigned {
            return Err(BookingError::State {
                action: "notify_on_way",
                required: BookingStatus::Assigned.to_string(),
                actual: booking.status,
            });
        }
        ensure_assigned_staff(&booking, request.staff_id)?;

        let eta_minutes = self.estimate_eta(&booking, &request).await;
        self.gateway.notify_on_way(&booking.notice(), eta_minutes).await;
        debug!(
            "On-the-way notice for booking {} (eta {:?} min)",
            booking.booking_code, eta_minutes
        );

        Ok(eta_minutes)
    }

    /// Guarded status flip. `required` is both the precondition and the
    /// stored-status filter, so a concurrent transition cannot be overwritten.
    pub async fn transition(
        &self,
        booking: &Booking,
        action: &'static str,
        required: &[BookingStatus],
        target: BookingStatus,
        extra: Value,
    ) -> Result<Booking, BookingError> {
        if !required.contains(&booking.status) || !booking.status.can_transition_to(target) {
            return Err(BookingError::State {
                action,
                required: status_list(required),
                actual: booking.status,
            });
        }

        let mut body = Map::new();
        body.insert("status".to_string(), json!(target));
        body.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        if let Value::Object(fields) = extra {
            body.extend(fields);
        }

        let filter: Vec<String> = required.iter().map(BookingStatus::to_string).collect();
        let updated: Vec<Booking> = self
            .store
            .request_with_headers(
                Method::PATCH,
                &format!(
                    "/rest/v1/bookings?id=eq.{}&status=in.({})",
                    booking.id,
                    filter.join(",")
                ),
                Some(Value::Object(body)),
                Some(representation_headers()),
            )
            .await?;

        updated.into_iter().next().ok_or_else(|| {
            warn!("Lost a state race on booking {} during {}", booking.id, action);
            BookingError::Conflict(ConflictKind::Other(
                "Booking changed state concurrently".to_string(),
            ))
        })
    }

    pub async fn fetch(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        let rows: Vec<Booking> = self
            .store
            .request(Method::GET, &format!("/rest/v1/bookings?id=eq.{}", booking_id), None)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BookingError::NotFound("Booking".to_string()))
    }

    async fn estimate_eta(&self, booking: &Booking, request: &OnWayRequest) -> Option<i64> {
        let from = request.latitude.zip(request.longitude)?;
        let to = booking.latitude.zip(booking.longitude)?;
        let km = self.distance.distance_km(from.0, from.1, to.0, to.1).await;
        Some(((km / ASSUMED_TRAVEL_SPEED_KMH) * 60.0).ceil() as i64)
    }
}

fn ensure_assigned_staff(booking: &Booking, staff_id: Uuid) -> Result<(), BookingError> {
    if booking.staff_id != Some(staff_id) {
        return Err(BookingError::Security(
            "Only the assigned staff member can act on this booking".to_string(),
        ));
    }
    Ok(())
}

fn status_list(statuses: &[BookingStatus]) -> String {
    let names: Vec<String> = statuses.iter().map(BookingStatus::to_string).collect();
    names.join(" or ")
}
