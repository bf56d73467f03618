use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::{ConflictKind, StoreClient, StoreError};
use shared_gateways::{NotificationGateway, StoreNotificationGateway};
use staff_cell::models::{AvailabilityRequest, Specialty, StaffCandidate};
use staff_cell::AvailabilityService;

use crate::models::{
    Booking, BookingError, BookingServiceItem, BookingStatus, BookingType, BookingWithServices,
    CancelBookingRequest, CreateBookingRequest, ServiceCatalogItem, SosBookingRequest,
};
use crate::services::codes::BookingCodeAllocator;
use crate::services::representation_headers;

/// Total insert attempts when the proposed booking code collides. Any other
/// conflict surfaces immediately.
pub const MAX_CODE_ATTEMPTS: u32 = 3;

const SLOT_MINUTES: i64 = 30;

pub struct BookingService {
    store: Arc<StoreClient>,
    gateway: Arc<dyn NotificationGateway>,
    availability: AvailabilityService,
    codes: BookingCodeAllocator,
}

impl BookingService {
    pub fn new(config: &AppConfig) -> Self {
        let store = Arc::new(StoreClient::new(config));
        let gateway = Arc::new(StoreNotificationGateway::new(store.clone()));
        Self::with_parts(store, gateway)
    }

    pub fn with_parts(store: Arc<StoreClient>, gateway: Arc<dyn NotificationGateway>) -> Self {
        Self {
            availability: AvailabilityService::with_store(store.clone()),
            codes: BookingCodeAllocator::new(store.clone()),
            store,
            gateway,
        }
    }

    /// Books a contiguous run of slots with one staff member for the whole
    /// service set. The creation notice goes out only after everything is
    /// committed.
    pub async fn create_booking(
        &self,
        request: CreateBookingRequest,
    ) -> Result<BookingWithServices, BookingError> {
        validate_create(&request)?;

        let catalog = self.fetch_services(&request.service_ids).await?;
        let specialty = shared_specialty(&catalog)?;
        let slots_needed = slots_for_duration(total_duration_minutes(&catalog));

        let candidate = self.pick_staff(&request, specialty, slots_needed).await?;
        let window = candidate
            .start_time
            .zip(candidate.end_time)
            .ok_or_else(|| BookingError::Database("Candidate is missing its slot window".to_string()))?;

        debug!(
            "Booking {} slots with staff {} starting {}",
            slots_needed, candidate.staff.id, window.0
        );

        let booking_row = json!({
            "owner_id": request.owner_id,
            "pet_id": request.pet_id,
            "clinic_id": request.clinic_id,
            "staff_id": candidate.staff.id,
            "booking_type": request.booking_type,
            "status": BookingStatus::Pending,
            "total_price": total_price(&catalog),
            "scheduled_start": window.0.to_rfc3339(),
            "scheduled_end": window.1.to_rfc3339(),
            "address": request.address,
            "latitude": request.latitude,
            "longitude": request.longitude,
            "notes": request.notes,
        });
        let booking = self
            .insert_with_code(booking_row, Some(request.clinic_id), request.date)
            .await?;

        let services = match self.snapshot_services(&booking, &catalog).await {
            Ok(services) => services,
            Err(e) => {
                self.rollback_booking(&booking).await;
                return Err(e);
            }
        };
        if let Err(e) = self.reserve_slots(&booking, &candidate.slot_ids).await {
            self.rollback_booking(&booking).await;
            return Err(e);
        }

        info!("Created booking {} ({})", booking.booking_code, booking.id);
        self.gateway.notify_booking_created(&booking.notice()).await;

        Ok(BookingWithServices { booking, services })
    }

    /// Inserts an emergency booking with no clinic, staff or schedule. The
    /// dispatch flow owns everything past this point.
    pub async fn create_sos_booking(
        &self,
        request: &SosBookingRequest,
        status: BookingStatus,
    ) -> Result<Booking, BookingError> {
        if request.address.trim().is_empty() {
            return Err(BookingError::Validation(
                "An emergency booking needs a street address".to_string(),
            ));
        }

        let booking_row = json!({
            "owner_id": request.owner_id,
            "pet_id": request.pet_id,
            "clinic_id": null,
            "staff_id": null,
            "booking_type": BookingType::Sos,
            "status": status,
            "total_price": 0.0,
            "scheduled_start": null,
            "scheduled_end": null,
            "address": request.address,
            "latitude": request.latitude,
            "longitude": request.longitude,
            "symptoms": request.symptoms,
        });
        self.insert_with_code(booking_row, None, Utc::now().date_naive())
            .await
    }

    /// Cancels while still PENDING or CONFIRMED, recording who and why, and
    /// hands the reserved slots back.
    pub async fn cancel_booking(
        &self,
        booking_id: Uuid,
        request: CancelBookingRequest,
    ) -> Result<Booking, BookingError> {
        if request.reason.trim().is_empty() {
            return Err(BookingError::Validation(
                "A cancellation reason is required".to_string(),
            ));
        }

        let booking = self.get_booking(booking_id).await?;
        let cancellable = [BookingStatus::Pending, BookingStatus::Confirmed];
        if !cancellable.contains(&booking.status) {
            return Err(BookingError::State {
                action: "cancel_booking",
                required: "PENDING or CONFIRMED".to_string(),
                actual: booking.status,
            });
        }

        let updated: Vec<Booking> = self
            .store
            .request_with_headers(
                Method::PATCH,
                &format!(
                    "/rest/v1/bookings?id=eq.{}&status=in.(PENDING,CONFIRMED)",
                    booking_id
                ),
                Some(json!({
                    "status": BookingStatus::Cancelled,
                    "cancellation_reason": request.reason,
                    "cancelled_by": request.cancelled_by,
                    "updated_at": Utc::now().to_rfc3339(),
                })),
                Some(representation_headers()),
            )
            .await?;
        let cancelled = updated.into_iter().next().ok_or_else(|| {
            BookingError::Conflict(ConflictKind::Other(
                "Booking changed state concurrently".to_string(),
            ))
        })?;

        self.release_slots(booking_id).await;
        info!(
            "Cancelled booking {} by {}: {}",
            cancelled.booking_code, request.cancelled_by, request.reason
        );

        Ok(cancelled)
    }

    pub async fn get_booking(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        let rows: Vec<Booking> = self
            .store
            .request(Method::GET, &format!("/rest/v1/bookings?id=eq.{}", booking_id), None)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BookingError::NotFound("Booking".to_string()))
    }

    pub async fn get_booking_with_services(
        &self,
        booking_id: Uuid,
    ) -> Result<BookingWithServices, BookingError> {
        let booking = self.get_booking(booking_id).await?;
        let services: Vec<BookingServiceItem> = self
            .store
            .request(
                Method::GET,
                &format!("/rest/v1/booking_services?booking_id=eq.{}", booking_id),
                None,
            )
            .await?;
        Ok(BookingWithServices { booking, services })
    }

    pub async fn get_booking_by_code(&self, code: &str) -> Result<Booking, BookingError> {
        let rows: Vec<Booking> = self
            .store
            .request(
                Method::GET,
                &format!("/rest/v1/bookings?booking_code=eq.{}", code),
                None,
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BookingError::NotFound("Booking".to_string()))
    }

    pub async fn list_owner_bookings(&self, owner_id: Uuid) -> Result<Vec<Booking>, BookingError> {
        let rows: Vec<Booking> = self
            .store
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/bookings?owner_id=eq.{}&order=created_at.desc",
                    owner_id
                ),
                None,
            )
            .await?;
        Ok(rows)
    }

    /// The one emergency booking an owner may have in flight, if any.
    pub async fn active_sos_for_owner(&self, owner_id: Uuid) -> Result<Option<Booking>, BookingError> {
        let rows: Vec<Booking> = self
            .store
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/bookings?owner_id=eq.{}&booking_type=eq.SOS&status=in.(PENDING_CLINIC_CONFIRM,CONFIRMED,ASSIGNED,ON_THE_WAY,IN_PROGRESS)&limit=1",
                    owner_id
                ),
                None,
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Emergency bookings still waiting on a clinic answer; the timeout sweep
    /// walks this list.
    pub async fn list_awaiting_clinic_confirm(&self) -> Result<Vec<Booking>, BookingError> {
        let rows: Vec<Booking> = self
            .store
            .request(
                Method::GET,
                "/rest/v1/bookings?booking_type=eq.SOS&status=eq.PENDING_CLINIC_CONFIRM&order=created_at.asc",
                None,
            )
            .await?;
        Ok(rows)
    }

    async fn pick_staff(
        &self,
        request: &CreateBookingRequest,
        specialty: Specialty,
        slots_needed: usize,
    ) -> Result<StaffCandidate, BookingError> {
        let search = AvailabilityRequest {
            clinic_id: request.clinic_id,
            date: request.date,
            start_time: request.start_time,
            specialty,
            slots_needed,
            exclude_staff_id: None,
        };
        let candidates = self.availability.find_available_staff(&search).await?;

        let chosen = match request.staff_id {
            Some(pinned) => candidates
                .into_iter()
                .find(|c| c.staff.id == pinned && c.available),
            None => candidates.into_iter().find(|c| c.available),
        };
        chosen.ok_or(BookingError::NoAvailability)
    }

    /// Insert with code retry. Only a booking-code collision re-enters the
    /// loop; a pet-overlap or any other conflict is a real answer and
    /// surfaces at once.
    async fn insert_with_code(
        &self,
        mut booking_row: Value,
        clinic_id: Option<Uuid>,
        date: chrono::NaiveDate,
    ) -> Result<Booking, BookingError> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = self.codes.next_code(clinic_id, date, attempt).await?;
            booking_row["booking_code"] = json!(code);
            booking_row["created_at"] = json!(Utc::now().to_rfc3339());
            booking_row["updated_at"] = json!(Utc::now().to_rfc3339());

            let result: Result<Vec<Booking>, StoreError> = self
                .store
                .request_with_headers(
                    Method::POST,
                    "/rest/v1/bookings",
                    Some(booking_row.clone()),
                    Some(representation_headers()),
                )
                .await;

            match result {
                Ok(rows) => {
                    return rows.into_iter().next().ok_or_else(|| {
                        BookingError::Database("Failed to create booking".to_string())
                    });
                }
                Err(StoreError::Conflict(ConflictKind::BookingCode)) => {
                    warn!(
                        "Booking code {} collided (attempt {}/{})",
                        code, attempt, MAX_CODE_ATTEMPTS
                    );
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }

        warn!("Gave up allocating a booking code after {} attempts", MAX_CODE_ATTEMPTS);
        Err(BookingError::CodeAllocationFailed)
    }

    async fn fetch_services(
        &self,
        service_ids: &[Uuid],
    ) -> Result<Vec<ServiceCatalogItem>, BookingError> {
        let ids: Vec<String> = service_ids.iter().map(|id| id.to_string()).collect();
        let rows: Vec<ServiceCatalogItem> = self
            .store
            .request(
                Method::GET,
                &format!("/rest/v1/services?id=in.({})", ids.join(",")),
                None,
            )
            .await?;

        if rows.len() != service_ids.len() {
            return Err(BookingError::NotFound("Service".to_string()));
        }
        Ok(rows)
    }

    async fn snapshot_services(
        &self,
        booking: &Booking,
        catalog: &[ServiceCatalogItem],
    ) -> Result<Vec<BookingServiceItem>, BookingError> {
        let rows: Vec<Value> = catalog
            .iter()
            .map(|item| {
                json!({
                    "booking_id": booking.id,
                    "service_id": item.id,
                    "name": item.name,
                    "price": item.price,
                    "duration_minutes": item.duration_minutes,
                })
            })
            .collect();

        let saved: Vec<BookingServiceItem> = self
            .store
            .request_with_headers(
                Method::POST,
                "/rest/v1/booking_services",
                Some(Value::Array(rows)),
                Some(representation_headers()),
            )
            .await?;
        Ok(saved)
    }

    /// Links slots to the booking, then flips them to BOOKED. The unique
    /// link constraint is the arbiter when two bookings race for a slot.
    async fn reserve_slots(&self, booking: &Booking, slot_ids: &[Uuid]) -> Result<(), BookingError> {
        let rows: Vec<Value> = slot_ids
            .iter()
            .map(|slot_id| json!({ "booking_id": booking.id, "slot_id": slot_id }))
            .collect();
        let _: Value = self
            .store
            .request(Method::POST, "/rest/v1/booking_slots", Some(Value::Array(rows)))
            .await?;

        let ids: Vec<String> = slot_ids.iter().map(|id| id.to_string()).collect();
        let flipped: Vec<Value> = self
            .store
            .request_with_headers(
                Method::PATCH,
                &format!("/rest/v1/slots?id=in.({})&status=eq.AVAILABLE", ids.join(",")),
                Some(json!({ "status": "BOOKED" })),
                Some(representation_headers()),
            )
            .await?;

        if flipped.len() != slot_ids.len() {
            // Revert only the rows this update actually flipped; the rest
            // were never ours.
            let flipped_ids: Vec<String> = flipped
                .iter()
                .filter_map(|row| row.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if !flipped_ids.is_empty() {
                let reverted: Result<Vec<Value>, StoreError> = self
                    .store
                    .request_with_headers(
                        Method::PATCH,
                        &format!("/rest/v1/slots?id=in.({})", flipped_ids.join(",")),
                        Some(json!({ "status": "AVAILABLE" })),
                        Some(representation_headers()),
                    )
                    .await;
                if let Err(e) = reverted {
                    warn!("Could not revert slots for booking {}: {}", booking.id, e);
                }
            }
            return Err(BookingError::Conflict(ConflictKind::SlotTaken));
        }
        Ok(())
    }

    /// Best-effort compensation when a step after the booking insert fails.
    /// Slot statuses are never touched here; `reserve_slots` reverts its own
    /// flips before reporting failure.
    async fn rollback_booking(&self, booking: &Booking) {
        warn!("Rolling back partially created booking {}", booking.id);

        for path in [
            format!("/rest/v1/booking_slots?booking_id=eq.{}", booking.id),
            format!("/rest/v1/booking_services?booking_id=eq.{}", booking.id),
            format!("/rest/v1/bookings?id=eq.{}", booking.id),
        ] {
            let result: Result<Value, StoreError> =
                self.store.request(Method::DELETE, &path, None).await;
            if let Err(e) = result {
                warn!("Rollback step {} failed for booking {}: {}", path, booking.id, e);
            }
        }
    }

    /// Returns cancelled slots to the open pool. Failures leave slots BOOKED
    /// and are only logged; the booking itself is already cancelled.
    async fn release_slots(&self, booking_id: Uuid) {
        let links: Result<Vec<Value>, StoreError> = self
            .store
            .request(
                Method::GET,
                &format!("/rest/v1/booking_slots?booking_id=eq.{}&select=slot_id", booking_id),
                None,
            )
            .await;
        let slot_ids: Vec<String> = match links {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| row.get("slot_id").and_then(Value::as_str))
                .map(str::to_string)
                .collect(),
            Err(e) => {
                warn!("Could not load slot links for booking {}: {}", booking_id, e);
                return;
            }
        };
        if slot_ids.is_empty() {
            return;
        }

        let deleted: Result<Value, StoreError> = self
            .store
            .request(
                Method::DELETE,
                &format!("/rest/v1/booking_slots?booking_id=eq.{}", booking_id),
                None,
            )
            .await;
        if let Err(e) = deleted {
            warn!("Could not delete slot links for booking {}: {}", booking_id, e);
            return;
        }

        let freed: Result<Vec<Value>, StoreError> = self
            .store
            .request_with_headers(
                Method::PATCH,
                &format!("/rest/v1/slots?id=in.({})&status=eq.BOOKED", slot_ids.join(",")),
                Some(json!({ "status": "AVAILABLE" })),
                Some(representation_headers()),
            )
            .await;
        match freed {
            Ok(rows) => debug!("Released {} slots from booking {}", rows.len(), booking_id),
            Err(e) => warn!("Could not release slots for booking {}: {}", booking_id, e),
        }
    }
}

fn validate_create(request: &CreateBookingRequest) -> Result<(), BookingError> {
    if request.service_ids.is_empty() {
        return Err(BookingError::Validation(
            "At least one service is required".to_string(),
        ));
    }
    if request.booking_type == BookingType::Sos {
        return Err(BookingError::Validation(
            "Emergency bookings go through the SOS flow".to_string(),
        ));
    }
    if request.booking_type == BookingType::HomeVisit
        && request.address.as_deref().map_or(true, |a| a.trim().is_empty())
    {
        return Err(BookingError::Validation(
            "A home visit needs a street address".to_string(),
        ));
    }
    Ok(())
}

fn shared_specialty(catalog: &[ServiceCatalogItem]) -> Result<Specialty, BookingError> {
    let mut specialties = catalog.iter().map(|item| item.specialty);
    let first = specialties
        .next()
        .ok_or_else(|| BookingError::Validation("At least one service is required".to_string()))?;
    if specialties.any(|s| s != first) {
        return Err(BookingError::Validation(
            "All services in one booking must share a specialty".to_string(),
        ));
    }
    Ok(first)
}

fn total_duration_minutes(catalog: &[ServiceCatalogItem]) -> i64 {
    catalog.iter().map(|item| item.duration_minutes).sum()
}

fn total_price(catalog: &[ServiceCatalogItem]) -> f64 {
    catalog.iter().map(|item| item.price).sum()
}

fn slots_for_duration(minutes: i64) -> usize {
    let slots = (minutes + SLOT_MINUTES - 1) / SLOT_MINUTES;
    slots.max(1) as usize
}
