use std::sync::Arc;

use chrono::{DateTime, Days, Duration, NaiveTime, Timelike, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::StoreClient;
use shared_gateways::{NotificationGateway, StoreNotificationGateway};

use crate::models::{
    CreateShiftRequest, ScheduleError, Shift, ShiftWithSlots, Slot, SlotStatus, SlotWindow,
    SLOT_MINUTES,
};

/// Owns the shift-to-slot calendar: bulk slot generation at shift creation,
/// shift deletion, and manual slot blocking.
pub struct ShiftScheduleService {
    store: Arc<StoreClient>,
    gateway: Arc<dyn NotificationGateway>,
}

impl ShiftScheduleService {
    pub fn new(config: &AppConfig) -> Self {
        let store = Arc::new(StoreClient::new(config));
        let gateway = Arc::new(StoreNotificationGateway::new(store.clone()));
        Self { store, gateway }
    }

    pub fn with_parts(store: Arc<StoreClient>, gateway: Arc<dyn NotificationGateway>) -> Self {
        Self { store, gateway }
    }

    /// Creates a shift and bulk-inserts its 30-minute slots. Rejects shifts
    /// that overlap another shift of the same staff member on the same date.
    pub async fn create_shift(&self, request: CreateShiftRequest) -> Result<ShiftWithSlots, ScheduleError> {
        debug!("Creating shift for staff {} on {}", request.staff_id, request.work_date);

        validate_shift_times(&request)?;

        let existing = self.staff_shifts_for_date(request.staff_id, &request).await?;
        let requested = minute_interval(request.start_time, request.end_time, request.is_overnight);
        for shift in &existing {
            let other = minute_interval(shift.start_time, shift.end_time, shift.is_overnight);
            if intervals_overlap(requested, other) {
                warn!(
                    "Shift for staff {} on {} overlaps shift {}",
                    request.staff_id, request.work_date, shift.id
                );
                return Err(ScheduleError::ShiftOverlap(request.work_date));
            }
        }

        let shift_data = json!({
            "staff_id": request.staff_id,
            "clinic_id": request.clinic_id,
            "work_date": request.work_date,
            "start_time": request.start_time.format("%H:%M:%S").to_string(),
            "end_time": request.end_time.format("%H:%M:%S").to_string(),
            "break_start": request.break_start.map(|t| t.format("%H:%M:%S").to_string()),
            "break_end": request.break_end.map(|t| t.format("%H:%M:%S").to_string()),
            "is_overnight": request.is_overnight,
            "created_at": Utc::now().to_rfc3339(),
        });

        let rows: Vec<Shift> = self
            .store
            .request_with_headers(
                Method::POST,
                "/rest/v1/shifts",
                Some(shift_data),
                Some(representation_headers()),
            )
            .await?;
        let shift = rows
            .into_iter()
            .next()
            .ok_or_else(|| ScheduleError::Database("Failed to create shift".to_string()))?;

        let windows = generate_slots(&shift);
        let slot_rows: Vec<Value> = windows
            .iter()
            .map(|window| {
                json!({
                    "shift_id": shift.id,
                    "staff_id": shift.staff_id,
                    "clinic_id": shift.clinic_id,
                    "work_date": shift.work_date,
                    "start_time": window.start.to_rfc3339(),
                    "end_time": window.end.to_rfc3339(),
                    "status": SlotStatus::Available,
                })
            })
            .collect();

        let slots: Vec<Slot> = match self
            .store
            .request_with_headers(
                Method::POST,
                "/rest/v1/slots",
                Some(Value::Array(slot_rows)),
                Some(representation_headers()),
            )
            .await
        {
            Ok(slots) => slots,
            Err(e) => {
                // Keep shift and slots atomic from the caller's point of view.
                warn!("Slot generation failed for shift {}, rolling back: {}", shift.id, e);
                self.rollback_shift(shift.id).await;
                return Err(e.into());
            }
        };

        info!(
            "Created shift {} with {} slots for staff {}",
            shift.id,
            slots.len(),
            shift.staff_id
        );

        self.gateway
            .notify_shift_assigned(shift.staff_id, shift.clinic_id, shift.work_date)
            .await;

        Ok(ShiftWithSlots { shift, slots })
    }

    /// Deletes a shift and its slots; refuses while any slot is booked.
    pub async fn delete_shift(&self, shift_id: Uuid) -> Result<(), ScheduleError> {
        let shift = self.get_shift(shift_id).await?;

        let booked: Vec<Value> = self
            .store
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/slots?shift_id=eq.{}&status=eq.BOOKED&select=id&limit=1",
                    shift_id
                ),
                None,
            )
            .await?;
        if !booked.is_empty() {
            return Err(ScheduleError::ShiftHasBookedSlots);
        }

        let _: Value = self
            .store
            .request(Method::DELETE, &format!("/rest/v1/slots?shift_id=eq.{}", shift_id), None)
            .await?;
        let _: Value = self
            .store
            .request(Method::DELETE, &format!("/rest/v1/shifts?id=eq.{}", shift_id), None)
            .await?;

        info!("Deleted shift {} for staff {}", shift_id, shift.staff_id);
        Ok(())
    }

    pub async fn get_shift(&self, shift_id: Uuid) -> Result<Shift, ScheduleError> {
        let rows: Vec<Shift> = self
            .store
            .request(Method::GET, &format!("/rest/v1/shifts?id=eq.{}", shift_id), None)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ScheduleError::NotFound("Shift".to_string()))
    }

    pub async fn list_clinic_shifts(
        &self,
        clinic_id: Uuid,
        work_date: chrono::NaiveDate,
    ) -> Result<Vec<Shift>, ScheduleError> {
        let rows: Vec<Shift> = self
            .store
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/shifts?clinic_id=eq.{}&work_date=eq.{}&order=start_time.asc",
                    clinic_id, work_date
                ),
                None,
            )
            .await?;
        Ok(rows)
    }

    pub async fn list_staff_slots(
        &self,
        staff_id: Uuid,
        work_date: chrono::NaiveDate,
    ) -> Result<Vec<Slot>, ScheduleError> {
        let rows: Vec<Slot> = self
            .store
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/slots?staff_id=eq.{}&work_date=eq.{}&order=start_time.asc",
                    staff_id, work_date
                ),
                None,
            )
            .await?;
        Ok(rows)
    }

    /// AVAILABLE -> BLOCKED. Booked slots cannot be blocked.
    pub async fn block_slot(&self, slot_id: Uuid) -> Result<Slot, ScheduleError> {
        self.switch_slot_status(slot_id, "block_slot", SlotStatus::Available, SlotStatus::Blocked)
            .await
    }

    /// BLOCKED -> AVAILABLE.
    pub async fn unblock_slot(&self, slot_id: Uuid) -> Result<Slot, ScheduleError> {
        self.switch_slot_status(slot_id, "unblock_slot", SlotStatus::Blocked, SlotStatus::Available)
            .await
    }

    async fn switch_slot_status(
        &self,
        slot_id: Uuid,
        action: &'static str,
        required: SlotStatus,
        target: SlotStatus,
    ) -> Result<Slot, ScheduleError> {
        let rows: Vec<Slot> = self
            .store
            .request(Method::GET, &format!("/rest/v1/slots?id=eq.{}", slot_id), None)
            .await?;
        let slot = rows
            .into_iter()
            .next()
            .ok_or_else(|| ScheduleError::NotFound("Slot".to_string()))?;

        if slot.status != required {
            return Err(ScheduleError::InvalidSlotState {
                action,
                required: status_name(required),
                actual: slot.status,
            });
        }

        // The status filter makes the flip a no-op when a booking races us.
        let updated: Vec<Slot> = self
            .store
            .request_with_headers(
                Method::PATCH,
                &format!("/rest/v1/slots?id=eq.{}&status=eq.{}", slot_id, required),
                Some(json!({ "status": target })),
                Some(representation_headers()),
            )
            .await?;

        updated.into_iter().next().ok_or_else(|| {
            ScheduleError::Conflict(format!("Slot {} changed state concurrently", slot_id))
        })
    }

    async fn staff_shifts_for_date(
        &self,
        staff_id: Uuid,
        request: &CreateShiftRequest,
    ) -> Result<Vec<Shift>, ScheduleError> {
        let rows: Vec<Shift> = self
            .store
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/shifts?staff_id=eq.{}&work_date=eq.{}",
                    staff_id, request.work_date
                ),
                None,
            )
            .await?;
        Ok(rows)
    }

    async fn rollback_shift(&self, shift_id: Uuid) {
        let result: Result<Value, _> = self
            .store
            .request(Method::DELETE, &format!("/rest/v1/shifts?id=eq.{}", shift_id), None)
            .await;
        if let Err(e) = result {
            warn!("Rollback of shift {} failed, orphan left behind: {}", shift_id, e);
        }
    }
}

fn representation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Prefer", HeaderValue::from_static("return=representation"));
    headers
}

fn status_name(status: SlotStatus) -> &'static str {
    match status {
        SlotStatus::Available => "AVAILABLE",
        SlotStatus::Booked => "BOOKED",
        SlotStatus::Blocked => "BLOCKED",
    }
}

fn validate_shift_times(request: &CreateShiftRequest) -> Result<(), ScheduleError> {
    if !request.is_overnight && request.start_time >= request.end_time {
        return Err(ScheduleError::Validation(
            "Shift start must be before shift end".to_string(),
        ));
    }
    if request.is_overnight && request.start_time == request.end_time {
        return Err(ScheduleError::Validation(
            "Overnight shift cannot start and end at the same time".to_string(),
        ));
    }

    match (request.break_start, request.break_end) {
        (None, None) => Ok(()),
        (Some(break_start), Some(break_end)) => {
            let shift = minute_interval(request.start_time, request.end_time, request.is_overnight);
            let break_window = break_interval(request, break_start, break_end);
            if break_window.0 >= break_window.1 {
                return Err(ScheduleError::Validation(
                    "Break start must be before break end".to_string(),
                ));
            }
            if break_window.0 < shift.0 || break_window.1 > shift.1 {
                return Err(ScheduleError::Validation(
                    "Break window must fall inside the shift".to_string(),
                ));
            }
            Ok(())
        }
        _ => Err(ScheduleError::Validation(
            "Break start and break end must be provided together".to_string(),
        )),
    }
}

/// Maps a shift to minutes on a single timeline; an overnight end lands past
/// 24h so interval comparisons stay ordinary arithmetic.
fn minute_interval(start: NaiveTime, end: NaiveTime, overnight: bool) -> (i64, i64) {
    let start_min = start.num_seconds_from_midnight() as i64 / 60;
    let mut end_min = end.num_seconds_from_midnight() as i64 / 60;
    if overnight {
        end_min += 24 * 60;
    }
    (start_min, end_min)
}

fn break_interval(request: &CreateShiftRequest, break_start: NaiveTime, break_end: NaiveTime) -> (i64, i64) {
    let mut start_min = break_start.num_seconds_from_midnight() as i64 / 60;
    let mut end_min = break_end.num_seconds_from_midnight() as i64 / 60;
    if request.is_overnight && break_start < request.start_time {
        start_min += 24 * 60;
    }
    if request.is_overnight && break_end <= request.start_time {
        end_min += 24 * 60;
    }
    (start_min, end_min)
}

fn intervals_overlap(a: (i64, i64), b: (i64, i64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/// Tiles `[start, end)` with 30-minute slots, skipping any slot that touches
/// the break window. Overnight shifts wrap across midnight: the end time and
/// any break time earlier than the start time belong to the next calendar day.
pub fn generate_slots(shift: &Shift) -> Vec<SlotWindow> {
    let start = anchor_time(shift, shift.start_time, false);
    let end = anchor_time(shift, shift.end_time, shift.is_overnight);

    let break_window = match (shift.break_start, shift.break_end) {
        (Some(break_start), Some(break_end)) => Some((
            anchor_time(shift, break_start, shift.is_overnight && break_start < shift.start_time),
            anchor_time(shift, break_end, shift.is_overnight && break_end <= shift.start_time),
        )),
        _ => None,
    };

    let step = Duration::minutes(SLOT_MINUTES);
    let mut windows = Vec::new();
    let mut cursor = start;

    while cursor + step <= end {
        let slot_end = cursor + step;
        let in_break = break_window
            .map(|(break_start, break_end)| cursor < break_end && slot_end > break_start)
            .unwrap_or(false);
        if !in_break {
            windows.push(SlotWindow { start: cursor, end: slot_end });
        }
        cursor = slot_end;
    }

    windows
}

fn anchor_time(shift: &Shift, time: NaiveTime, next_day: bool) -> DateTime<Utc> {
    let date = if next_day {
        shift.work_date + Days::new(1)
    } else {
        shift.work_date
    };
    date.and_time(time).and_utc()
}
