use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Method;
use tracing::debug;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::StoreClient;

use crate::models::{
    compatibility_for, AvailabilityRequest, ScheduleError, ServiceCoverage, ServiceCoverageRequest,
    Shift, Slot, SlotStatus, Specialty, Staff, StaffCandidate,
};

/// Read-only candidate search over shift and slot state. Ranking favors the
/// least-booked staff; storage constraints stay the source of truth for any
/// race this advisory view loses.
pub struct AvailabilityService {
    store: Arc<StoreClient>,
}

struct DaySchedule {
    shifts: Vec<Shift>,
    slots: Vec<Slot>,
}

impl AvailabilityService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            store: Arc::new(StoreClient::new(config)),
        }
    }

    pub fn with_store(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Finds staff able to serve `slots_needed` contiguous slots from the
    /// requested time. Unavailable staff are appended last with a reason.
    pub async fn find_available_staff(
        &self,
        request: &AvailabilityRequest,
    ) -> Result<Vec<StaffCandidate>, ScheduleError> {
        if request.slots_needed == 0 {
            return Err(ScheduleError::Validation(
                "At least one slot is required".to_string(),
            ));
        }

        let pool = self.candidate_pool(request.clinic_id, request.specialty, request.exclude_staff_id).await?;
        if pool.is_empty() {
            debug!(
                "No staff with specialty {} at clinic {}",
                request.specialty, request.clinic_id
            );
            return Ok(Vec::new());
        }

        let schedules = self.day_schedules(&pool, request.date).await?;
        let requested_start = request.date.and_time(request.start_time).and_utc();

        let mut candidates: Vec<StaffCandidate> = pool
            .into_iter()
            .map(|staff| {
                let schedule = &schedules[&staff.id];
                evaluate_candidate(staff, schedule, request.slots_needed, requested_start)
            })
            .collect();

        candidates.sort_by_key(|c| (!c.available, c.booked_slots));

        debug!(
            "{} of {} candidates available for {} slots",
            candidates.iter().filter(|c| c.available).count(),
            candidates.len(),
            request.slots_needed
        );

        Ok(candidates)
    }

    /// Evaluates each service requirement independently against the same
    /// pool. Partial coverage is expected; callers pick the candidate with
    /// the most services covered.
    pub async fn check_service_coverage(
        &self,
        request: &ServiceCoverageRequest,
    ) -> Result<Vec<ServiceCoverage>, ScheduleError> {
        if request.services.is_empty() {
            return Err(ScheduleError::Validation(
                "At least one service is required".to_string(),
            ));
        }

        let pool = self.candidate_pool(request.clinic_id, request.specialty, request.exclude_staff_id).await?;
        if pool.is_empty() {
            return Ok(Vec::new());
        }

        let schedules = self.day_schedules(&pool, request.date).await?;
        let requested_start = request.date.and_time(request.start_time).and_utc();

        let mut coverage: Vec<ServiceCoverage> = pool
            .into_iter()
            .map(|staff| {
                let schedule = &schedules[&staff.id];
                let available = available_slots(&schedule.slots);
                let booked = booked_count(&schedule.slots);

                let mut covered = Vec::new();
                let mut missed = Vec::new();
                for service in &request.services {
                    let run = contiguous_run_start(&available, service.slots_needed, requested_start);
                    if schedule.shifts.is_empty() || run.is_none() {
                        missed.push(service.service_id);
                    } else {
                        covered.push(service.service_id);
                    }
                }

                ServiceCoverage {
                    staff,
                    services_covered: covered,
                    services_missed: missed,
                    booked_slots: booked,
                }
            })
            .collect();

        coverage.sort_by(|a, b| {
            b.covered_count()
                .cmp(&a.covered_count())
                .then(a.booked_slots.cmp(&b.booked_slots))
        });

        Ok(coverage)
    }

    async fn candidate_pool(
        &self,
        clinic_id: Uuid,
        specialty: Specialty,
        exclude_staff_id: Option<Uuid>,
    ) -> Result<Vec<Staff>, ScheduleError> {
        let accepted: Vec<String> = compatibility_for(specialty)
            .accepted()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut path = format!(
            "/rest/v1/staff?clinic_id=eq.{}&is_active=eq.true&specialty=in.({})",
            clinic_id,
            accepted.join(",")
        );
        if let Some(excluded) = exclude_staff_id {
            path.push_str(&format!("&id=neq.{}", excluded));
        }

        let staff: Vec<Staff> = self.store.request(Method::GET, &path, None).await?;
        Ok(staff)
    }

    async fn day_schedules(
        &self,
        pool: &[Staff],
        date: chrono::NaiveDate,
    ) -> Result<HashMap<Uuid, DaySchedule>, ScheduleError> {
        let ids: Vec<String> = pool.iter().map(|s| s.id.to_string()).collect();
        let id_filter = ids.join(",");

        let shifts: Vec<Shift> = self
            .store
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/shifts?work_date=eq.{}&staff_id=in.({})",
                    date, id_filter
                ),
                None,
            )
            .await?;
        let slots: Vec<Slot> = self
            .store
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/slots?work_date=eq.{}&staff_id=in.({})&order=start_time.asc",
                    date, id_filter
                ),
                None,
            )
            .await?;

        let mut schedules: HashMap<Uuid, DaySchedule> = pool
            .iter()
            .map(|staff| (staff.id, DaySchedule { shifts: Vec::new(), slots: Vec::new() }))
            .collect();
        for shift in shifts {
            if let Some(schedule) = schedules.get_mut(&shift.staff_id) {
                schedule.shifts.push(shift);
            }
        }
        for slot in slots {
            if let Some(schedule) = schedules.get_mut(&slot.staff_id) {
                schedule.slots.push(slot);
            }
        }

        Ok(schedules)
    }
}

fn evaluate_candidate(
    staff: Staff,
    schedule: &DaySchedule,
    slots_needed: usize,
    requested_start: DateTime<Utc>,
) -> StaffCandidate {
    let booked = booked_count(&schedule.slots);

    if schedule.shifts.is_empty() {
        return unavailable(staff, "No shift scheduled for this day", booked);
    }

    let available = available_slots(&schedule.slots);
    match contiguous_run_start(&available, slots_needed, requested_start) {
        Some(start) => {
            let run = &available[start..start + slots_needed];
            StaffCandidate {
                staff,
                available: true,
                reason: None,
                slot_ids: run.iter().map(|slot| slot.id).collect(),
                start_time: Some(run[0].start_time),
                end_time: Some(run[run.len() - 1].end_time),
                booked_slots: booked,
            }
        }
        None => unavailable(staff, "Not enough contiguous free slots", booked),
    }
}

fn unavailable(staff: Staff, reason: &str, booked: usize) -> StaffCandidate {
    StaffCandidate {
        staff,
        available: false,
        reason: Some(reason.to_string()),
        slot_ids: Vec::new(),
        start_time: None,
        end_time: None,
        booked_slots: booked,
    }
}

fn available_slots(slots: &[Slot]) -> Vec<&Slot> {
    slots
        .iter()
        .filter(|slot| slot.status == SlotStatus::Available)
        .collect()
}

fn booked_count(slots: &[Slot]) -> usize {
    slots
        .iter()
        .filter(|slot| slot.status == SlotStatus::Booked)
        .count()
}

/// First index of a strictly contiguous run of `needed` slots starting at or
/// after `not_before`. Contiguity means each slot ends exactly where the next
/// one starts. Expects `slots` sorted by start time.
pub fn contiguous_run_start(
    slots: &[&Slot],
    needed: usize,
    not_before: DateTime<Utc>,
) -> Option<usize> {
    if needed == 0 || slots.len() < needed {
        return None;
    }

    'outer: for start in 0..=(slots.len() - needed) {
        if slots[start].start_time < not_before {
            continue;
        }
        for offset in 0..needed - 1 {
            if slots[start + offset].end_time != slots[start + offset + 1].start_time {
                continue 'outer;
            }
        }
        return Some(start);
    }

    None
}
