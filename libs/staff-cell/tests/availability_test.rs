use chrono::NaiveTime;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_config::AppConfig;
use staff_cell::models::{
    AvailabilityRequest, ServiceCoverageRequest, ServiceSlotRequirement, Specialty,
};
use staff_cell::AvailabilityService;

fn test_config(store_url: &str) -> AppConfig {
    AppConfig {
        store_url: store_url.to_string(),
        store_api_key: "test-api-key".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        bind_port: 0,
        sos_confirm_timeout_secs: 300,
        sos_sweep_interval_secs: 60,
        sos_search_radius_km: 15.0,
        sos_max_candidates: 10,
        sos_lease_ttl_secs: 15,
        sos_session_ttl_secs: 21_600,
    }
}

fn availability_request(clinic_id: Uuid, specialty: Specialty, slots_needed: usize) -> AvailabilityRequest {
    AvailabilityRequest {
        clinic_id,
        date: "2025-03-10".parse().unwrap(),
        start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        specialty,
        slots_needed,
        exclude_staff_id: None,
    }
}

fn staff_row(id: Uuid, clinic_id: Uuid, name: &str, specialty: &str) -> serde_json::Value {
    json!({
        "id": id,
        "clinic_id": clinic_id,
        "first_name": name,
        "last_name": "Doe",
        "specialty": specialty,
        "is_active": true
    })
}

fn shift_row(staff_id: Uuid, clinic_id: Uuid) -> serde_json::Value {
    json!({
        "id": Uuid::new_v4(),
        "staff_id": staff_id,
        "clinic_id": clinic_id,
        "work_date": "2025-03-10",
        "start_time": "09:00:00",
        "end_time": "17:00:00",
        "break_start": null,
        "break_end": null,
        "is_overnight": false,
        "created_at": "2025-03-01T08:00:00Z"
    })
}

fn slot_row(staff_id: Uuid, clinic_id: Uuid, start: &str, end: &str, status: &str) -> serde_json::Value {
    json!({
        "id": Uuid::new_v4(),
        "shift_id": Uuid::new_v4(),
        "staff_id": staff_id,
        "clinic_id": clinic_id,
        "work_date": "2025-03-10",
        "start_time": format!("2025-03-10T{}Z", start),
        "end_time": format!("2025-03-10T{}Z", end),
        "status": status
    })
}

async fn mount_schedule(
    mock_server: &MockServer,
    shifts: serde_json::Value,
    slots: serde_json::Value,
) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/shifts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shifts))
        .mount(mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(slots))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_specialty_search_falls_back_to_generalists() {
    let mock_server = MockServer::start().await;
    let clinic_id = Uuid::new_v4();
    let cardiologist = Uuid::new_v4();
    let generalist = Uuid::new_v4();

    // The candidate query itself must already include the fallback specialty.
    Mock::given(method("GET"))
        .and(path("/rest/v1/staff"))
        .and(query_param("specialty", "in.(VET_CARDIOLOGY,VET_GENERAL)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            staff_row(cardiologist, clinic_id, "Ada", "VET_CARDIOLOGY"),
            staff_row(generalist, clinic_id, "Grace", "VET_GENERAL"),
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    mount_schedule(
        &mock_server,
        json!([shift_row(cardiologist, clinic_id), shift_row(generalist, clinic_id)]),
        json!([
            slot_row(cardiologist, clinic_id, "10:00:00", "10:30:00", "AVAILABLE"),
            slot_row(cardiologist, clinic_id, "10:30:00", "11:00:00", "AVAILABLE"),
            slot_row(generalist, clinic_id, "10:00:00", "10:30:00", "AVAILABLE"),
            slot_row(generalist, clinic_id, "10:30:00", "11:00:00", "AVAILABLE"),
        ]),
    )
    .await;

    let service = AvailabilityService::new(&test_config(&mock_server.uri()));
    let candidates = service
        .find_available_staff(&availability_request(clinic_id, Specialty::VetCardiology, 2))
        .await
        .expect("search should succeed");

    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().all(|c| c.available));
    assert!(candidates.iter().any(|c| c.staff.id == generalist));
}

#[tokio::test]
async fn test_grooming_never_falls_back_to_vets() {
    let mock_server = MockServer::start().await;
    let clinic_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/staff"))
        .and(query_param("specialty", "in.(GROOMER)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let service = AvailabilityService::new(&test_config(&mock_server.uri()));
    let candidates = service
        .find_available_staff(&availability_request(clinic_id, Specialty::Groomer, 1))
        .await
        .expect("search should succeed");

    assert!(candidates.is_empty());
}

#[tokio::test]
async fn test_staff_without_shift_is_reported_with_reason() {
    let mock_server = MockServer::start().await;
    let clinic_id = Uuid::new_v4();
    let staff_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/staff"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([staff_row(
            staff_id,
            clinic_id,
            "Ada",
            "VET_GENERAL"
        )])))
        .mount(&mock_server)
        .await;

    mount_schedule(&mock_server, json!([]), json!([])).await;

    let service = AvailabilityService::new(&test_config(&mock_server.uri()));
    let candidates = service
        .find_available_staff(&availability_request(clinic_id, Specialty::VetGeneral, 1))
        .await
        .expect("search should succeed");

    assert_eq!(candidates.len(), 1);
    assert!(!candidates[0].available);
    assert_eq!(
        candidates[0].reason.as_deref(),
        Some("No shift scheduled for this day")
    );
}

#[tokio::test]
async fn test_fragmented_slots_make_staff_unavailable() {
    let mock_server = MockServer::start().await;
    let clinic_id = Uuid::new_v4();
    let staff_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/staff"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([staff_row(
            staff_id,
            clinic_id,
            "Ada",
            "VET_GENERAL"
        )])))
        .mount(&mock_server)
        .await;

    // Two free slots with a booked hole between them.
    mount_schedule(
        &mock_server,
        json!([shift_row(staff_id, clinic_id)]),
        json!([
            slot_row(staff_id, clinic_id, "10:00:00", "10:30:00", "AVAILABLE"),
            slot_row(staff_id, clinic_id, "10:30:00", "11:00:00", "BOOKED"),
            slot_row(staff_id, clinic_id, "11:00:00", "11:30:00", "AVAILABLE"),
        ]),
    )
    .await;

    let service = AvailabilityService::new(&test_config(&mock_server.uri()));
    let candidates = service
        .find_available_staff(&availability_request(clinic_id, Specialty::VetGeneral, 2))
        .await
        .expect("search should succeed");

    assert_eq!(candidates.len(), 1);
    assert!(!candidates[0].available);
    assert_eq!(
        candidates[0].reason.as_deref(),
        Some("Not enough contiguous free slots")
    );
}

#[tokio::test]
async fn test_candidates_rank_by_booked_load() {
    let mock_server = MockServer::start().await;
    let clinic_id = Uuid::new_v4();
    let busy = Uuid::new_v4();
    let idle = Uuid::new_v4();
    let absent = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/staff"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            staff_row(busy, clinic_id, "Busy", "VET_GENERAL"),
            staff_row(idle, clinic_id, "Idle", "VET_GENERAL"),
            staff_row(absent, clinic_id, "Absent", "VET_GENERAL"),
        ])))
        .mount(&mock_server)
        .await;

    mount_schedule(
        &mock_server,
        json!([shift_row(busy, clinic_id), shift_row(idle, clinic_id)]),
        json!([
            slot_row(busy, clinic_id, "09:00:00", "09:30:00", "BOOKED"),
            slot_row(busy, clinic_id, "09:30:00", "10:00:00", "BOOKED"),
            slot_row(busy, clinic_id, "10:00:00", "10:30:00", "AVAILABLE"),
            slot_row(idle, clinic_id, "10:00:00", "10:30:00", "AVAILABLE"),
        ]),
    )
    .await;

    let service = AvailabilityService::new(&test_config(&mock_server.uri()));
    let candidates = service
        .find_available_staff(&availability_request(clinic_id, Specialty::VetGeneral, 1))
        .await
        .expect("search should succeed");

    assert_eq!(candidates.len(), 3);
    // Least-booked available staff first, unavailable staff last.
    assert_eq!(candidates[0].staff.id, idle);
    assert_eq!(candidates[1].staff.id, busy);
    assert_eq!(candidates[2].staff.id, absent);
    assert!(!candidates[2].available);
}

#[tokio::test]
async fn test_excluded_staff_is_filtered_in_the_query() {
    let mock_server = MockServer::start().await;
    let clinic_id = Uuid::new_v4();
    let excluded = Uuid::new_v4();
    let other = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/staff"))
        .and(query_param("id", format!("neq.{}", excluded)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([staff_row(
            other,
            clinic_id,
            "Ada",
            "VET_GENERAL"
        )])))
        .expect(1)
        .mount(&mock_server)
        .await;

    mount_schedule(
        &mock_server,
        json!([shift_row(other, clinic_id)]),
        json!([slot_row(other, clinic_id, "10:00:00", "10:30:00", "AVAILABLE")]),
    )
    .await;

    let mut request = availability_request(clinic_id, Specialty::VetGeneral, 1);
    request.exclude_staff_id = Some(excluded);

    let service = AvailabilityService::new(&test_config(&mock_server.uri()));
    let candidates = service
        .find_available_staff(&request)
        .await
        .expect("search should succeed");

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].staff.id, other);
}

#[tokio::test]
async fn test_service_coverage_ranks_by_services_covered() {
    let mock_server = MockServer::start().await;
    let clinic_id = Uuid::new_v4();
    let partial = Uuid::new_v4();
    let full = Uuid::new_v4();
    let long_service = Uuid::new_v4();
    let short_service = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/staff"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            staff_row(partial, clinic_id, "Partial", "VET_GENERAL"),
            staff_row(full, clinic_id, "Full", "VET_GENERAL"),
        ])))
        .mount(&mock_server)
        .await;

    // `partial` has one free slot, `full` has three chained ones.
    mount_schedule(
        &mock_server,
        json!([shift_row(partial, clinic_id), shift_row(full, clinic_id)]),
        json!([
            slot_row(partial, clinic_id, "10:00:00", "10:30:00", "AVAILABLE"),
            slot_row(full, clinic_id, "10:00:00", "10:30:00", "AVAILABLE"),
            slot_row(full, clinic_id, "10:30:00", "11:00:00", "AVAILABLE"),
            slot_row(full, clinic_id, "11:00:00", "11:30:00", "AVAILABLE"),
        ]),
    )
    .await;

    let request = ServiceCoverageRequest {
        clinic_id,
        date: "2025-03-10".parse().unwrap(),
        start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        specialty: Specialty::VetGeneral,
        services: vec![
            ServiceSlotRequirement { service_id: long_service, slots_needed: 2 },
            ServiceSlotRequirement { service_id: short_service, slots_needed: 1 },
        ],
        exclude_staff_id: None,
    };

    let service = AvailabilityService::new(&test_config(&mock_server.uri()));
    let coverage = service
        .check_service_coverage(&request)
        .await
        .expect("coverage check should succeed");

    assert_eq!(coverage.len(), 2);
    assert_eq!(coverage[0].staff.id, full);
    assert_eq!(coverage[0].covered_count(), 2);
    assert_eq!(coverage[1].staff.id, partial);
    assert_eq!(coverage[1].services_covered, vec![short_service]);
    assert_eq!(coverage[1].services_missed, vec![long_service]);
}
