use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use booking_cell::models::BookingStatus;
use shared_config::AppConfig;
use shared_database::StoreClient;
use shared_gateways::{BookingNotice, DistanceProvider, HaversineDistanceProvider, NotificationGateway};
use sos_cell::{
    BookingLease, ClinicResponseRequest, InMemorySessionRepository, InProcessLease, MatchOutcome,
    MatchSession, MatchSettings, SosError, SosEventChannel, SosMatchRequest, SosMatchService,
    SosSessionRepository,
};

// ===== TEST DOUBLES =====

#[derive(Default)]
struct RecordingGateway {
    events: Mutex<Vec<String>>,
}

impl RecordingGateway {
    async fn push(&self, label: String) {
        self.events.lock().await.push(label);
    }

    async fn events(&self) -> Vec<String> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn notify_booking_created(&self, _notice: &BookingNotice) {
        self.push("created".to_string()).await;
    }
    async fn notify_check_in(&self, _notice: &BookingNotice) {
        self.push("check_in".to_string()).await;
    }
    async fn notify_completed(&self, _notice: &BookingNotice) {
        self.push("completed".to_string()).await;
    }
    async fn notify_on_way(&self, _notice: &BookingNotice, eta_minutes: Option<i64>) {
        self.push(format!("on_way:{:?}", eta_minutes)).await;
    }
    async fn notify_shift_assigned(&self, _staff_id: Uuid, _clinic_id: Uuid, _work_date: NaiveDate) {
        self.push("shift_assigned".to_string()).await;
    }
    async fn notify_sos_offer(&self, clinic_id: Uuid, _notice: &BookingNotice) {
        self.push(format!("sos_offer:{}", clinic_id)).await;
    }
}

struct FixedDistance(f64);

#[async_trait]
impl DistanceProvider for FixedDistance {
    async fn distance_km(&self, _lat1: f64, _lng1: f64, _lat2: f64, _lng2: f64) -> f64 {
        self.0
    }
}

// ===== HARNESS =====

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

struct Harness {
    service: SosMatchService,
    gateway: Arc<RecordingGateway>,
    sessions: Arc<InMemorySessionRepository>,
    lease: Arc<InProcessLease>,
    events: Arc<SosEventChannel>,
}

fn harness_with(
    store_url: &str,
    distance: Arc<dyn DistanceProvider>,
    settings: MatchSettings,
) -> Harness {
    let config = test_config(store_url);
    let store = Arc::new(StoreClient::new(&config));
    let gateway = Arc::new(RecordingGateway::default());
    let sessions = Arc::new(InMemorySessionRepository::new());
    let lease = Arc::new(InProcessLease::new(Duration::from_secs(15)));
    let events = Arc::new(SosEventChannel::new());
    let service = SosMatchService::with_parts(
        store,
        gateway.clone(),
        distance,
        sessions.clone(),
        lease.clone(),
        events.clone(),
        settings,
    );
    Harness {
        service,
        gateway,
        sessions,
        lease,
        events,
    }
}

fn harness(store_url: &str) -> Harness {
    harness_with(
        store_url,
        Arc::new(FixedDistance(1.0)),
        MatchSettings {
            search_radius_km: 15.0,
            max_candidates: 10,
            confirm_timeout_secs: 300,
        },
    )
}

fn match_request(owner_id: Uuid) -> SosMatchRequest {
    SosMatchRequest {
        owner_id,
        pet_id: Uuid::new_v4(),
        address: "12 Riverside Walk".to_string(),
        latitude: 51.5072,
        longitude: -0.1276,
        symptoms: Some("Collapsed after eating".to_string()),
    }
}

fn decline_from(clinic_id: Uuid) -> ClinicResponseRequest {
    ClinicResponseRequest {
        clinic_id,
        manager_id: Uuid::new_v4(),
        accept: false,
        staff_id: None,
        reason: Some("At capacity".to_string()),
    }
}

fn accept_from(clinic_id: Uuid, staff_id: Option<Uuid>) -> ClinicResponseRequest {
    ClinicResponseRequest {
        clinic_id,
        manager_id: Uuid::new_v4(),
        accept: true,
        staff_id,
        reason: None,
    }
}

fn booking_row(id: Uuid, owner_id: Uuid, status: &str) -> Value {
    json!({
        "id": id,
        "booking_code": "BK-20250310-0007",
        "owner_id": owner_id,
        "pet_id": Uuid::new_v4(),
        "clinic_id": null,
        "staff_id": null,
        "booking_type": "SOS",
        "status": status,
        "total_price": 0.0,
        "scheduled_start": null,
        "scheduled_end": null,
        "address": "12 Riverside Walk",
        "latitude": 51.5072,
        "longitude": -0.1276,
        "symptoms": "Collapsed after eating",
        "notes": null,
        "cancellation_reason": null,
        "cancelled_by": null,
        "created_at": "2025-03-10T08:00:00Z",
        "updated_at": "2025-03-10T08:00:00Z"
    })
}

fn clinic_row(id: Uuid, name: &str, latitude: f64, longitude: f64) -> Value {
    json!({
        "id": id,
        "name": name,
        "address": "1 High Street",
        "latitude": latitude,
        "longitude": longitude,
        "is_active": true,
        "accepts_sos": true
    })
}

fn session(clinic_ids: Vec<Uuid>, index: usize) -> MatchSession {
    let now = Utc::now();
    MatchSession {
        clinic_ids,
        index,
        created_at: now,
        notified_at: now,
    }
}

fn stale_session(clinic_ids: Vec<Uuid>, index: usize) -> MatchSession {
    let now = Utc::now();
    MatchSession {
        clinic_ids,
        index,
        created_at: now - chrono::Duration::seconds(900),
        notified_at: now - chrono::Duration::seconds(600),
    }
}

async fn mount_no_active_sos(server: &MockServer, owner_id: Uuid) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/bookings"))
        .and(query_param("owner_id", format!("eq.{}", owner_id)))
        .and(query_param("booking_type", "eq.SOS"))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

async fn mount_code_allocator(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/bookings"))
        .and(query_param("select", "booking_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

async fn mount_insert(server: &MockServer, row: &Value) {
    Mock::given(method("POST"))
        .and(path("/rest/v1/bookings"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([row])))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_clinics(server: &MockServer, rows: Value) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/clinics"))
        .and(query_param("accepts_sos", "eq.true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .mount(server)
        .await;
}

async fn mount_clinic_lookup(server: &MockServer, row: &Value) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/clinics"))
        .and(query_param("id", format!("eq.{}", row["id"].as_str().unwrap())))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(server)
        .await;
}

async fn mount_fetch(server: &MockServer, row: &Value) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/bookings"))
        .and(query_param("id", format!("eq.{}", row["id"].as_str().unwrap())))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(server)
        .await;
}

async fn mount_transition(server: &MockServer, booking_id: Uuid, updated: &Value, expected: u64) {
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/bookings"))
        .and(query_param("id", format!("eq.{}", booking_id)))
        .and(query_param("status", "in.(PENDING_CLINIC_CONFIRM)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([updated])))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_awaiting_list(server: &MockServer, rows: Value) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/bookings"))
        .and(query_param("status", "eq.PENDING_CLINIC_CONFIRM"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .mount(server)
        .await;
}

// ===== START MATCHING =====

#[tokio::test]
async fn test_start_matching_offers_the_nearest_clinic_first() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let near = Uuid::new_v4();
    let mid = Uuid::new_v4();
    let far = Uuid::new_v4();

    mount_no_active_sos(&mock_server, owner_id).await;
    // Distances from the owner: ~0.9 km, ~9.7 km and ~80 km; the last one
    // falls outside the 15 km search radius.
    mount_clinics(
        &mock_server,
        json!([
            clinic_row(far, "Far Meadows Vets", 52.2, 0.12),
            clinic_row(mid, "Midtown Animal Hospital", 51.58, -0.05),
            clinic_row(near, "Riverside Emergency Vets", 51.5115, -0.1160),
        ]),
    )
    .await;
    mount_code_allocator(&mock_server).await;
    let created = booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM");
    mount_insert(&mock_server, &created).await;

    let harness = harness_with(
        &mock_server.uri(),
        Arc::new(HaversineDistanceProvider),
        MatchSettings {
            search_radius_km: 15.0,
            max_candidates: 10,
            confirm_timeout_secs: 300,
        },
    );
    let mut global_rx = harness.events.subscribe_global();

    let response = harness
        .service
        .start_matching(match_request(owner_id))
        .await
        .unwrap();

    assert_eq!(response.candidates, 2);
    assert_eq!(response.booking.status, BookingStatus::PendingClinicConfirm);

    let saved = harness.sessions.load(booking_id).await.unwrap().unwrap();
    assert_eq!(saved.clinic_ids, vec![near, mid]);
    assert_eq!(saved.index, 0);

    assert_eq!(
        harness.gateway.events().await,
        vec![format!("sos_offer:{}", near)]
    );

    let event: Value = serde_json::from_str(&global_rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["bookingId"], booking_id.to_string());
    assert_eq!(event["status"], "PENDING_CLINIC_CONFIRM");
    assert_eq!(event["clinicId"], near.to_string());
    assert_eq!(event["clinicName"], "Riverside Emergency Vets");

    let requests = mock_server.received_requests().await.unwrap();
    let insert = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.path() == "/rest/v1/bookings")
        .unwrap();
    let body: Value = serde_json::from_slice(&insert.body).unwrap();
    assert_eq!(body["status"], "PENDING_CLINIC_CONFIRM");
    assert_eq!(body["booking_type"], "SOS");
    assert_eq!(body["symptoms"], "Collapsed after eating");
    assert!(body["clinic_id"].is_null());
}

#[tokio::test]
async fn test_candidate_list_is_capped() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    mount_no_active_sos(&mock_server, owner_id).await;
    mount_clinics(
        &mock_server,
        json!([
            clinic_row(Uuid::new_v4(), "First", 51.51, -0.12),
            clinic_row(Uuid::new_v4(), "Second", 51.52, -0.12),
            clinic_row(Uuid::new_v4(), "Third", 51.53, -0.12),
        ]),
    )
    .await;
    mount_code_allocator(&mock_server).await;
    mount_insert(
        &mock_server,
        &booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM"),
    )
    .await;

    let harness = harness_with(
        &mock_server.uri(),
        Arc::new(FixedDistance(1.0)),
        MatchSettings {
            search_radius_km: 15.0,
            max_candidates: 2,
            confirm_timeout_secs: 300,
        },
    );

    let response = harness
        .service
        .start_matching(match_request(owner_id))
        .await
        .unwrap();

    assert_eq!(response.candidates, 2);
    let saved = harness.sessions.load(booking_id).await.unwrap().unwrap();
    assert_eq!(saved.clinic_ids.len(), 2);
}

#[tokio::test]
async fn test_second_sos_for_the_same_owner_is_rejected() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/bookings"))
        .and(query_param("owner_id", format!("eq.{}", owner_id)))
        .and(query_param("booking_type", "eq.SOS"))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([booking_row(
            Uuid::new_v4(),
            owner_id,
            "PENDING_CLINIC_CONFIRM"
        )])))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/bookings"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let harness = harness(&mock_server.uri());
    let err = harness
        .service
        .start_matching(match_request(owner_id))
        .await
        .unwrap_err();

    assert_matches!(err, SosError::Conflict(msg) if msg.contains("BK-20250310-0007"));
}

#[tokio::test]
async fn test_no_clinics_in_range_cancels_on_the_spot() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    mount_no_active_sos(&mock_server, owner_id).await;
    mount_clinics(&mock_server, json!([])).await;
    mount_code_allocator(&mock_server).await;
    mount_insert(&mock_server, &booking_row(booking_id, owner_id, "CANCELLED")).await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/bookings"))
        .and(query_param("id", format!("eq.{}", booking_id)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let harness = harness(&mock_server.uri());
    let mut global_rx = harness.events.subscribe_global();

    let response = harness
        .service
        .start_matching(match_request(owner_id))
        .await
        .unwrap();

    assert_eq!(response.candidates, 0);
    assert_eq!(response.booking.status, BookingStatus::Cancelled);
    assert!(response.message.contains("No emergency clinics"));

    // Nothing was offered and no session was left behind.
    assert!(harness.gateway.events().await.is_empty());
    assert_eq!(harness.sessions.load(booking_id).await.unwrap(), None);

    let event: Value = serde_json::from_str(&global_rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "CANCELLED");
    assert!(event["message"]
        .as_str()
        .unwrap()
        .contains("No emergency clinics"));

    let requests = mock_server.received_requests().await.unwrap();
    let insert = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.path() == "/rest/v1/bookings")
        .unwrap();
    let body: Value = serde_json::from_slice(&insert.body).unwrap();
    assert_eq!(body["status"], "CANCELLED");
}

// ===== CLINIC RESPONSES =====

#[tokio::test]
async fn test_accept_confirms_and_records_the_clinic() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let clinic_id = Uuid::new_v4();
    let staff_id = Uuid::new_v4();

    let pending = booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM");
    let mut confirmed = booking_row(booking_id, owner_id, "CONFIRMED");
    confirmed["clinic_id"] = json!(clinic_id);
    confirmed["staff_id"] = json!(staff_id);
    confirmed["distance_km"] = json!(1.0);

    mount_fetch(&mock_server, &pending).await;
    mount_transition(&mock_server, booking_id, &confirmed, 1).await;
    mount_clinic_lookup(&mock_server, &clinic_row(clinic_id, "Riverside Emergency Vets", 51.51, -0.12)).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &session(vec![clinic_id, Uuid::new_v4()], 0))
        .await
        .unwrap();
    let mut global_rx = harness.events.subscribe_global();

    let outcome = harness
        .service
        .process_confirmation(booking_id, accept_from(clinic_id, Some(staff_id)))
        .await
        .unwrap();

    let booking = assert_matches!(outcome, MatchOutcome::Confirmed(b) => b);
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.clinic_id, Some(clinic_id));
    assert_eq!(booking.distance_km, Some(1.0));

    // Session cleared, event carries the accepting clinic.
    assert_eq!(harness.sessions.load(booking_id).await.unwrap(), None);
    let event: Value = serde_json::from_str(&global_rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "CONFIRMED");
    assert_eq!(event["clinicId"], clinic_id.to_string());
    assert!(event["message"]
        .as_str()
        .unwrap()
        .contains("Riverside Emergency Vets"));

    let requests = mock_server.received_requests().await.unwrap();
    let patch = requests
        .iter()
        .find(|r| r.method.as_str() == "PATCH" && r.url.path() == "/rest/v1/bookings")
        .unwrap();
    let body: Value = serde_json::from_slice(&patch.body).unwrap();
    assert_eq!(body["status"], "CONFIRMED");
    assert_eq!(body["clinic_id"], clinic_id.to_string());
    assert_eq!(body["staff_id"], staff_id.to_string());
    assert_eq!(body["distance_km"], json!(1.0));
}

#[tokio::test]
async fn test_decline_passes_the_offer_to_the_next_clinic() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    mount_fetch(&mock_server, &booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM")).await;
    mount_clinic_lookup(&mock_server, &clinic_row(second, "Midtown Animal Hospital", 51.58, -0.05)).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &session(vec![first, second], 0))
        .await
        .unwrap();
    let mut global_rx = harness.events.subscribe_global();
    let before = Utc::now();

    let outcome = harness
        .service
        .process_confirmation(booking_id, decline_from(first))
        .await
        .unwrap();

    assert_matches!(outcome, MatchOutcome::Escalated { clinic_id } if clinic_id == second);

    let advanced = harness.sessions.load(booking_id).await.unwrap().unwrap();
    assert_eq!(advanced.index, 1);
    assert!(advanced.notified_at >= before);

    assert_eq!(
        harness.gateway.events().await,
        vec![format!("sos_offer:{}", second)]
    );
    let event: Value = serde_json::from_str(&global_rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "PENDING_CLINIC_CONFIRM");
    assert_eq!(event["clinicId"], second.to_string());
}

#[tokio::test]
async fn test_final_decline_cancels_with_an_explanation() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let only = Uuid::new_v4();

    let mut cancelled = booking_row(booking_id, owner_id, "CANCELLED");
    cancelled["cancellation_reason"] = json!("No clinic could take this emergency right now");
    cancelled["cancelled_by"] = json!("system");

    mount_fetch(&mock_server, &booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM")).await;
    mount_transition(&mock_server, booking_id, &cancelled, 1).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &session(vec![only], 0))
        .await
        .unwrap();
    let mut global_rx = harness.events.subscribe_global();

    let outcome = harness
        .service
        .process_confirmation(booking_id, decline_from(only))
        .await
        .unwrap();

    let booking = assert_matches!(outcome, MatchOutcome::Cancelled(b) => b);
    assert_eq!(booking.status, BookingStatus::Cancelled);

    // Nobody else was offered the booking and the session is gone.
    assert!(harness.gateway.events().await.is_empty());
    assert_eq!(harness.sessions.load(booking_id).await.unwrap(), None);

    let event: Value = serde_json::from_str(&global_rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "CANCELLED");
    assert!(event["message"]
        .as_str()
        .unwrap()
        .contains("No clinic could take"));

    let requests = mock_server.received_requests().await.unwrap();
    let patch = requests
        .iter()
        .find(|r| r.method.as_str() == "PATCH" && r.url.path() == "/rest/v1/bookings")
        .unwrap();
    let body: Value = serde_json::from_slice(&patch.body).unwrap();
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(body["cancelled_by"], "system");
    assert!(body["cancellation_reason"]
        .as_str()
        .unwrap()
        .contains("No clinic could take"));
}

#[tokio::test]
async fn test_response_from_a_clinic_not_holding_the_offer_is_rejected() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let current = Uuid::new_v4();
    let impostor = Uuid::new_v4();

    mount_fetch(&mock_server, &booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM")).await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/bookings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &session(vec![current, impostor], 0))
        .await
        .unwrap();

    let err = harness
        .service
        .process_confirmation(booking_id, accept_from(impostor, None))
        .await
        .unwrap_err();

    assert_matches!(err, SosError::Conflict(msg) if msg.contains("different clinic"));
    let unchanged = harness.sessions.load(booking_id).await.unwrap().unwrap();
    assert_eq!(unchanged.index, 0);
}

#[tokio::test]
async fn test_response_after_matching_settled_names_the_required_state() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    mount_fetch(&mock_server, &booking_row(booking_id, owner_id, "CONFIRMED")).await;

    let harness = harness(&mock_server.uri());
    let err = harness
        .service
        .process_confirmation(booking_id, decline_from(Uuid::new_v4()))
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("PENDING_CLINIC_CONFIRM"), "got: {}", message);
    assert!(message.contains("CONFIRMED"), "got: {}", message);
}

#[tokio::test]
async fn test_lost_lease_makes_a_clinic_response_a_no_op() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let clinic_id = Uuid::new_v4();

    mount_fetch(&mock_server, &booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM")).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &session(vec![clinic_id], 0))
        .await
        .unwrap();
    assert!(harness.lease.acquire(booking_id).await.unwrap());

    let outcome = harness
        .service
        .process_confirmation(booking_id, accept_from(clinic_id, None))
        .await
        .unwrap();

    assert_matches!(outcome, MatchOutcome::AlreadyHandled);
    // The booking was never even fetched.
    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

// ===== TIMEOUT SWEEP =====

#[tokio::test]
async fn test_timeout_sweep_escalates_a_stale_offer_exactly_once() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    let pending = booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM");
    mount_awaiting_list(&mock_server, json!([pending])).await;
    mount_fetch(&mock_server, &pending).await;
    mount_clinic_lookup(&mock_server, &clinic_row(second, "Midtown Animal Hospital", 51.58, -0.05)).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &stale_session(vec![first, second], 0))
        .await
        .unwrap();

    let summary = harness.service.check_timeouts().await.unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.escalated, 1);
    assert_eq!(summary.cancelled, 0);

    let advanced = harness.sessions.load(booking_id).await.unwrap().unwrap();
    assert_eq!(advanced.index, 1);

    // The next pass sees a fresh offer clock and leaves the booking alone.
    let second_pass = harness.service.check_timeouts().await.unwrap();
    assert_eq!(second_pass.examined, 1);
    assert_eq!(second_pass.escalated, 0);

    assert_eq!(
        harness.gateway.events().await,
        vec![format!("sos_offer:{}", second)]
    );
}

#[tokio::test]
async fn test_timeout_sweep_skips_a_booking_whose_lease_is_held() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    let pending = booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM");
    mount_awaiting_list(&mock_server, json!([pending])).await;
    mount_fetch(&mock_server, &pending).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &stale_session(vec![Uuid::new_v4(), Uuid::new_v4()], 0))
        .await
        .unwrap();
    assert!(harness.lease.acquire(booking_id).await.unwrap());

    let summary = harness.service.check_timeouts().await.unwrap();
    assert_eq!(summary.raced, 1);
    assert_eq!(summary.escalated, 0);

    // The offer clock was not touched and nobody new was notified.
    let untouched = harness.sessions.load(booking_id).await.unwrap().unwrap();
    assert_eq!(untouched.index, 0);
    assert!(harness.gateway.events().await.is_empty());
}

#[tokio::test]
async fn test_sweep_cancels_a_booking_whose_session_expired() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    let pending = booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM");
    let mut cancelled = booking_row(booking_id, owner_id, "CANCELLED");
    cancelled["cancelled_by"] = json!("system");

    mount_awaiting_list(&mock_server, json!([pending])).await;
    mount_fetch(&mock_server, &pending).await;
    mount_transition(&mock_server, booking_id, &cancelled, 1).await;

    let harness = harness(&mock_server.uri());
    let mut global_rx = harness.events.subscribe_global();

    let summary = harness.service.check_timeouts().await.unwrap();
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.escalated, 0);

    let event: Value = serde_json::from_str(&global_rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "CANCELLED");
    assert!(event["message"].as_str().unwrap().contains("expired"));

    let requests = mock_server.received_requests().await.unwrap();
    let patch = requests
        .iter()
        .find(|r| r.method.as_str() == "PATCH" && r.url.path() == "/rest/v1/bookings")
        .unwrap();
    let body: Value = serde_json::from_slice(&patch.body).unwrap();
    assert!(body["cancellation_reason"].as_str().unwrap().contains("expired"));
}

#[tokio::test]
async fn test_sweep_leaves_fresh_offers_alone() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    let pending = booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM");
    mount_awaiting_list(&mock_server, json!([pending])).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &session(vec![Uuid::new_v4()], 0))
        .await
        .unwrap();

    let summary = harness.service.check_timeouts().await.unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.escalated, 0);
    assert_eq!(summary.cancelled, 0);
    assert_eq!(summary.raced, 0);
}

// ===== OWNER CANCEL AND STATUS =====

#[tokio::test]
async fn test_owner_cancel_clears_the_session_and_broadcasts() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    let mut cancelled = booking_row(booking_id, owner_id, "CANCELLED");
    cancelled["cancelled_by"] = json!("owner");

    mount_fetch(&mock_server, &booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM")).await;
    mount_transition(&mock_server, booking_id, &cancelled, 1).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &session(vec![Uuid::new_v4()], 0))
        .await
        .unwrap();
    let mut global_rx = harness.events.subscribe_global();

    let outcome = harness
        .service
        .cancel_matching(booking_id, owner_id)
        .await
        .unwrap();

    assert_matches!(outcome, MatchOutcome::Cancelled(_));
    assert_eq!(harness.sessions.load(booking_id).await.unwrap(), None);

    let event: Value = serde_json::from_str(&global_rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "CANCELLED");
    assert!(event["message"].as_str().unwrap().contains("pet owner"));

    let requests = mock_server.received_requests().await.unwrap();
    let patch = requests
        .iter()
        .find(|r| r.method.as_str() == "PATCH" && r.url.path() == "/rest/v1/bookings")
        .unwrap();
    let body: Value = serde_json::from_slice(&patch.body).unwrap();
    assert_eq!(body["cancelled_by"], "owner");
}

#[tokio::test]
async fn test_only_the_owner_can_cancel_matching() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    mount_fetch(&mock_server, &booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM")).await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/bookings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let harness = harness(&mock_server.uri());
    let err = harness
        .service
        .cancel_matching(booking_id, Uuid::new_v4())
        .await
        .unwrap_err();

    assert_matches!(err, SosError::Security(_));
}

#[tokio::test]
async fn test_status_reports_the_clinic_currently_holding_the_offer() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let clinics = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

    mount_fetch(&mock_server, &booking_row(booking_id, owner_id, "PENDING_CLINIC_CONFIRM")).await;

    let harness = harness(&mock_server.uri());
    harness
        .sessions
        .save(booking_id, &session(clinics.clone(), 1))
        .await
        .unwrap();

    let status = harness
        .service
        .get_matching_status(booking_id, owner_id)
        .await
        .unwrap();

    assert_eq!(status.clinic_id, Some(clinics[1]));
    assert_eq!(status.position, Some(2));
    assert_eq!(status.candidates, Some(3));
}

#[tokio::test]
async fn test_status_is_stable_once_matching_settled() {
    let mock_server = MockServer::start().await;
    let owner_id = Uuid::new_v4();
    let booking_id = Uuid::new_v4();

    let mut confirmed = booking_row(booking_id, owner_id, "CONFIRMED");
    confirmed["clinic_id"] = json!(Uuid::new_v4());
    mount_fetch(&mock_server, &confirmed).await;

    let harness = harness(&mock_server.uri());

    let first = harness
        .service
        .get_matching_status(booking_id, owner_id)
        .await
        .unwrap();
    let second = harness
        .service
        .get_matching_status(booking_id, owner_id)
        .await
        .unwrap();

    assert_eq!(first.booking.status, BookingStatus::Confirmed);
    assert_eq!(second.booking.status, BookingStatus::Confirmed);
    assert_eq!(first.clinic_id, second.clinic_id);
    assert_eq!(first.position, None);
    assert_eq!(first.candidates, None);

    let err = harness
        .service
        .get_matching_status(booking_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, SosError::Security(_));
}
