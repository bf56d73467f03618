use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::{StoreClient, StoreError};

/// The slice of a booking that notifications need. Kept deliberately small so
/// every cell can hand one over without dragging its own models across crates.
#[derive(Debug, Clone)]
pub struct BookingNotice {
    pub booking_id: Uuid,
    pub booking_code: String,
    pub clinic_id: Option<Uuid>,
    pub owner_id: Uuid,
    pub pet_id: Uuid,
}

/// Outbound notifications. Fire-and-forget: implementations log failures and
/// never surface them, so a broken notification channel cannot fail a booking.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify_booking_created(&self, notice: &BookingNotice);
    async fn notify_check_in(&self, notice: &BookingNotice);
    async fn notify_completed(&self, notice: &BookingNotice);
    async fn notify_on_way(&self, notice: &BookingNotice, eta_minutes: Option<i64>);
    async fn notify_shift_assigned(&self, staff_id: Uuid, clinic_id: Uuid, work_date: NaiveDate);
    async fn notify_sos_offer(&self, clinic_id: Uuid, notice: &BookingNotice);
}

/// Writes notification rows for the platform's delivery pipeline to pick up.
/// Clinic-wide notices fan out to that clinic's managers.
pub struct StoreNotificationGateway {
    store: Arc<StoreClient>,
}

impl StoreNotificationGateway {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    async fn clinic_managers(&self, clinic_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let path = format!(
            "/rest/v1/clinic_staff?clinic_id=eq.{}&role=eq.MANAGER&select=user_id",
            clinic_id
        );
        let rows: Vec<Value> = self.store.request(Method::GET, &path, None).await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get("user_id").and_then(Value::as_str))
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .collect())
    }

    async fn insert_rows(&self, rows: Vec<Value>) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let _: Value = self
            .store
            .request(Method::POST, "/rest/v1/notifications", Some(Value::Array(rows)))
            .await?;
        Ok(())
    }

    fn row(recipient_id: Uuid, kind: &str, booking_id: Option<Uuid>, payload: Value) -> Value {
        json!({
            "recipient_id": recipient_id,
            "kind": kind,
            "booking_id": booking_id,
            "payload": payload,
            "created_at": Utc::now().to_rfc3339(),
        })
    }

    async fn deliver_to_clinic(&self, clinic_id: Uuid, kind: &str, notice: &BookingNotice, payload: Value) {
        let managers = match self.clinic_managers(clinic_id).await {
            Ok(managers) => managers,
            Err(e) => {
                warn!("Could not resolve managers for clinic {}: {}", clinic_id, e);
                return;
            }
        };

        if managers.is_empty() {
            debug!("Clinic {} has no managers to notify", clinic_id);
            return;
        }

        let rows = managers
            .into_iter()
            .map(|manager| Self::row(manager, kind, Some(notice.booking_id), payload.clone()))
            .collect();

        if let Err(e) = self.insert_rows(rows).await {
            warn!("Failed to deliver {} notification for booking {}: {}", kind, notice.booking_id, e);
        }
    }

    async fn deliver_to_owner(&self, kind: &str, notice: &BookingNotice, payload: Value) {
        let row = Self::row(notice.owner_id, kind, Some(notice.booking_id), payload);
        if let Err(e) = self.insert_rows(vec![row]).await {
            warn!("Failed to deliver {} notification for booking {}: {}", kind, notice.booking_id, e);
        }
    }
}

#[async_trait]
impl NotificationGateway for StoreNotificationGateway {
    async fn notify_booking_created(&self, notice: &BookingNotice) {
        let Some(clinic_id) = notice.clinic_id else {
            debug!("Booking {} has no clinic yet, skipping creation notice", notice.booking_id);
            return;
        };
        let payload = json!({
            "booking_code": notice.booking_code,
            "pet_id": notice.pet_id,
        });
        self.deliver_to_clinic(clinic_id, "BOOKING_CREATED", notice, payload).await;
    }

    async fn notify_check_in(&self, notice: &BookingNotice) {
        let payload = json!({ "booking_code": notice.booking_code });
        self.deliver_to_owner("BOOKING_CHECK_IN", notice, payload).await;
    }

    async fn notify_completed(&self, notice: &BookingNotice) {
        let payload = json!({ "booking_code": notice.booking_code });
        self.deliver_to_owner("BOOKING_COMPLETED", notice, payload).await;
    }

    async fn notify_on_way(&self, notice: &BookingNotice, eta_minutes: Option<i64>) {
        let payload = json!({
            "booking_code": notice.booking_code,
            "eta_minutes": eta_minutes,
        });
        self.deliver_to_owner("BOOKING_ON_WAY", notice, payload).await;
    }

    async fn notify_shift_assigned(&self, staff_id: Uuid, clinic_id: Uuid, work_date: NaiveDate) {
        let payload = json!({
            "clinic_id": clinic_id,
            "work_date": work_date,
        });
        let row = Self::row(staff_id, "SHIFT_ASSIGNED", None, payload);
        if let Err(e) = self.insert_rows(vec![row]).await {
            warn!("Failed to deliver shift notification to staff {}: {}", staff_id, e);
        }
    }

    async fn notify_sos_offer(&self, clinic_id: Uuid, notice: &BookingNotice) {
        let payload = json!({
            "booking_code": notice.booking_code,
            "pet_id": notice.pet_id,
        });
        self.deliver_to_clinic(clinic_id, "SOS_OFFER", notice, payload).await;
    }
}
