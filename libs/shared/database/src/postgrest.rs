use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Which uniqueness constraint a rejected write ran into. Callers decide
/// retry-ability by matching on this, never by inspecting message strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// `bookings_booking_code_key` - the generated booking code is taken.
    BookingCode,
    /// `booking_slots_slot_active_key` - the slot already belongs to an active booking.
    SlotTaken,
    /// `bookings_pet_active_overlap_key` - the pet already has an active booking overlapping in time.
    PetOverlap,
    /// Any other constraint, identified by name where the store reported one.
    Other(String),
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::BookingCode => write!(f, "booking code already in use"),
            ConflictKind::SlotTaken => write!(f, "slot already reserved by an active booking"),
            ConflictKind::PetOverlap => write!(f, "pet already has an active booking at this time"),
            ConflictKind::Other(name) => write!(f, "constraint violated: {}", name),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(ConflictKind),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("store rejected credentials: {0}")]
    Auth(String),

    #[error("store error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("store request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to decode store response: {0}")]
    Decode(String),
}

const KNOWN_CONSTRAINTS: &[(&str, ConflictKind)] = &[
    ("bookings_booking_code_key", ConflictKind::BookingCode),
    ("booking_slots_slot_active_key", ConflictKind::SlotTaken),
    ("bookings_pet_active_overlap_key", ConflictKind::PetOverlap),
];

pub struct StoreClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl StoreClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.store_url.clone(),
            api_key: config.store_api_key.clone(),
        }
    }

    fn get_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(key) = HeaderValue::from_str(&self.api_key) {
            headers.insert("apikey", key);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        headers
    }

    pub async fn request<T>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        self.request_with_headers(method, path, body, None).await
    }

    pub async fn request_with_headers<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut headers = self.get_headers();
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Store error ({}): {}", status, error_text);
            return Err(classify_failure(status, &error_text));
        }

        // Mutations issued without a Prefer header come back empty.
        let raw = response.text().await?;
        let payload = if raw.is_empty() { "null".to_string() } else { raw };
        serde_json::from_str(&payload).map_err(|e| StoreError::Decode(e.to_string()))
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}

/// Maps an error response onto the typed surface. Constraint names only ever
/// get inspected here; everything above this layer matches on `ConflictKind`.
fn classify_failure(status: StatusCode, body: &str) -> StoreError {
    match status.as_u16() {
        401 | 403 => StoreError::Auth(body.to_string()),
        404 => StoreError::NotFound(body.to_string()),
        409 => StoreError::Conflict(classify_conflict(body)),
        _ => StoreError::Api {
            status: status.as_u16(),
            message: body.to_string(),
        },
    }
}

fn classify_conflict(body: &str) -> ConflictKind {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let message = parsed
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or(body);

    for (constraint, kind) in KNOWN_CONSTRAINTS {
        if message.contains(constraint) {
            return kind.clone();
        }
    }

    ConflictKind::Other(message.to_string())
}
