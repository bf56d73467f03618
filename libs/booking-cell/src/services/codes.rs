use std::sync::Arc;

use chrono::NaiveDate;
use regex::Regex;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use shared_database::StoreClient;

use crate::models::BookingError;

/// Human-facing booking codes: `BK-YYYYMMDD-NNNN`, sequence counted per
/// clinic and day. Uniqueness is enforced by storage; the allocator only
/// proposes the next free-looking code.
pub struct BookingCodeAllocator {
    store: Arc<StoreClient>,
}

impl BookingCodeAllocator {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Proposes a code for the given attempt. The sequence is re-read every
    /// attempt and bumped by the attempt number, so two retries never propose
    /// the same code twice and parallel writers converge past each other.
    pub async fn next_code(
        &self,
        clinic_id: Option<Uuid>,
        date: NaiveDate,
        attempt: u32,
    ) -> Result<String, BookingError> {
        let day = date.format("%Y%m%d").to_string();
        let clinic_filter = match clinic_id {
            Some(id) => format!("clinic_id=eq.{}", id),
            None => "clinic_id=is.null".to_string(),
        };
        let path = format!(
            "/rest/v1/bookings?{}&booking_code=like.BK-{}-*&select=booking_code&order=booking_code.desc&limit=1",
            clinic_filter, day
        );

        let rows: Vec<Value> = self.store.request(Method::GET, &path, None).await?;
        let max_sequence = rows
            .first()
            .and_then(|row| row.get("booking_code"))
            .and_then(Value::as_str)
            .and_then(parse_sequence)
            .unwrap_or(0);

        let code = format_code(date, max_sequence + attempt);
        debug!("Proposing booking code {} (attempt {})", code, attempt);
        Ok(code)
    }
}

pub fn format_code(date: NaiveDate, sequence: u32) -> String {
    format!("BK-{}-{:04}", date.format("%Y%m%d"), sequence)
}

/// Extracts the numeric sequence from a well-formed code. Codes that drift
/// from the format rank as absent rather than poisoning the allocator.
pub fn parse_sequence(code: &str) -> Option<u32> {
    let pattern = Regex::new(r"^BK-\d{8}-(\d{4,})$").unwrap();
    pattern
        .captures(code)
        .and_then(|caps| caps.get(1))
        .and_then(|seq| seq.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    #[test]
    fn codes_carry_date_and_zero_padded_sequence() {
        assert_eq!(format_code(day(), 1), "BK-20250310-0001");
        assert_eq!(format_code(day(), 412), "BK-20250310-0412");
    }

    #[test]
    fn sequence_overflowing_four_digits_still_parses() {
        assert_eq!(format_code(day(), 10_000), "BK-20250310-10000");
        assert_eq!(parse_sequence("BK-20250310-10000"), Some(10_000));
    }

    #[test]
    fn round_trip_recovers_the_sequence() {
        assert_eq!(parse_sequence(&format_code(day(), 7)), Some(7));
    }

    #[test]
    fn malformed_codes_are_ignored() {
        assert_eq!(parse_sequence("BK-2025031-0001"), None);
        assert_eq!(parse_sequence("XX-20250310-0001"), None);
        assert_eq!(parse_sequence("BK-20250310-01"), None);
        assert_eq!(parse_sequence(""), None);
    }
}
