use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::SosError;

fn lock_key(booking_id: Uuid) -> String {
    format!("sos:lock:{}", booking_id)
}

/// Short exclusive lease on one booking's matching state. Clinic responses,
/// owner cancels and the timeout sweep all pass through here, so a booking
/// advances at most one step no matter who raced.
#[async_trait]
pub trait BookingLease: Send + Sync {
    /// True when this caller now holds the lease.
    async fn acquire(&self, booking_id: Uuid) -> Result<bool, SosError>;
    async fn release(&self, booking_id: Uuid) -> Result<(), SosError>;
}

/// `SET NX EX` lease. The TTL bounds how long a crashed holder can block
/// a booking. The stored value is the acquisition time, for inspection.
pub struct RedisBookingLease {
    pool: Pool,
    lease_ttl_secs: u64,
}

impl RedisBookingLease {
    pub fn new(pool: Pool, lease_ttl_secs: u64) -> Self {
        Self {
            pool,
            lease_ttl_secs,
        }
    }
}

#[async_trait]
impl BookingLease for RedisBookingLease {
    async fn acquire(&self, booking_id: Uuid) -> Result<bool, SosError> {
        let mut conn = self.pool.get().await?;
        let outcome: Option<String> = redis::cmd("SET")
            .arg(lock_key(booking_id))
            .arg(Utc::now().to_rfc3339())
            .arg("NX")
            .arg("EX")
            .arg(self.lease_ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(outcome.is_some())
    }

    async fn release(&self, booking_id: Uuid) -> Result<(), SosError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(lock_key(booking_id)).await?;
        Ok(())
    }
}

/// Mutex-guarded lease for tests and single-process runs. Entries expire by
/// timestamp the same way the Redis TTL would.
pub struct InProcessLease {
    ttl: Duration,
    held: Mutex<HashMap<Uuid, Instant>>,
}

impl InProcessLease {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BookingLease for InProcessLease {
    async fn acquire(&self, booking_id: Uuid) -> Result<bool, SosError> {
        let mut held = self.held.lock().await;
        if let Some(taken_at) = held.get(&booking_id) {
            if taken_at.elapsed() < self.ttl {
                return Ok(false);
            }
        }
        held.insert(booking_id, Instant::now());
        Ok(true)
    }

    async fn release(&self, booking_id: Uuid) -> Result<(), SosError> {
        self.held.lock().await.remove(&booking_id);
        Ok(())
    }
}
