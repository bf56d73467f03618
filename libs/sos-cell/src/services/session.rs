use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::models::{MatchSession, SosError};

// One string key per session field, all expiring together.
fn clinics_key(booking_id: Uuid) -> String {
    format!("sos:match:{}:clinics", booking_id)
}

fn index_key(booking_id: Uuid) -> String {
    format!("sos:match:{}:index", booking_id)
}

fn created_key(booking_id: Uuid) -> String {
    format!("sos:match:{}:created_at", booking_id)
}

fn notified_key(booking_id: Uuid) -> String {
    format!("sos:match:{}:notified_at", booking_id)
}

/// Persisted matching state. Redis backs deployments; the in-memory
/// implementation backs tests and single-process development.
#[async_trait]
pub trait SosSessionRepository: Send + Sync {
    async fn save(&self, booking_id: Uuid, session: &MatchSession) -> Result<(), SosError>;
    /// `None` means no session exists any more, expired or deleted alike.
    async fn load(&self, booking_id: Uuid) -> Result<Option<MatchSession>, SosError>;
    async fn delete(&self, booking_id: Uuid) -> Result<(), SosError>;
}

pub async fn create_redis_pool(config: &AppConfig) -> Result<Pool, SosError> {
    let cfg = Config::from_url(config.redis_url.clone());
    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| SosError::Session(format!("Failed to create Redis pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!("Redis connection established");

    Ok(pool)
}

pub struct RedisSessionRepository {
    pool: Pool,
    session_ttl_secs: i64,
}

impl RedisSessionRepository {
    pub fn new(pool: Pool, session_ttl_secs: i64) -> Self {
        Self {
            pool,
            session_ttl_secs,
        }
    }

    /// TTL counted from the session's own `created_at`, so a re-save after
    /// an escalation never extends the overall matching window.
    fn remaining_ttl(&self, created_at: DateTime<Utc>) -> u64 {
        let elapsed = (Utc::now() - created_at).num_seconds().max(0);
        (self.session_ttl_secs - elapsed).max(60) as u64
    }
}

#[async_trait]
impl SosSessionRepository for RedisSessionRepository {
    async fn save(&self, booking_id: Uuid, session: &MatchSession) -> Result<(), SosError> {
        let mut conn = self.pool.get().await?;
        let ttl = self.remaining_ttl(session.created_at);
        let clinics = serde_json::to_string(&session.clinic_ids)?;

        let _: () = redis::pipe()
            .cmd("SETEX")
            .arg(clinics_key(booking_id))
            .arg(ttl)
            .arg(clinics)
            .ignore()
            .cmd("SETEX")
            .arg(index_key(booking_id))
            .arg(ttl)
            .arg(session.index)
            .ignore()
            .cmd("SETEX")
            .arg(created_key(booking_id))
            .arg(ttl)
            .arg(session.created_at.to_rfc3339())
            .ignore()
            .cmd("SETEX")
            .arg(notified_key(booking_id))
            .arg(ttl)
            .arg(session.notified_at.to_rfc3339())
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(
            "Saved match session for booking {} (clinic {} of {})",
            booking_id,
            session.index + 1,
            session.clinic_ids.len()
        );
        Ok(())
    }

    async fn load(&self, booking_id: Uuid) -> Result<Option<MatchSession>, SosError> {
        let mut conn = self.pool.get().await?;
        let (clinics, index, created_at, notified_at): (
            Option<String>,
            Option<usize>,
            Option<String>,
            Option<String>,
        ) = redis::pipe()
            .get(clinics_key(booking_id))
            .get(index_key(booking_id))
            .get(created_key(booking_id))
            .get(notified_key(booking_id))
            .query_async(&mut conn)
            .await?;

        let (Some(clinics), Some(index), Some(created_at)) = (clinics, index, created_at) else {
            return Ok(None);
        };

        let clinic_ids: Vec<Uuid> = match serde_json::from_str(&clinics) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Corrupt clinic list for booking {}: {}", booking_id, e);
                return Ok(None);
            }
        };
        let created_at = match DateTime::parse_from_rfc3339(&created_at) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                warn!("Corrupt created_at for booking {}: {}", booking_id, e);
                return Ok(None);
            }
        };
        // notified_at can expire on its own; the timeout clock then falls
        // back to created_at.
        let notified_at = notified_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(created_at);

        Ok(Some(MatchSession {
            clinic_ids,
            index,
            created_at,
            notified_at,
        }))
    }

    async fn delete(&self, booking_id: Uuid) -> Result<(), SosError> {
        let mut conn = self.pool.get().await?;
        let keys = [
            clinics_key(booking_id),
            index_key(booking_id),
            created_key(booking_id),
            notified_key(booking_id),
        ];
        let _: () = conn.del(&keys[..]).await?;
        debug!("Deleted match session for booking {}", booking_id);
        Ok(())
    }
}

/// Process-local sessions with the same contract as Redis, minus
/// cross-process visibility.
#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<Uuid, MatchSession>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SosSessionRepository for InMemorySessionRepository {
    async fn save(&self, booking_id: Uuid, session: &MatchSession) -> Result<(), SosError> {
        self.sessions
            .write()
            .await
            .insert(booking_id, session.clone());
        Ok(())
    }

    async fn load(&self, booking_id: Uuid) -> Result<Option<MatchSession>, SosError> {
        Ok(self.sessions.read().await.get(&booking_id).cloned())
    }

    async fn delete(&self, booking_id: Uuid) -> Result<(), SosError> {
        self.sessions.write().await.remove(&booking_id);
        Ok(())
    }
}
