use std::sync::Arc;

use shared_config::AppConfig;

use crate::models::SosError;
use crate::services::events::SosEventChannel;
use crate::services::lease::{BookingLease, RedisBookingLease};
use crate::services::matching::SosMatchService;
use crate::services::session::{create_redis_pool, RedisSessionRepository, SosSessionRepository};

/// Long-lived SOS wiring shared by the handlers and the timeout sweeper.
/// Built once at startup so the broadcast channels and the Redis pool
/// outlive any single request.
pub struct SosCellState {
    pub config: Arc<AppConfig>,
    pub matching: Arc<SosMatchService>,
    pub events: Arc<SosEventChannel>,
}

impl SosCellState {
    /// Production wiring: Redis-backed sessions and leases sharing one
    /// pool, plus fresh broadcast channels.
    pub async fn connect(config: Arc<AppConfig>) -> Result<Self, SosError> {
        let pool = create_redis_pool(&config).await?;
        let sessions: Arc<dyn SosSessionRepository> = Arc::new(RedisSessionRepository::new(
            pool.clone(),
            config.sos_session_ttl_secs,
        ));
        let lease: Arc<dyn BookingLease> =
            Arc::new(RedisBookingLease::new(pool, config.sos_lease_ttl_secs));
        let events = Arc::new(SosEventChannel::new());
        let matching = Arc::new(SosMatchService::new(
            &config,
            sessions,
            lease,
            events.clone(),
        ));

        Ok(Self {
            config,
            matching,
            events,
        })
    }

    /// Assemble from already-built parts; tests and embedded setups use
    /// this with the in-memory session store and in-process lease.
    pub fn with_parts(
        config: Arc<AppConfig>,
        matching: Arc<SosMatchService>,
        events: Arc<SosEventChannel>,
    ) -> Self {
        Self {
            config,
            matching,
            events,
        }
    }
}
