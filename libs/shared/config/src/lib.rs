use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_url: String,
    pub store_api_key: String,
    pub redis_url: String,
    pub bind_port: u16,
    /// Seconds a candidate clinic has to answer an SOS offer before the
    /// sweep escalates to the next one.
    pub sos_confirm_timeout_secs: i64,
    pub sos_sweep_interval_secs: u64,
    pub sos_search_radius_km: f64,
    pub sos_max_candidates: usize,
    pub sos_lease_ttl_secs: u64,
    pub sos_session_ttl_secs: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            store_url: env::var("STORE_URL")
                .unwrap_or_else(|_| {
                    warn!("STORE_URL not set, using empty value");
                    String::new()
                }),
            store_api_key: env::var("STORE_API_KEY")
                .unwrap_or_else(|_| {
                    warn!("STORE_API_KEY not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| {
                    warn!("REDIS_URL not set, using local default");
                    "redis://127.0.0.1:6379".to_string()
                }),
            bind_port: parse_var("BIND_PORT", 3000),
            sos_confirm_timeout_secs: parse_var("SOS_CONFIRM_TIMEOUT_SECS", 300),
            sos_sweep_interval_secs: parse_var("SOS_SWEEP_INTERVAL_SECS", 60),
            sos_search_radius_km: parse_var("SOS_SEARCH_RADIUS_KM", 15.0),
            sos_max_candidates: parse_var("SOS_MAX_CANDIDATES", 10),
            sos_lease_ttl_secs: parse_var("SOS_LEASE_TTL_SECS", 15),
            sos_session_ttl_secs: parse_var("SOS_SESSION_TTL_SECS", 21_600),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.store_url.is_empty() && !self.store_api_key.is_empty()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value, using default", name);
            default
        }),
        Err(_) => default,
    }
}
