use std::time::Duration;

use lapor_domain::realtime::RealtimeConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub jwt_secret: String,
    pub auth_dev_bypass_enabled: bool,
    pub realtime_subscriber_buffer: usize,
    pub realtime_heartbeat_interval_ms: u64,
    pub realtime_liveness_deadline_ms: u64,
    pub realtime_sweep_interval_ms: u64,
    pub realtime_stall_timeout_ms: u64,
    pub catchup_max_events: usize,
    pub catchup_window_ms: i64,
    pub journal_max_events: usize,
    pub catchup_cursor_secret: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "lapor")?
            .set_default("surreal_db", "realtime")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("auth_dev_bypass_enabled", false)?
            .set_default("realtime_subscriber_buffer", 64)?
            .set_default("realtime_heartbeat_interval_ms", 15_000)?
            .set_default("realtime_liveness_deadline_ms", 45_000)?
            .set_default("realtime_sweep_interval_ms", 10_000)?
            .set_default("realtime_stall_timeout_ms", 5_000)?
            .set_default("catchup_max_events", 500)?
            .set_default("catchup_window_ms", 86_400_000_i64)?
            .set_default("journal_max_events", 10_000)?
            .set_default("catchup_cursor_secret", "lapor-dev-cursor-secret")?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn uses_surreal(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("surreal")
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            subscriber_buffer: self.realtime_subscriber_buffer,
            heartbeat_interval: Duration::from_millis(self.realtime_heartbeat_interval_ms),
            liveness_deadline: Duration::from_millis(self.realtime_liveness_deadline_ms),
            sweep_interval: Duration::from_millis(self.realtime_sweep_interval_ms),
            stall_timeout: Duration::from_millis(self.realtime_stall_timeout_ms),
            catchup_max_events: self.catchup_max_events,
            catchup_window_ms: self.catchup_window_ms,
            journal_max_events: self.journal_max_events,
            cursor_secret: self.catchup_cursor_secret.clone(),
        }
    }
}
