// Service configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Every component receives the pieces it needs through its
// constructor; nothing reads the environment after startup.

use std::net::SocketAddr;
use std::time::Duration;

use crate::db::pool::PoolConfig;

const DEV_SFU_API_SECRET: &str = "callsync_local_development_sfu_secret_32_chars";

/// Timing and sizing knobs for the two reconciliation jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub dialer_interval: Duration,
    pub synchronizer_interval: Duration,
    /// How long a `cancelling`/`removing` row survives after being marked.
    pub remove_temporary_after: Duration,
    /// How long a `beingInvited` row may ring before it is reaped.
    pub remove_dangling_being_invited_after: Duration,
    /// Missed SFU checks tolerated before an `inCall` row is declared orphaned.
    pub orphan_user_iteration_limit: i32,
    /// Page size for scanning the call-state table.
    pub batch_size: usize,
    /// Deadline for every SFU / chat-service call.
    pub external_call_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            dialer_interval: Duration::from_secs(2),
            synchronizer_interval: Duration::from_secs(10),
            remove_temporary_after: Duration::from_secs(10),
            remove_dangling_being_invited_after: Duration::from_secs(60),
            orphan_user_iteration_limit: 3,
            batch_size: 200,
            external_call_timeout: Duration::from_millis(5000),
        }
    }
}

/// Connection details for the LiveKit-compatible media server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfuConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

/// Core service configuration.
///
/// Constructed via [`ServiceConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub pool: PoolConfig,
    /// Log filter directive (e.g. `info`, `callsync_service=debug`).
    pub log_filter: String,
    pub log_json: bool,
    pub reconcile: ReconcileConfig,
    pub task_lock_ttl: Duration,
    pub sfu: SfuConfig,
    pub chat_url: String,
    /// Where outbound events are POSTed. `None` keeps them in-process.
    pub events_url: Option<String>,
}

impl ServiceConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CALLSYNC_HOST` | `0.0.0.0` |
    /// | `CALLSYNC_PORT` | `8080` |
    /// | `CALLSYNC_DATABASE_URL` | *(none: in-memory store)* |
    /// | `CALLSYNC_DB_MIN_CONNECTIONS` | `2` |
    /// | `CALLSYNC_DB_MAX_CONNECTIONS` | `20` |
    /// | `CALLSYNC_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    /// | `CALLSYNC_LOG_FILTER` | `info` |
    /// | `CALLSYNC_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `CALLSYNC_DIALER_INTERVAL_SECS` | `2` |
    /// | `CALLSYNC_SYNCHRONIZER_INTERVAL_SECS` | `10` |
    /// | `CALLSYNC_REMOVE_TEMPORARY_AFTER_SECS` | `10` |
    /// | `CALLSYNC_REMOVE_DANGLING_BEING_INVITED_AFTER_SECS` | `60` |
    /// | `CALLSYNC_ORPHAN_USER_ITERATION_LIMIT` | `3` |
    /// | `CALLSYNC_BATCH_SIZE` | `200` |
    /// | `CALLSYNC_EXTERNAL_CALL_TIMEOUT_MS` | `5000` |
    /// | `CALLSYNC_TASK_LOCK_TTL_SECS` | `30` |
    /// | `CALLSYNC_SFU_URL` | `http://localhost:7880` |
    /// | `CALLSYNC_SFU_API_KEY` | `devkey` |
    /// | `CALLSYNC_SFU_API_SECRET` | dev-only placeholder |
    /// | `CALLSYNC_CHAT_URL` | `http://localhost:1235` |
    /// | `CALLSYNC_EVENTS_URL` | *(none)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed = |key: &str| env(key).ok().and_then(|v| v.trim().parse::<u64>().ok());
        let secs = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_secs).unwrap_or(default)
        };

        let host = env("CALLSYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CALLSYNC_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let pool_defaults = PoolConfig::default();
        let pool = PoolConfig {
            min_connections: parsed("CALLSYNC_DB_MIN_CONNECTIONS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(pool_defaults.min_connections),
            max_connections: parsed("CALLSYNC_DB_MAX_CONNECTIONS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(pool_defaults.max_connections),
            acquire_timeout: secs("CALLSYNC_DB_ACQUIRE_TIMEOUT_SECS", pool_defaults.acquire_timeout),
        };

        let defaults = ReconcileConfig::default();
        let reconcile = ReconcileConfig {
            dialer_interval: secs("CALLSYNC_DIALER_INTERVAL_SECS", defaults.dialer_interval),
            synchronizer_interval: secs(
                "CALLSYNC_SYNCHRONIZER_INTERVAL_SECS",
                defaults.synchronizer_interval,
            ),
            remove_temporary_after: secs(
                "CALLSYNC_REMOVE_TEMPORARY_AFTER_SECS",
                defaults.remove_temporary_after,
            ),
            remove_dangling_being_invited_after: secs(
                "CALLSYNC_REMOVE_DANGLING_BEING_INVITED_AFTER_SECS",
                defaults.remove_dangling_being_invited_after,
            ),
            orphan_user_iteration_limit: parsed("CALLSYNC_ORPHAN_USER_ITERATION_LIMIT")
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(defaults.orphan_user_iteration_limit),
            batch_size: parsed("CALLSYNC_BATCH_SIZE")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.batch_size),
            external_call_timeout: parsed("CALLSYNC_EXTERNAL_CALL_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.external_call_timeout),
        };

        let sfu = SfuConfig {
            url: env("CALLSYNC_SFU_URL").unwrap_or_else(|_| "http://localhost:7880".into()),
            api_key: env("CALLSYNC_SFU_API_KEY").unwrap_or_else(|_| "devkey".into()),
            api_secret: env("CALLSYNC_SFU_API_SECRET")
                .unwrap_or_else(|_| DEV_SFU_API_SECRET.into()),
        };

        Self {
            listen_addr,
            database_url: env("CALLSYNC_DATABASE_URL").ok(),
            pool,
            log_filter: env("CALLSYNC_LOG_FILTER").unwrap_or_else(|_| "info".into()),
            log_json: env("CALLSYNC_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            reconcile,
            task_lock_ttl: secs("CALLSYNC_TASK_LOCK_TTL_SECS", Duration::from_secs(30)),
            sfu,
            chat_url: env("CALLSYNC_CHAT_URL").unwrap_or_else(|_| "http://localhost:1235".into()),
            events_url: env("CALLSYNC_EVENTS_URL").ok(),
        }
    }

    /// Returns true when using the development-only SFU secret.
    pub fn is_dev_sfu_secret(&self) -> bool {
        self.sfu.api_secret == DEV_SFU_API_SECRET
    }
}

/// Convert a config duration into a chrono delta for timestamp arithmetic.
pub fn chrono_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
