//! Core configuration loading from environment variables or TOML.
//!
//! Values come from `LDAP_CORE_*` environment variables or from a TOML
//! document with the same keys. Invalid or missing values fall back to
//! defaults, and every value is clamped to a safe floor.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `LDAP_CORE_MAX_CONNECTIONS` | 1024 | Connection table capacity |
//! | `LDAP_CORE_WORKER_THREADS` | 0 | Worker threads (0 = CPU count) |
//! | `LDAP_CORE_WORKER_QUEUE_SIZE` | 1024 | Worker pool submit queue bound |
//! | `LDAP_CORE_PER_CONN_MAX_EXECUTING` | 0 | Per-connection executing cap (0 = half the pool) |
//! | `LDAP_CORE_MAX_PENDING` | 100 | Pending ceiling, anonymous connections |
//! | `LDAP_CORE_MAX_PENDING_AUTH` | 1000 | Pending ceiling, authenticated connections |
//! | `LDAP_CORE_IDLE_TIMEOUT` | 0 | Idle timeout in seconds (0 = never) |
//! | `LDAP_CORE_SWEEP_INTERVAL` | 5 | Idle sweep period in seconds |
//! | `LDAP_CORE_OP_POOL_MAX_FREE` | 1024 | Recycled operation bodies kept |
//! | `LDAP_CORE_OP_ARENA_CAPACITY` | 16384 | Per-operation arena bytes |
//! | `LDAP_CORE_WRITE_TIMEOUT_MS` | 30000 | Max wait on a blocked client write |
//! | `LDAP_CORE_SHUTDOWN_TIMEOUT` | 30 | Drain timeout in seconds |
//! | `LDAP_CORE_LOG_LEVEL` | info | Tracing filter |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::TableConfig;
use crate::operation::OpPoolConfig;
use crate::scheduler::{AdmissionLimits, WorkerPoolConfig};
use crate::telemetry::{LogConfig, LogFormat};

/// Errors from reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// All tunables of the request-processing core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub max_connections: usize,
    pub worker_threads: usize,
    pub worker_queue_size: usize,
    pub per_conn_max_executing: usize,
    pub max_pending: usize,
    pub max_pending_auth: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub op_pool_max_free: usize,
    pub op_arena_capacity: usize,
    pub write_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            worker_threads: 0,
            worker_queue_size: 1024,
            per_conn_max_executing: 0,
            max_pending: 100,
            max_pending_auth: 1000,
            idle_timeout_secs: 0,
            sweep_interval_secs: 5,
            op_pool_max_free: 1024,
            op_arena_capacity: 16 * 1024,
            write_timeout_ms: 30_000,
            shutdown_timeout_secs: 30,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub max_connections: usize,
    pub worker_threads: usize,
    pub worker_queue_size: usize,
    pub per_conn_max_executing: usize,
    pub max_pending: usize,
    pub max_pending_auth: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub op_pool_max_free: usize,
    pub op_arena_capacity: usize,
    pub write_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load configuration from environment variables.
///
/// Missing or invalid values fall back to defaults without panicking.
pub fn load() -> CoreConfig {
    let d = CoreConfig::default();
    let log_format = match std::env::var("LDAP_CORE_LOG_FORMAT").as_deref() {
        Ok("pretty") => LogFormat::Pretty,
        Ok("json") => LogFormat::Json,
        _ => d.log_format,
    };
    CoreConfig {
        max_connections: parse_usize("LDAP_CORE_MAX_CONNECTIONS", d.max_connections),
        worker_threads: parse_usize("LDAP_CORE_WORKER_THREADS", d.worker_threads),
        worker_queue_size: parse_usize("LDAP_CORE_WORKER_QUEUE_SIZE", d.worker_queue_size),
        per_conn_max_executing: parse_usize(
            "LDAP_CORE_PER_CONN_MAX_EXECUTING",
            d.per_conn_max_executing,
        ),
        max_pending: parse_usize("LDAP_CORE_MAX_PENDING", d.max_pending),
        max_pending_auth: parse_usize("LDAP_CORE_MAX_PENDING_AUTH", d.max_pending_auth),
        idle_timeout_secs: parse_u64("LDAP_CORE_IDLE_TIMEOUT", d.idle_timeout_secs),
        sweep_interval_secs: parse_u64("LDAP_CORE_SWEEP_INTERVAL", d.sweep_interval_secs),
        op_pool_max_free: parse_usize("LDAP_CORE_OP_POOL_MAX_FREE", d.op_pool_max_free),
        op_arena_capacity: parse_usize("LDAP_CORE_OP_ARENA_CAPACITY", d.op_arena_capacity),
        write_timeout_ms: parse_u64("LDAP_CORE_WRITE_TIMEOUT_MS", d.write_timeout_ms),
        shutdown_timeout_secs: parse_u64("LDAP_CORE_SHUTDOWN_TIMEOUT", d.shutdown_timeout_secs),
        log_level: std::env::var("LDAP_CORE_LOG_LEVEL").unwrap_or(d.log_level),
        log_format,
    }
    .normalized()
}

impl CoreConfig {
    /// Parse a TOML document. Unknown keys are ignored, absent keys default.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: CoreConfig = toml::from_str(text)?;
        Ok(cfg.normalized())
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Clamp every value to its floor.
    pub fn normalized(mut self) -> Self {
        self.max_connections = self.max_connections.max(1);
        self.worker_queue_size = self.worker_queue_size.max(1);
        self.max_pending = self.max_pending.max(1);
        self.max_pending_auth = self.max_pending_auth.max(self.max_pending); // auth >= anon
        self.sweep_interval_secs = self.sweep_interval_secs.max(1);
        self.shutdown_timeout_secs = self.shutdown_timeout_secs.max(1);
        self
    }

    /// Worker thread count after resolving "auto".
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }

    /// Per-connection executing cap after resolving "half the pool".
    pub fn resolved_per_conn_cap(&self) -> usize {
        if self.per_conn_max_executing == 0 {
            (self.resolved_worker_threads() / 2).max(1)
        } else {
            self.per_conn_max_executing
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn table_config(&self) -> TableConfig {
        TableConfig { max_connections: self.max_connections, idle_timeout: self.idle_timeout() }
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_threads: self.resolved_worker_threads(),
            queue_size: self.worker_queue_size,
            ..WorkerPoolConfig::default()
        }
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            per_conn_max_executing: self.resolved_per_conn_cap(),
            max_pending: self.max_pending,
            max_pending_auth: self.max_pending_auth,
        }
    }

    pub fn op_pool_config(&self) -> OpPoolConfig {
        OpPoolConfig { max_free: self.op_pool_max_free, arena_capacity: self.op_arena_capacity }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig { format: self.log_format, level: self.log_level.clone(), output_path: None }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            max_connections: self.max_connections,
            worker_threads: self.resolved_worker_threads(),
            worker_queue_size: self.worker_queue_size,
            per_conn_max_executing: self.resolved_per_conn_cap(),
            max_pending: self.max_pending,
            max_pending_auth: self.max_pending_auth,
            idle_timeout_secs: self.idle_timeout_secs,
            sweep_interval_secs: self.sweep_interval_secs,
            op_pool_max_free: self.op_pool_max_free,
            op_arena_capacity: self.op_arena_capacity,
            write_timeout_ms: self.write_timeout_ms,
            shutdown_timeout_secs: self.shutdown_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "LDAP_CORE_MAX_CONNECTIONS",
        "LDAP_CORE_WORKER_THREADS",
        "LDAP_CORE_WORKER_QUEUE_SIZE",
        "LDAP_CORE_PER_CONN_MAX_EXECUTING",
        "LDAP_CORE_MAX_PENDING",
        "LDAP_CORE_MAX_PENDING_AUTH",
        "LDAP_CORE_IDLE_TIMEOUT",
        "LDAP_CORE_SWEEP_INTERVAL",
        "LDAP_CORE_OP_POOL_MAX_FREE",
        "LDAP_CORE_OP_ARENA_CAPACITY",
        "LDAP_CORE_WRITE_TIMEOUT_MS",
        "LDAP_CORE_SHUTDOWN_TIMEOUT",
        "LDAP_CORE_LOG_LEVEL",
        "LDAP_CORE_LOG_FORMAT",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.max_connections, 1024);
        assert_eq!(cfg.max_pending, 100);
        assert_eq!(cfg.max_pending_auth, 1000);
        assert_eq!(cfg.idle_timeout(), None);
        assert!(cfg.resolved_worker_threads() >= 1);
        assert!(cfg.resolved_per_conn_cap() >= 1);
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("LDAP_CORE_MAX_CONNECTIONS", "8");
        std::env::set_var("LDAP_CORE_WORKER_THREADS", "6");
        std::env::set_var("LDAP_CORE_MAX_PENDING", "16");
        std::env::set_var("LDAP_CORE_IDLE_TIMEOUT", "300");
        std::env::set_var("LDAP_CORE_LOG_FORMAT", "pretty");
        let cfg = load();
        clear_env_vars();

        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.resolved_worker_threads(), 6);
        assert_eq!(cfg.resolved_per_conn_cap(), 3);
        assert_eq!(cfg.max_pending, 16);
        assert_eq!(cfg.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("LDAP_CORE_MAX_PENDING", "lots");
        std::env::set_var("LDAP_CORE_MAX_CONNECTIONS", "0");
        let cfg = load();
        clear_env_vars();

        assert_eq!(cfg.max_pending, 100);
        assert_eq!(cfg.max_connections, 1); // floor
    }

    #[test]
    fn test_auth_ceiling_never_below_anonymous() {
        let cfg = CoreConfig { max_pending: 50, max_pending_auth: 10, ..Default::default() }
            .normalized();
        assert_eq!(cfg.max_pending_auth, 50);
    }

    #[test]
    fn test_single_worker_cap_is_one() {
        let cfg = CoreConfig { worker_threads: 1, ..Default::default() };
        assert_eq!(cfg.resolved_per_conn_cap(), 1);
        let cfg = CoreConfig { worker_threads: 1, per_conn_max_executing: 4, ..Default::default() };
        assert_eq!(cfg.admission_limits().per_conn_max_executing, 4);
    }

    #[test]
    fn test_toml_partial_document() {
        let cfg = CoreConfig::from_toml_str(
            r#"
            max_connections = 64
            max_pending = 16
            log_format = "pretty"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_connections, 64);
        assert_eq!(cfg.max_pending, 16);
        assert_eq!(cfg.max_pending_auth, 1000);
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_threads = 2\nidle_timeout_secs = 60").unwrap();
        let cfg = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.resolved_worker_threads(), 2);
        assert_eq!(cfg.table_config().idle_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_toml_type_error() {
        let err = CoreConfig::from_toml_str("max_connections = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_effective_config_serializes() {
        let cfg = CoreConfig { worker_threads: 4, ..Default::default() };
        let summary = cfg.effective_config();
        assert_eq!(summary.per_conn_max_executing, 2);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"max_pending_auth\":1000"));
    }
}
