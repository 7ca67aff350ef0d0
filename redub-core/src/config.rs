use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where job IDs come from next: fixed backend, or health-driven selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackendKind {
    Auto,
    Local,
    Redis,
}

impl std::str::FromStr for QueueBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "local" => Ok(Self::Local),
            "redis" => Ok(Self::Redis),
            _ => Err(format!("invalid queue backend: {}", s)),
        }
    }
}

/// Outer network gate mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAccessMode {
    Off,
    Tailscale,
    Cloudflare,
}

impl std::str::FromStr for RemoteAccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "tailscale" => Ok(Self::Tailscale),
            "cloudflare" => Ok(Self::Cloudflare),
            _ => Err(format!("invalid remote access mode: {}", s)),
        }
    }
}

/// Which artifact classes survive after a job reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep everything
    Full,
    /// Drop intermediates, keep outputs and review material
    Balanced,
    /// Keep final outputs only
    Minimal,
}

impl std::str::FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "balanced" => Ok(Self::Balanced),
            "minimal" => Ok(Self::Minimal),
            _ => Err(format!("invalid retention policy: {}", s)),
        }
    }
}

/// SameSite attribute emitted on session cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieSameSite {
    Strict,
    Lax,
    None,
}

impl CookieSameSite {
    pub fn attribute(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

impl std::str::FromStr for CookieSameSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lax" => Ok(Self::Lax),
            "none" => Ok(Self::None),
            _ => Err(format!("invalid samesite value: {}", s)),
        }
    }
}

/// The full operator configuration, parsed once at boot and passed
/// explicitly to every component. No global settings object.
#[derive(Debug, Clone)]
pub struct Config {
    // Directories
    pub state_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub uploads_dir: PathBuf,

    // Upload limits
    pub max_upload_bytes: u64,
    pub max_storage_bytes_per_user: u64,
    pub upload_chunk_bytes: u64,
    pub max_uploads_inflight_per_user: u64,
    pub upload_session_ttl: Duration,

    // Scheduling
    pub max_concurrent_global: usize,
    pub max_concurrent_per_user: u64,
    pub daily_job_cap: u64,
    pub daily_processing_minutes: u64,
    pub backpressure_q_max: usize,
    pub lease_ttl: Duration,
    pub stage_timeout: Duration,
    pub max_stage_attempts: u32,
    pub disk_min_free_bytes: u64,

    // Network
    pub bind_addr: SocketAddr,
    pub remote_access_mode: RemoteAccessMode,
    pub trusted_proxy_subnets: Vec<IpNet>,
    pub allowed_subnets: Vec<IpNet>,
    pub cors_origins: Vec<String>,

    // Dispatch
    pub queue_backend: QueueBackendKind,
    pub redis_url: Option<String>,
    pub redis_visibility_timeout: Duration,

    // Secrets & cookies
    pub jwt_secret: String,
    pub csrf_secret: String,
    pub session_secret: String,
    pub cookie_secure: bool,
    pub cookie_samesite: CookieSameSite,

    // Retention
    pub retention_policy: RetentionPolicy,
    pub retention_sweep_interval: Duration,
}

const MIB: u64 = 1024 * 1024;

fn env_var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parse_subnets(name: &'static str) -> ConfigResult<Vec<IpNet>> {
    let Some(raw) = env_var(name) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>().map_err(|e| ConfigError::Invalid {
                var: name,
                value: s.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn parse_list(name: &'static str) -> Vec<String> {
    env_var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Load the configuration from the environment.
    ///
    /// The three signing secrets are required; everything else has a
    /// default suitable for a single-box deployment.
    pub fn from_env() -> ConfigResult<Self> {
        let state_dir = PathBuf::from(env_var("STATE_DIR").unwrap_or_else(|| "./state".into()));
        let output_dir = PathBuf::from(env_var("OUTPUT_DIR").unwrap_or_else(|| "./output".into()));
        let log_dir = PathBuf::from(env_var("LOG_DIR").unwrap_or_else(|| "./logs".into()));
        let uploads_dir =
            PathBuf::from(env_var("UPLOADS_DIR").unwrap_or_else(|| "./uploads".into()));

        Ok(Self {
            state_dir,
            output_dir,
            log_dir,
            uploads_dir,

            max_upload_bytes: parse_or("MAX_UPLOAD_MB", 4096u64)? * MIB,
            max_storage_bytes_per_user: parse_or("MAX_STORAGE_MB_PER_USER", 51200u64)? * MIB,
            upload_chunk_bytes: parse_or("UPLOAD_CHUNK_BYTES", 4 * MIB)?,
            max_uploads_inflight_per_user: parse_or("MAX_UPLOADS_INFLIGHT_PER_USER", 4u64)?,
            upload_session_ttl: Duration::from_secs(
                parse_or("UPLOAD_SESSION_TTL_H", 48u64)? * 3600,
            ),

            max_concurrent_global: parse_or("MAX_CONCURRENT_GLOBAL", 2usize)?,
            max_concurrent_per_user: parse_or("MAX_CONCURRENT_PER_USER", 1u64)?,
            daily_job_cap: parse_or("DAILY_JOB_CAP", 24u64)?,
            daily_processing_minutes: parse_or("DAILY_PROCESSING_MINUTES", 600u64)?,
            backpressure_q_max: parse_or("BACKPRESSURE_Q_MAX", 32usize)?,
            lease_ttl: Duration::from_secs(parse_or("LEASE_TTL_S", 300u64)?),
            stage_timeout: Duration::from_secs(parse_or("STAGE_TIMEOUT_S", 3600u64)?),
            max_stage_attempts: parse_or("MAX_STAGE_ATTEMPTS", 3u32)?,
            disk_min_free_bytes: parse_or("DISK_MIN_FREE_MB", 2048u64)? * MIB,

            bind_addr: parse_or(
                "BIND_ADDR",
                "127.0.0.1:8571".parse::<SocketAddr>().map_err(|e| {
                    ConfigError::Invalid {
                        var: "BIND_ADDR",
                        value: "127.0.0.1:8571".into(),
                        reason: e.to_string(),
                    }
                })?,
            )?,
            remote_access_mode: parse_or("REMOTE_ACCESS_MODE", RemoteAccessMode::Off)?,
            trusted_proxy_subnets: parse_subnets("TRUSTED_PROXY_SUBNETS")?,
            allowed_subnets: parse_subnets("ALLOWED_SUBNETS")?,
            cors_origins: parse_list("CORS_ORIGINS"),

            queue_backend: parse_or("QUEUE_BACKEND", QueueBackendKind::Auto)?,
            redis_url: env_var("REDIS_URL"),
            redis_visibility_timeout: Duration::from_secs(parse_or(
                "REDIS_QUEUE_VISIBILITY_TIMEOUT_S",
                120u64,
            )?),

            jwt_secret: env_var("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?,
            csrf_secret: env_var("CSRF_SECRET").ok_or(ConfigError::Missing("CSRF_SECRET"))?,
            session_secret: env_var("SESSION_SECRET")
                .ok_or(ConfigError::Missing("SESSION_SECRET"))?,
            cookie_secure: parse_or("COOKIE_SECURE", true)?,
            cookie_samesite: parse_or("COOKIE_SAMESITE", CookieSameSite::Lax)?,

            retention_policy: parse_or("RETENTION_POLICY", RetentionPolicy::Balanced)?,
            retention_sweep_interval: Duration::from_secs(parse_or(
                "RETENTION_SWEEP_INTERVAL_SEC",
                900u64,
            )?),
        })
    }

    /// A configuration rooted under one directory, for tests and local
    /// development. Secrets are fixed and worthless.
    pub fn dev_defaults(root: &Path) -> Self {
        Self {
            state_dir: root.join("state"),
            output_dir: root.join("output"),
            log_dir: root.join("logs"),
            uploads_dir: root.join("uploads"),

            max_upload_bytes: 64 * MIB,
            max_storage_bytes_per_user: 256 * MIB,
            upload_chunk_bytes: 256 * 1024,
            max_uploads_inflight_per_user: 4,
            upload_session_ttl: Duration::from_secs(3600),

            max_concurrent_global: 2,
            max_concurrent_per_user: 1,
            daily_job_cap: 24,
            daily_processing_minutes: 600,
            backpressure_q_max: 16,
            lease_ttl: Duration::from_secs(60),
            stage_timeout: Duration::from_secs(30),
            max_stage_attempts: 3,
            disk_min_free_bytes: 0,

            bind_addr: "127.0.0.1:0".parse().unwrap(),
            remote_access_mode: RemoteAccessMode::Off,
            trusted_proxy_subnets: Vec::new(),
            allowed_subnets: Vec::new(),
            cors_origins: Vec::new(),

            queue_backend: QueueBackendKind::Local,
            redis_url: None,
            redis_visibility_timeout: Duration::from_secs(5),

            jwt_secret: "dev-jwt-secret".into(),
            csrf_secret: "dev-csrf-secret".into(),
            session_secret: "dev-session-secret".into(),
            cookie_secure: false,
            cookie_samesite: CookieSameSite::Lax,

            retention_policy: RetentionPolicy::Full,
            retention_sweep_interval: Duration::from_secs(60),
        }
    }

    /// Derived number of expected chunks for an upload of `total_bytes`.
    pub fn expected_chunks(&self, total_bytes: u64, chunk_bytes: u64) -> u64 {
        total_bytes.div_ceil(chunk_bytes.max(1))
    }
}
