//! Structured logging utilities for hoard components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use hoard_config::log_pool_warn;
//!
//! log_pool_warn!(hash = %hash, size, "chunk exceeds configured size");
//! log_refcnt_info!(scope = "pool", chunks = 12, "scope compacted");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const POOL: &'static str = "POOL";
    pub const MANIFEST: &'static str = "MANIFEST";
    pub const REFCNT: &'static str = "REFCNT";
    pub const LOCK: &'static str = "LOCK";
    pub const CODEC: &'static str = "CODEC";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === POOL logging macros ===

#[macro_export]
macro_rules! log_pool_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "POOL", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_pool_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "POOL", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_pool_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "POOL", $($arg)+)
    };
}

// === MANIFEST logging macros ===

#[macro_export]
macro_rules! log_manifest_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "MANIFEST", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_manifest_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "MANIFEST", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_manifest_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "MANIFEST", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_manifest_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "MANIFEST", $($arg)+)
    };
}

// === REFCNT logging macros ===

#[macro_export]
macro_rules! log_refcnt_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "REFCNT", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_refcnt_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "REFCNT", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_refcnt_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "REFCNT", $($arg)+)
    };
}

// === LOCK logging macros ===

#[macro_export]
macro_rules! log_lock_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "LOCK", $($arg)+)
    };
}

// === CODEC logging macros ===

#[macro_export]
macro_rules! log_codec_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "CODEC", $($arg)+)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

/// Install a test-friendly subscriber; repeated calls are no-ops.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(LogLevel::Debug.as_filter()))
        .with_test_writer()
        .try_init();
}
