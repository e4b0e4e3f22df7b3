// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Environment-driven runtime configuration for ReceiptGate.
//!
//! [`Config::from_env()`] is the one entry point: there is no global or
//! lazily-initialized singleton, so tests and multi-tenant hosts can build
//! as many independent configs as they need. [`validate`] then checks the
//! loaded values for hard errors and advisory [`ConfigWarning`]s, the same
//! two-tier split the rest of the ambient stack uses.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Failures that can occur while loading or validating a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable was present but could not be parsed as the
    /// expected type.
    #[error("invalid value for {var}: {reason}")]
    InvalidValue {
        /// Name of the environment variable.
        var: String,
        /// Why parsing failed.
        reason: String,
    },
    /// Semantic validation failed after loading.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// No API key configured and the insecure-dev bypass is enabled —
    /// fine for local development, dangerous anywhere reachable.
    InsecureDevBypassEnabled,
    /// Receipt bodies will be copied into structured logs verbatim.
    LoggingReceiptBodies,
    /// A search page-size default sits well above what most clients need.
    LargeSearchDefaultLimit {
        /// The configured `search_default_limit`.
        limit: i64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsecureDevBypassEnabled => {
                write!(f, "RECEIPTGATE_ALLOW_INSECURE_DEV is set with no api_key — requests are unauthenticated")
            }
            Self::LoggingReceiptBodies => {
                write!(f, "log_receipt_bodies is enabled — receipt bodies will appear in structured logs")
            }
            Self::LargeSearchDefaultLimit { limit } => {
                write!(f, "search_default_limit ({limit}) is unusually large for a page size")
            }
        }
    }
}

/// CORS policy applied by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CorsConfig {
    /// Origins allowed to make cross-origin requests.
    pub allowed_origins: Vec<String>,
    /// HTTP methods allowed cross-origin.
    pub allowed_methods: Vec<String>,
    /// Request headers allowed cross-origin.
    pub allowed_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".into(), "http://localhost:8080".into()],
            allowed_methods: vec!["GET".into(), "POST".into(), "OPTIONS".into()],
            allowed_headers: vec!["Authorization".into(), "Content-Type".into(), "X-API-Key".into()],
        }
    }
}

/// Top-level runtime configuration. Every field here has a
/// well-defined default; nothing is required to start the service except
/// in combinations [`validate`] flags as hard errors (none today — every
/// option is either optional or has a safe default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Connection string. `sqlite://...` or `postgres://...`.
    pub database_url: String,
    /// Bearer/`X-API-Key` value clients must present, compared in constant
    /// time. `None` means authentication is unconfigured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// If `true` and `api_key` is unset, the daemon accepts unauthenticated
    /// requests instead of refusing to start. Never set this in production.
    pub allow_insecure_dev: bool,
    /// Per-receipt-body byte limit enforced by `rg-validate`.
    pub receipt_body_max_bytes: usize,
    /// Traversal cap for `Ledger::chain`.
    pub receipt_chain_max_depth: usize,
    /// Search page size used when a caller omits `limit`.
    pub search_default_limit: i64,
    /// Upper bound `Ledger::search` clamps `limit` to.
    pub search_max_limit: i64,
    /// If `true`, reject a receipt whose `caused_by_receipt_id` points at a
    /// receipt that does not exist.
    pub enforce_cause_exists: bool,
    /// Recorded for downstream tooling; gates no core ledger behavior.
    pub enable_graph_layer: bool,
    /// Recorded for downstream tooling; gates no core ledger behavior.
    pub enable_semantic_layer: bool,
    /// Tenant id used when a caller supplies none (single-tenant mode).
    pub default_tenant_id: String,
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Reported in `/health`.
    pub service_name: String,
    /// CORS policy.
    pub cors: CorsConfig,
    /// If `true`, include receipt bodies in structured log events. Off by
    /// default since bodies may carry sensitive task payloads.
    pub log_receipt_bodies: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./receiptgate.db".into(),
            api_key: None,
            allow_insecure_dev: false,
            receipt_body_max_bytes: 262_144,
            receipt_chain_max_depth: 2048,
            search_default_limit: 50,
            search_max_limit: 500,
            enforce_cause_exists: false,
            enable_graph_layer: true,
            enable_semantic_layer: false,
            default_tenant_id: "default".into(),
            host: "0.0.0.0".into(),
            port: 8000,
            service_name: "receiptgate".into(),
            cors: CorsConfig::default(),
            log_receipt_bodies: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.into(),
                reason: format!("could not parse '{raw}'"),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            var: var.into(),
            reason: "value is not valid UTF-8".into(),
        }),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(ConfigError::InvalidValue {
                var: var.into(),
                reason: format!("'{other}' is not a recognized boolean"),
            }),
        },
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            var: var.into(),
            reason: "value is not valid UTF-8".into(),
        }),
    }
}

fn parse_csv_env(var: &str) -> Option<Vec<String>> {
    std::env::var(var).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl Config {
    /// Load configuration from the process environment, overlaying
    /// [`Config::default`] with whatever `RECEIPTGATE_*` variables are set.
    ///
    /// `database_url` is the one option with a two-step fallback:
    /// `RECEIPTGATE_DATABASE_URL` wins if set, otherwise the bare
    /// `DATABASE_URL` is used, otherwise the default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a set variable can't be
    /// parsed as its expected type.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = std::env::var("RECEIPTGATE_DATABASE_URL")
            .ok()
            .or_else(|| std::env::var("DATABASE_URL").ok())
        {
            config.database_url = url;
        }
        if let Ok(key) = std::env::var("RECEIPTGATE_API_KEY") {
            config.api_key = Some(key);
        }
        if let Some(v) = parse_bool_env("RECEIPTGATE_ALLOW_INSECURE_DEV")? {
            config.allow_insecure_dev = v;
        }
        if let Some(v) = parse_env("RECEIPTGATE_RECEIPT_BODY_MAX_BYTES")? {
            config.receipt_body_max_bytes = v;
        }
        if let Some(v) = parse_env("RECEIPTGATE_RECEIPT_CHAIN_MAX_DEPTH")? {
            config.receipt_chain_max_depth = v;
        }
        if let Some(v) = parse_env("RECEIPTGATE_SEARCH_DEFAULT_LIMIT")? {
            config.search_default_limit = v;
        }
        if let Some(v) = parse_env("RECEIPTGATE_SEARCH_MAX_LIMIT")? {
            config.search_max_limit = v;
        }
        if let Some(v) = parse_bool_env("RECEIPTGATE_ENFORCE_CAUSE_EXISTS")? {
            config.enforce_cause_exists = v;
        }
        if let Some(v) = parse_bool_env("RECEIPTGATE_ENABLE_GRAPH_LAYER")? {
            config.enable_graph_layer = v;
        }
        if let Some(v) = parse_bool_env("RECEIPTGATE_ENABLE_SEMANTIC_LAYER")? {
            config.enable_semantic_layer = v;
        }
        if let Ok(v) = std::env::var("RECEIPTGATE_DEFAULT_TENANT_ID") {
            config.default_tenant_id = v;
        }
        if let Ok(v) = std::env::var("RECEIPTGATE_HOST") {
            config.host = v;
        }
        if let Some(v) = parse_env("RECEIPTGATE_PORT")? {
            config.port = v;
        }
        if let Ok(v) = std::env::var("RECEIPTGATE_SERVICE_NAME") {
            config.service_name = v;
        }
        if let Some(origins) = parse_csv_env("RECEIPTGATE_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = origins;
        }
        if let Some(methods) = parse_csv_env("RECEIPTGATE_CORS_ALLOWED_METHODS") {
            config.cors.allowed_methods = methods;
        }
        if let Some(headers) = parse_csv_env("RECEIPTGATE_CORS_ALLOWED_HEADERS") {
            config.cors.allowed_headers = headers;
        }
        if let Some(v) = parse_bool_env("RECEIPTGATE_LOG_RECEIPT_BODIES")? {
            config.log_receipt_bodies = v;
        }

        Ok(config)
    }
}

/// Validate a loaded configuration, returning advisory warnings.
///
/// Hard errors (inverted search limits, a zero max-depth) come back as
/// [`ConfigError::ValidationError`]; soft issues — the kind a config can
/// run with but an operator should know about — come back as warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] if a structural invariant is
/// violated.
pub fn validate(config: &Config) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.search_default_limit <= 0 {
        errors.push("search_default_limit must be positive".to_string());
    }
    if config.search_max_limit <= 0 {
        errors.push("search_max_limit must be positive".to_string());
    }
    if config.search_default_limit > config.search_max_limit {
        errors.push(format!(
            "search_default_limit ({}) exceeds search_max_limit ({})",
            config.search_default_limit, config.search_max_limit
        ));
    }
    if config.receipt_chain_max_depth == 0 {
        errors.push("receipt_chain_max_depth must be at least 1".to_string());
    }
    if config.receipt_body_max_bytes == 0 {
        errors.push("receipt_body_max_bytes must be at least 1".to_string());
    }
    if config.default_tenant_id.trim().is_empty() {
        errors.push("default_tenant_id must not be empty".to_string());
    }

    if config.api_key.is_none() && config.allow_insecure_dev {
        warnings.push(ConfigWarning::InsecureDevBypassEnabled);
    }
    if config.log_receipt_bodies {
        warnings.push(ConfigWarning::LoggingReceiptBodies);
    }
    if config.search_default_limit > 1000 {
        warnings.push(ConfigWarning::LargeSearchDefaultLimit {
            limit: config.search_default_limit,
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}
