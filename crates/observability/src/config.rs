//! Service configuration resolution
//!
//! Merges build-time constants, a local override file and the process
//! environment into a single validated [`ResolvedConfig`]. Higher layers win
//! field by field; every violated constraint is reported at once.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};

/// Default local override file, relative to the working directory
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Configuration keys, as they appear in the environment
pub mod keys {
    pub const SERVICE_NAME: &str = "SERVICE_NAME";
    pub const SERVICE_VERSION: &str = "SERVICE_VERSION";
    pub const BUILD_TIME: &str = "BUILD_TIME";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const OTEL_ENDPOINT: &str = "OTEL_ENDPOINT";
    pub const OTEL_INSECURE: &str = "OTEL_INSECURE";
    pub const OTEL_TRACING_SAMPLE_RATE: &str = "OTEL_TRACING_SAMPLE_RATE";
    pub const OTEL_EXPORT_TIMEOUT: &str = "OTEL_EXPORT_TIMEOUT";
    pub const METRICS_MODE: &str = "METRICS_MODE";
    pub const METRICS_PORT: &str = "METRICS_PORT";
    pub const METRICS_PATH: &str = "METRICS_PATH";
    pub const METRICS_PUSH_ENDPOINT: &str = "METRICS_PUSH_ENDPOINT";
    pub const METRICS_PUSH_INTERVAL: &str = "METRICS_PUSH_INTERVAL";
    pub const METRICS_PROTOCOL: &str = "METRICS_PROTOCOL";
    pub const METRICS_PUSH_INSECURE: &str = "METRICS_PUSH_INSECURE";
}

fn default_version() -> String {
    "dev".to_string()
}

fn default_build_time() -> String {
    "unknown".to_string()
}

fn default_otel_endpoint() -> String {
    "localhost:4318".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

const fn default_sample_ratio() -> f64 {
    1.0
}

const fn default_export_timeout_secs() -> u64 {
    10
}

const fn default_metrics_port() -> u16 {
    9090
}

const fn default_push_interval_secs() -> u64 {
    30
}

const fn default_insecure() -> bool {
    true
}

/// Log severity threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lowercase name used in log records
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Equivalent `tracing` level
    pub const fn as_tracing(self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "invalid log level: {s}. Use 'debug', 'info', 'warn' or 'error'"
            )),
        }
    }
}

/// How metrics leave the process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MetricsMode {
    /// Scraped from a local exposition endpoint
    #[default]
    Pull,
    /// Exported to a collector on a fixed interval
    Push,
    /// Both at once
    Hybrid,
}

impl MetricsMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for MetricsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pull" => Ok(Self::Pull),
            "push" => Ok(Self::Push),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(format!(
                "invalid metrics mode: {s}. Use 'pull', 'push' or 'hybrid'"
            )),
        }
    }
}

/// Wire protocol for pushed metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PushProtocol {
    #[default]
    Http,
    Grpc,
}

impl fmt::Display for PushProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Grpc => write!(f, "grpc"),
        }
    }
}

impl FromStr for PushProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "grpc" => Ok(Self::Grpc),
            _ => Err(format!("invalid metrics protocol: {s}. Use 'http' or 'grpc'")),
        }
    }
}

/// Who this process is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// `service.name` resource attribute and the `service` log field
    pub name: String,
    /// Release version, `dev` when unset
    pub version: String,
    /// Build timestamp as provided at compile time, `unknown` when unset
    pub build_time: String,
}

/// Trace export settings
#[derive(Debug, Clone, PartialEq)]
pub struct TracingConfig {
    /// Collector address, `host:port` or a full URL
    pub endpoint: String,
    /// Use plain HTTP instead of TLS
    pub insecure: bool,
    /// Fraction of root traces that are sampled, in `[0, 1]`
    pub sample_ratio: f64,
    /// Upper bound for a single export call
    pub export_timeout: Duration,
}

/// Push reader settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    /// Collector address for pushed metrics. Push is unavailable without it.
    pub endpoint: Option<String>,
    /// Time between two exports
    pub interval: Duration,
    /// OTLP transport used for the export
    pub protocol: PushProtocol,
    /// Use plain HTTP instead of TLS
    pub insecure: bool,
}

/// Metrics delivery settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Requested delivery mode, before any fallback
    pub mode: MetricsMode,
    /// Scrape listener port. `0` binds an ephemeral port.
    pub port: u16,
    /// Scrape route, always starting with `/`
    pub path: String,
    pub push: PushConfig,
}

/// Fully resolved and validated configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub service: ServiceIdentity,
    pub log_level: LogLevel,
    pub tracing: TracingConfig,
    pub metrics: MetricsConfig,
}

impl ResolvedConfig {
    /// Configuration with every field at its default, for the given service
    pub fn with_service(name: impl Into<String>) -> Self {
        Self {
            service: ServiceIdentity {
                name: name.into(),
                version: default_version(),
                build_time: default_build_time(),
            },
            log_level: LogLevel::default(),
            tracing: TracingConfig {
                endpoint: default_otel_endpoint(),
                insecure: default_insecure(),
                sample_ratio: default_sample_ratio(),
                export_timeout: Duration::from_secs(default_export_timeout_secs()),
            },
            metrics: MetricsConfig {
                mode: MetricsMode::default(),
                port: default_metrics_port(),
                path: default_metrics_path(),
                push: PushConfig {
                    endpoint: None,
                    interval: Duration::from_secs(default_push_interval_secs()),
                    protocol: PushProtocol::default(),
                    insecure: default_insecure(),
                },
            },
        }
    }
}

/// Values baked into the binary at compile time
///
/// Use [`build_constants!`](crate::build_constants) so the values are read
/// while compiling the calling crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildConstants {
    pub service_name: Option<&'static str>,
    pub version: Option<&'static str>,
    pub build_time: Option<&'static str>,
}

impl BuildConstants {
    fn entries(self) -> [(&'static str, Option<&'static str>); 3] {
        [
            (keys::SERVICE_NAME, self.service_name),
            (keys::SERVICE_VERSION, self.version),
            (keys::BUILD_TIME, self.build_time),
        ]
    }
}

/// Captures `SERVICE_NAME`, `SERVICE_VERSION` and `BUILD_TIME` from the
/// compile-time environment of the invoking crate.
#[macro_export]
macro_rules! build_constants {
    () => {
        $crate::config::BuildConstants {
            service_name: option_env!("SERVICE_NAME"),
            version: option_env!("SERVICE_VERSION"),
            build_time: option_env!("BUILD_TIME"),
        }
    };
}

/// One violated constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    /// Offending key, in environment spelling
    pub key: &'static str,
    /// Human readable constraint that was broken
    pub reason: String,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}

/// Error type for configuration resolution
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// One or more fields violate their constraints
    #[error("invalid configuration: {}", join_violations(.0))]
    Validation(Vec<ConfigViolation>),

    /// The override file exists but could not be read
    #[error("failed to read configuration file {}: {message}", .path.display())]
    File { path: PathBuf, message: String },

    /// The layered sources could not be merged
    #[error("failed to merge configuration sources: {0}")]
    Source(#[from] config::ConfigError),
}

impl ConfigError {
    /// Violations carried by a validation failure
    pub fn violations(&self) -> &[ConfigViolation] {
        match self {
            Self::Validation(violations) => violations,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resolves [`ResolvedConfig`] from ranked sources
///
/// Precedence, highest first: build-time constants, the local override file,
/// the process environment.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    build: BuildConstants,
    file: Option<PathBuf>,
    environment: Option<HashMap<String, String>>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver over the process environment and `./.env`
    pub fn new() -> Self {
        Self {
            build: BuildConstants::default(),
            file: Some(PathBuf::from(DEFAULT_ENV_FILE)),
            environment: None,
        }
    }

    /// Set the compile-time layer
    #[must_use]
    pub fn with_build_constants(mut self, build: BuildConstants) -> Self {
        self.build = build;
        self
    }

    /// Use a different override file. `.toml` files are read as TOML,
    /// anything else as dotenv.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skip the override file entirely
    #[must_use]
    pub fn without_file(mut self) -> Self {
        self.file = None;
        self
    }

    /// Replace the process environment with an explicit set of variables
    #[must_use]
    pub fn with_environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Merge all sources and validate the result
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let settings = self.layered()?.build()?;
        let mut fields = FieldReader::new(&settings);

        let name = fields.required(keys::SERVICE_NAME);
        let version = fields.text(keys::SERVICE_VERSION, default_version);
        let build_time = fields.text(keys::BUILD_TIME, default_build_time);
        let log_level = fields.parsed(keys::LOG_LEVEL, LogLevel::default());

        let endpoint = fields.text(keys::OTEL_ENDPOINT, default_otel_endpoint);
        let insecure = fields.flag(keys::OTEL_INSECURE, default_insecure());
        let sample_ratio = fields.ratio(keys::OTEL_TRACING_SAMPLE_RATE, default_sample_ratio());
        let export_timeout =
            fields.seconds(keys::OTEL_EXPORT_TIMEOUT, default_export_timeout_secs());

        let mode = fields.parsed(keys::METRICS_MODE, MetricsMode::default());
        let port = fields.port(keys::METRICS_PORT, default_metrics_port());
        let path = fields.text(keys::METRICS_PATH, default_metrics_path);
        if !path.starts_with('/') {
            fields.violate(keys::METRICS_PATH, format!("{path:?} must start with '/'"));
        }
        let push_endpoint = fields.optional(keys::METRICS_PUSH_ENDPOINT);
        let interval = fields.seconds(keys::METRICS_PUSH_INTERVAL, default_push_interval_secs());
        let protocol = fields.parsed(keys::METRICS_PROTOCOL, PushProtocol::default());
        let push_insecure = fields.flag(keys::METRICS_PUSH_INSECURE, default_insecure());

        let violations = fields.finish();
        if !violations.is_empty() {
            return Err(ConfigError::Validation(violations));
        }

        Ok(ResolvedConfig {
            service: ServiceIdentity {
                name: name.unwrap_or_default(),
                version,
                build_time,
            },
            log_level,
            tracing: TracingConfig {
                endpoint,
                insecure,
                sample_ratio,
                export_timeout,
            },
            metrics: MetricsConfig {
                mode,
                port,
                path,
                push: PushConfig {
                    endpoint: push_endpoint,
                    interval,
                    protocol,
                    insecure: push_insecure,
                },
            },
        })
    }

    fn layered(&self) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        // Lowest layer first; later sources override earlier ones.
        let environment = Environment::default()
            .ignore_empty(true)
            .source(self.environment.clone().map(|vars| vars.into_iter().collect()));
        let mut builder = Config::builder().add_source(environment);

        if let Some(path) = &self.file {
            builder = add_file_layer(builder, path)?;
        }

        for (key, value) in self.build.entries() {
            let value = value.map(str::trim).filter(|v| !v.is_empty());
            builder = builder.set_override_option(key.to_lowercase(), value)?;
        }

        Ok(builder)
    }
}

fn add_file_layer(
    builder: ConfigBuilder<DefaultState>,
    path: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    if !path.exists() {
        return Ok(builder);
    }

    if path.extension().is_some_and(|ext| ext == "toml") {
        return Ok(builder.add_source(File::from(path).format(FileFormat::Toml)));
    }

    let file_error = |message: String| ConfigError::File {
        path: path.to_path_buf(),
        message,
    };
    let mut vars = config::Map::new();
    for item in dotenvy::from_path_iter(path).map_err(|e| file_error(e.to_string()))? {
        let (key, value) = item.map_err(|e| file_error(e.to_string()))?;
        vars.insert(key, value);
    }

    Ok(builder.add_source(Environment::default().ignore_empty(true).source(Some(vars))))
}

/// Reads typed fields and accumulates violations instead of failing fast
struct FieldReader<'a> {
    settings: &'a Config,
    violations: Vec<ConfigViolation>,
}

impl<'a> FieldReader<'a> {
    fn new(settings: &'a Config) -> Self {
        Self {
            settings,
            violations: Vec::new(),
        }
    }

    fn violate(&mut self, key: &'static str, reason: impl Into<String>) {
        self.violations.push(ConfigViolation {
            key,
            reason: reason.into(),
        });
    }

    fn finish(self) -> Vec<ConfigViolation> {
        self.violations
    }

    fn optional(&mut self, key: &'static str) -> Option<String> {
        match self.settings.get_string(&key.to_lowercase()) {
            Ok(value) => {
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            },
            Err(config::ConfigError::NotFound(_)) => None,
            Err(e) => {
                self.violate(key, format!("unreadable value: {e}"));
                None
            },
        }
    }

    fn required(&mut self, key: &'static str) -> Option<String> {
        let value = self.optional(key);
        if value.is_none() {
            self.violate(key, "is required");
        }
        value
    }

    fn text(&mut self, key: &'static str, default: fn() -> String) -> String {
        self.optional(key).unwrap_or_else(default)
    }

    fn parsed<T>(&mut self, key: &'static str, default: T) -> T
    where
        T: FromStr<Err = String>,
    {
        match self.optional(key).map(|raw| raw.parse::<T>()) {
            None => default,
            Some(Ok(value)) => value,
            Some(Err(reason)) => {
                self.violate(key, reason);
                default
            },
        }
    }

    fn flag(&mut self, key: &'static str, default: bool) -> bool {
        let Some(raw) = self.optional(key) else {
            return default;
        };
        match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                self.violate(key, format!("{raw:?} is not a boolean"));
                default
            },
        }
    }

    fn ratio(&mut self, key: &'static str, default: f64) -> f64 {
        let Some(raw) = self.optional(key) else {
            return default;
        };
        match raw.parse::<f64>() {
            Ok(value) if (0.0..=1.0).contains(&value) => value,
            Ok(value) => {
                self.violate(key, format!("{value} is outside [0, 1]"));
                default
            },
            Err(_) => {
                self.violate(key, format!("{raw:?} is not a number"));
                default
            },
        }
    }

    fn port(&mut self, key: &'static str, default: u16) -> u16 {
        let Some(raw) = self.optional(key) else {
            return default;
        };
        match raw.parse::<i64>().map(u16::try_from) {
            Ok(Ok(port)) if port > 0 => port,
            Ok(_) => {
                self.violate(key, format!("{raw} is outside 1..=65535"));
                default
            },
            Err(_) => {
                self.violate(key, format!("{raw:?} is not an integer"));
                default
            },
        }
    }

    fn seconds(&mut self, key: &'static str, default: u64) -> Duration {
        let Some(raw) = self.optional(key) else {
            return Duration::from_secs(default);
        };
        match raw.parse::<i64>().map(u64::try_from) {
            Ok(Ok(secs)) if secs > 0 => Duration::from_secs(secs),
            Ok(_) => {
                self.violate(key, format!("{raw} must be at least 1 second"));
                Duration::from_secs(default)
            },
            Err(_) => {
                self.violate(key, format!("{raw:?} is not an integer"));
                Duration::from_secs(default)
            },
        }
    }
}
