//! Configuration types for batch-dispatch

use crate::error::{Error, Result};
use crate::schema::RecordSchema;
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest worker count a run accepts
pub const MAX_WORKERS: usize = 8;

/// Highest `flush_every` value a run accepts
pub const MAX_FLUSH_EVERY: usize = 10_000;

/// Input file settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputConfig {
    /// Encoding label of the input file, e.g. "utf-8" or "windows-1252" (default: "utf-8")
    ///
    /// Any WHATWG label for an ASCII-compatible encoding is accepted.
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
        }
    }
}

impl InputConfig {
    /// Resolve the configured encoding label
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unknown labels and for encodings that do
    /// not keep `\n` as a single byte (UTF-16 and similar).
    pub fn resolve_encoding(&self) -> Result<&'static Encoding> {
        let encoding = Encoding::for_label(self.encoding.trim().as_bytes()).ok_or_else(|| {
            Error::config(
                format!("unknown input encoding '{}'", self.encoding),
                "input.encoding",
            )
        })?;
        if !encoding.is_ascii_compatible() {
            return Err(Error::config(
                format!("input encoding {} is not ASCII-compatible", encoding.name()),
                "input.encoding",
            ));
        }
        Ok(encoding)
    }
}

/// Concurrency, pacing and memory settings for the dispatch engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of parallel workers, 1 to 8 (default: 1)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum records buffered between the feeder and the workers (default: 1000)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum dispatches per rate window (None = unlimited)
    #[serde(default)]
    pub rate_limit_per_window: Option<u32>,

    /// Length of the rolling rate window (default: 60 seconds)
    #[serde(default = "default_rate_window", with = "duration_serde")]
    pub rate_window: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            chunk_size: default_chunk_size(),
            rate_limit_per_window: None,
            rate_window: default_rate_window(),
        }
    }
}

/// Retry configuration for transient failures
///
/// Only the transient tier is bounded here. Expired tokens are always
/// refreshed and resent, regardless of these settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra sends allowed after a transient failure (default: 2)
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    /// Initial delay before the first transient retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: default_max_transient_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Client-credentials exchange settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Token endpoint URL
    pub token_url: String,

    /// Client ID sent in the exchange
    pub client_id: String,

    /// Client secret sent in the exchange
    pub client_secret: String,

    /// Timeout for one exchange (default: 60 seconds)
    #[serde(default = "default_token_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout: default_token_timeout(),
        }
    }
}

impl CredentialConfig {
    /// Client secret reduced to its first two characters, for logs and report headers
    pub fn masked_secret(&self) -> String {
        let prefix: String = self.client_secret.chars().take(2).collect();
        format!("{}xxxxx", prefix)
    }
}

/// Target endpoint settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// URL every record is POSTed to
    pub url: String,

    /// Timeout for one dispatch (default: 90 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: default_request_timeout(),
        }
    }
}

/// Report output settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Completed records between durable flushes of the report (default: 100)
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    /// Results allowed to wait behind an unfinished lower line before they are written anyway (default: 1000)
    #[serde(default = "default_max_held")]
    pub max_held: usize,

    /// Interval between progress updates (default: 500 milliseconds)
    #[serde(default = "default_progress_interval", with = "duration_millis_serde")]
    pub progress_interval: Duration,

    /// Free-form label written to the report header (e.g. environment name)
    #[serde(default)]
    pub label: Option<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            flush_every: default_flush_every(),
            max_held: default_max_held(),
            progress_interval: default_progress_interval(),
            label: None,
        }
    }
}

/// Main configuration for a dispatch run
///
/// Grouped into sub-configs:
/// - [`input`](InputConfig) - input file encoding
/// - [`dispatch`](DispatchConfig) - workers, chunk size, rate limit
/// - [`retry`](RetryConfig) - transient retry budget and backoff
/// - [`credentials`](CredentialConfig) - token exchange
/// - [`endpoint`](EndpointConfig) - dispatch target
/// - [`report`](ReportConfig) - flush cadence and progress
/// - [`schema`](RecordSchema) - named fields of an input line
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Input file
    #[serde(default)]
    pub input: InputConfig,

    /// Concurrency and pacing
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Transient retry behavior
    #[serde(default)]
    pub retry: RetryConfig,

    /// Token exchange
    #[serde(default)]
    pub credentials: CredentialConfig,

    /// Dispatch target
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Report output
    #[serde(default)]
    pub report: ReportConfig,

    /// Input record layout
    #[serde(default)]
    pub schema: RecordSchema,
}

impl Config {
    /// Check every setting the engine relies on
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let workers = self.dispatch.workers;
        if !(1..=MAX_WORKERS).contains(&workers) {
            return Err(Error::config(
                format!("workers must be between 1 and {MAX_WORKERS}, got {workers}"),
                "dispatch.workers",
            ));
        }
        if self.dispatch.chunk_size == 0 {
            return Err(Error::config(
                "chunk_size must be at least 1",
                "dispatch.chunk_size",
            ));
        }
        if self.dispatch.rate_limit_per_window == Some(0) {
            return Err(Error::config(
                "rate limit must be at least 1 (omit it for unlimited)",
                "dispatch.rate_limit_per_window",
            ));
        }
        if self.dispatch.rate_window.is_zero() {
            return Err(Error::config(
                "rate window must be longer than zero",
                "dispatch.rate_window",
            ));
        }
        let flush_every = self.report.flush_every;
        if !(1..=MAX_FLUSH_EVERY).contains(&flush_every) {
            return Err(Error::config(
                format!("flush_every must be between 1 and {MAX_FLUSH_EVERY}, got {flush_every}"),
                "report.flush_every",
            ));
        }
        if self.report.max_held == 0 {
            return Err(Error::config(
                "max_held must be at least 1",
                "report.max_held",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "backoff multiplier must be at least 1.0",
                "retry.backoff_multiplier",
            ));
        }
        self.input.resolve_encoding()?;
        validate_url(&self.endpoint.url, "endpoint.url")?;
        validate_url(&self.credentials.token_url, "credentials.token_url")?;
        if self.credentials.client_id.is_empty() {
            return Err(Error::config(
                "client_id must not be empty",
                "credentials.client_id",
            ));
        }
        self.schema.validate()
    }
}

fn validate_url(raw: &str, key: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| Error::config(format!("invalid URL '{}': {}", raw, e), key))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::config(
            format!("unsupported URL scheme '{}'", other),
            key,
        )),
    }
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_chunk_size() -> usize {
    1000
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_max_transient_retries() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_token_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_flush_every() -> usize {
    100
}

fn default_max_held() -> usize {
    1000
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(500)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            credentials: CredentialConfig {
                token_url: "https://auth.example.com/v1.0".to_string(),
                client_id: "Admin".to_string(),
                client_secret: "123456".to_string(),
                ..Default::default()
            },
            endpoint: EndpointConfig {
                url: "https://api.example.com/v1.0/person".to_string(),
                ..Default::default()
            },
            schema: RecordSchema::new('\t', ["OBJECT_ID", "FIRST_NAME", "LAST_NAME"]),
            ..Default::default()
        }
    }

    fn rejected_key(config: &Config) -> Option<String> {
        match config.validate() {
            Err(Error::Config { key, .. }) => key,
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.dispatch.workers, 1);
        assert_eq!(config.dispatch.chunk_size, 1000);
        assert_eq!(config.dispatch.rate_limit_per_window, None);
        assert_eq!(config.dispatch.rate_window, Duration::from_secs(60));
        assert_eq!(config.retry.max_transient_retries, 2);
        assert_eq!(config.report.flush_every, 100);
        assert_eq!(config.report.max_held, 1000);
        assert_eq!(config.input.encoding, "utf-8");
        assert_eq!(config.endpoint.timeout, Duration::from_secs(90));
        assert_eq!(config.credentials.timeout, Duration::from_secs(60));
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn workers_outside_one_to_eight_are_rejected() {
        for workers in [0, 9] {
            let mut config = valid_config();
            config.dispatch.workers = workers;
            assert_eq!(rejected_key(&config).as_deref(), Some("dispatch.workers"));
        }
        let mut config = valid_config();
        config.dispatch.workers = 8;
        config.validate().unwrap();
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let mut config = valid_config();
        config.dispatch.rate_limit_per_window = Some(0);
        assert_eq!(
            rejected_key(&config).as_deref(),
            Some("dispatch.rate_limit_per_window")
        );
    }

    #[test]
    fn flush_every_out_of_range_is_rejected() {
        let mut config = valid_config();
        config.report.flush_every = 0;
        assert_eq!(rejected_key(&config).as_deref(), Some("report.flush_every"));
    }

    #[test]
    fn input_encoding_is_resolved_from_label() {
        let mut config = valid_config();
        config.input.encoding = "windows-1252".to_string();
        config.validate().unwrap();
        assert_eq!(
            config.input.resolve_encoding().unwrap(),
            encoding_rs::WINDOWS_1252
        );

        config.input.encoding = "cp1252".to_string();
        assert_eq!(
            config.input.resolve_encoding().unwrap(),
            encoding_rs::WINDOWS_1252
        );

        config.input.encoding = "klingon".to_string();
        assert_eq!(rejected_key(&config).as_deref(), Some("input.encoding"));

        config.input.encoding = "utf-16le".to_string();
        assert_eq!(rejected_key(&config).as_deref(), Some("input.encoding"));
    }

    #[test]
    fn zero_max_held_is_rejected() {
        let mut config = valid_config();
        config.report.max_held = 0;
        assert_eq!(rejected_key(&config).as_deref(), Some("report.max_held"));
    }

    #[test]
    fn non_http_endpoint_is_rejected() {
        let mut config = valid_config();
        config.endpoint.url = "ftp://api.example.com/upload".to_string();
        assert_eq!(rejected_key(&config).as_deref(), Some("endpoint.url"));

        let mut config = valid_config();
        config.credentials.token_url = "not a url".to_string();
        assert_eq!(
            rejected_key(&config).as_deref(),
            Some("credentials.token_url")
        );
    }

    #[test]
    fn empty_schema_is_rejected() {
        let mut config = valid_config();
        config.schema = RecordSchema::default();
        assert_eq!(rejected_key(&config).as_deref(), Some("schema.fields"));
    }

    #[test]
    fn masked_secret_keeps_two_characters() {
        let config = valid_config();
        assert_eq!(config.credentials.masked_secret(), "12xxxxx");

        let short = CredentialConfig {
            client_secret: "x".to_string(),
            ..Default::default()
        };
        assert_eq!(short.masked_secret(), "xxxxxx");
    }

    #[test]
    fn durations_deserialize_from_seconds_and_millis() {
        let json = r#"{
            "input": {"encoding": "windows-1252"},
            "dispatch": {"workers": 4, "rate_limit_per_window": 120, "rate_window": 30},
            "retry": {"initial_delay": 2, "max_delay": 10},
            "report": {"progress_interval": 250}
        }"#;

        let config: Config = serde_json::from_str(json).expect("deserialize failed");

        assert_eq!(config.input.encoding, "windows-1252");
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.dispatch.rate_limit_per_window, Some(120));
        assert_eq!(config.dispatch.rate_window, Duration::from_secs(30));
        assert_eq!(config.dispatch.chunk_size, 1000, "missing keys fall back to defaults");
        assert_eq!(config.retry.initial_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
        assert_eq!(config.report.progress_interval, Duration::from_millis(250));
    }
}
