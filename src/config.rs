//! Configuration management
//!
//! Two configuration surfaces live here:
//!
//! - [`EngineConfig`]: engine tuning (memory bounds, write queue, layer
//!   timeouts, breaker, backplane, stripe count), loaded through figment
//!   from a YAML file merged with `METHOD_CACHE_`-prefixed environment
//!   variables.
//! - The `MethodCache:` policy-file schema: per-method cache policies with
//!   `Defaults`, `Services.<method-identity>`, and
//!   `Services.<service>.Methods.<method>` sections, consumed by the file
//!   policy source.
//!
//! Durations in the policy file accept humantime strings (`"30m"`, `"1h"`),
//! `HH:MM:SS`, and ISO-8601 durations (`PT30M`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::key::KeyGeneratorKind;
use crate::policy::{PolicyFragment, StampedeMode};
use crate::{Error, Result};

// ── Engine tuning ─────────────────────────────────────────────────────────

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// In-process memory layer (L1)
    pub memory: MemoryConfig,
    /// Asynchronous write fan-out queue
    pub queue: QueueConfig,
    /// Lower-layer timeouts and TTL clamps
    pub layers: LayersConfig,
    /// Per-layer circuit breaker
    pub breaker: BreakerConfig,
    /// Cross-instance invalidation backplane
    pub backplane: BackplaneConfig,
    /// Single-flight stripe pool size; rounded up to a power of two
    pub stripes: StripeConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file merged with
    /// `METHOD_CACHE_`-prefixed environment variables (nested fields split
    /// on `__`, e.g. `METHOD_CACHE_MEMORY__MAX_ENTRIES=50000`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("METHOD_CACHE_").split("__"))
            .extract()
            .map_err(|e| Error::config("engine-config", e.to_string()))
    }
}

/// Memory layer (L1) tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum entry count before eviction
    pub max_entries: usize,
    /// Maximum estimated byte size before eviction
    pub max_bytes: u64,
    /// Upper bound for any L1 entry TTL
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
    /// Background expiry-sweep interval
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Size-estimation mode
    pub estimator: EstimatorMode,
    /// Measurement period for the sampling/accurate estimators
    pub estimator_every: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_bytes: 256 * 1024 * 1024,
            max_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            estimator: EstimatorMode::Fast,
            estimator_every: 64,
        }
    }
}

/// Size-estimation mode for the memory layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorMode {
    /// Constant per entry plus key length and a per-type constant; never
    /// serializes (default)
    Fast,
    /// Serialize-and-measure a sample every Nth operation, extrapolate the
    /// rest
    Sampling,
    /// Serialize-and-measure, throttled to every Nth operation
    Accurate,
    /// Report zero for every entry
    Disabled,
}

/// Async write queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue capacity; the oldest task is dropped on overflow
    pub capacity: usize,
    /// Worker task count
    pub workers: usize,
    /// Maximum delivery attempts per task
    pub max_attempts: usize,
    /// Initial retry backoff
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum retry backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Write lower layers synchronously instead of through the queue
    pub write_through: bool,
    /// Drain pending tasks on graceful shutdown instead of dropping them
    pub drain_on_shutdown: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            workers: 2,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            write_through: false,
            drain_on_shutdown: true,
        }
    }
}

/// TTL clamp for one lower layer
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LayerTtlConfig {
    /// Hard upper bound for entry TTLs in this layer
    #[serde(default, with = "humantime_serde")]
    pub max: Option<Duration>,
    /// Fallback TTL when the policy supplies none that fits
    #[serde(default, with = "humantime_serde")]
    pub default: Option<Duration>,
}

/// Lower-layer (L2/L3) operation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayersConfig {
    /// Per-operation read timeout; a timeout reads as "not present"
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Per-operation write timeout; a timeout is retried or dropped
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// TTL clamp for the distributed layer (L2)
    pub distributed: LayerTtlConfig,
    /// TTL clamp for the persistent layer (L3)
    pub persistent: LayerTtlConfig,
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(250),
            write_timeout: Duration::from_secs(1),
            distributed: LayerTtlConfig::default(),
            persistent: LayerTtlConfig {
                max: Some(Duration::from_secs(24 * 60 * 60)),
                default: None,
            },
        }
    }
}

/// Per-layer circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Enable the breaker
    pub enabled: bool,
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Successes in half-open before the circuit closes
    pub success_threshold: u32,
    /// Cool-down before a half-open trial request
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Backplane transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackplaneConfig {
    /// Poll interval for polling transports
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Initial reconnect backoff after a subscription fault
    #[serde(with = "humantime_serde")]
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff
    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,
    /// De-duplication window (message identities remembered)
    pub dedup_window: usize,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            dedup_window: 1024,
        }
    }
}

/// Single-flight stripe pool size
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StripeConfig(pub usize);

impl StripeConfig {
    /// Stripe count rounded up to a power of two, minimum 1
    #[must_use]
    pub fn count(self) -> usize {
        self.0.max(1).next_power_of_two()
    }
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self(64)
    }
}

// ── Policy file schema ────────────────────────────────────────────────────

/// Root of the policy configuration file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicyFile {
    /// The `MethodCache:` mapping
    #[serde(rename = "MethodCache", default)]
    pub method_cache: PolicyFileSection,
}

impl PolicyFile {
    /// Parse a policy file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] when the file cannot be read
    /// or parsed; callers keep the previous snapshot in that case.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Figment::new()
            .merge(Yaml::file(path))
            .extract()
            .map_err(|e| Error::config(path.display().to_string(), e.to_string()))
    }
}

/// The `MethodCache:` section body
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicyFileSection {
    /// Defaults applied to every method
    #[serde(rename = "Defaults", default)]
    pub defaults: Option<FilePolicy>,
    /// Per-method and per-service entries
    #[serde(rename = "Services", default)]
    pub services: HashMap<String, ServiceEntry>,
}

/// One `Services.<identity>` entry: a policy body plus optional nested
/// `Methods` when the identity names a whole service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceEntry {
    /// Fields applying to the identity itself
    #[serde(flatten)]
    pub policy: FilePolicy,
    /// Per-method policies under a service identity
    #[serde(rename = "Methods", default)]
    pub methods: HashMap<String, FilePolicy>,
}

/// Policy fields as they appear in the file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilePolicy {
    /// Entry TTL (humantime, `HH:MM:SS`, or ISO-8601)
    #[serde(rename = "Duration", default)]
    pub duration: Option<String>,
    /// Sliding-expiration window
    #[serde(rename = "SlidingExpiration", default)]
    pub sliding: Option<String>,
    /// Tags attached to entries
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    /// Key version
    #[serde(rename = "Version", default)]
    pub version: Option<i64>,
    /// Enable flag
    #[serde(rename = "Enabled", default)]
    pub enabled: Option<bool>,
    /// Key-generator selector (`fast-hash`, `readable`, `raw:<index>`)
    #[serde(rename = "KeyGenerator", default)]
    pub key_generator: Option<String>,
    /// Require idempotency assertions from call sites
    #[serde(rename = "RequireIdempotent", default)]
    pub require_idempotent: Option<bool>,
    /// Stampede mode (`none`, `single-flight`, `probabilistic`)
    #[serde(rename = "StampedeMode", default)]
    pub stampede: Option<String>,
    /// Beta tuning for probabilistic early refresh
    #[serde(rename = "Beta", default)]
    pub beta: Option<f64>,
    /// Refresh-ahead window
    #[serde(rename = "RefreshAhead", default)]
    pub refresh_ahead: Option<String>,
}

impl FilePolicy {
    /// Convert to a policy fragment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] for unparsable durations or
    /// unknown selector strings.
    pub fn to_fragment(&self, origin: &str) -> Result<PolicyFragment> {
        let mut fragment = PolicyFragment::new();

        if let Some(raw) = &self.duration {
            fragment.duration = Some(parse_duration_value(raw).ok_or_else(|| {
                Error::config(origin, format!("unparsable Duration '{raw}'"))
            })?);
        }
        if let Some(raw) = &self.sliding {
            fragment.sliding = Some(parse_duration_value(raw).ok_or_else(|| {
                Error::config(origin, format!("unparsable SlidingExpiration '{raw}'"))
            })?);
        }
        if let Some(raw) = &self.refresh_ahead {
            fragment.refresh_ahead = Some(parse_duration_value(raw).ok_or_else(|| {
                Error::config(origin, format!("unparsable RefreshAhead '{raw}'"))
            })?);
        }
        if let Some(selector) = &self.key_generator {
            fragment.key_generator = Some(KeyGeneratorKind::parse(selector).ok_or_else(|| {
                Error::config(origin, format!("unknown KeyGenerator '{selector}'"))
            })?);
        }
        if let Some(mode) = &self.stampede {
            fragment.stampede = Some(match mode.as_str() {
                "none" => StampedeMode::None,
                "single-flight" => StampedeMode::SingleFlight,
                "probabilistic" => StampedeMode::Probabilistic {
                    beta: self.beta.unwrap_or(1.0),
                },
                other => {
                    return Err(Error::config(
                        origin,
                        format!("unknown StampedeMode '{other}'"),
                    ));
                }
            });
        }

        fragment.tags = self.tags.clone();
        fragment.version = self.version;
        fragment.enabled = self.enabled;
        fragment.require_idempotent = self.require_idempotent;
        Ok(fragment)
    }
}

// ── Duration parsing ──────────────────────────────────────────────────────

/// Parse a duration string: humantime (`"30m"`), `HH:MM:SS`, or an ISO-8601
/// duration (`PT30M`, `P1DT2H`).
#[must_use]
pub fn parse_duration_value(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(d) = humantime::parse_duration(raw) {
        return Some(d);
    }
    parse_hms(raw).or_else(|| parse_iso8601(raw))
}

/// `HH:MM:SS`, also accepting `D.HH:MM:SS` with a leading day count.
fn parse_hms(raw: &str) -> Option<Duration> {
    let (days, clock) = match raw.split_once('.') {
        Some((d, rest)) if d.chars().all(|c| c.is_ascii_digit()) && rest.contains(':') => {
            (d.parse::<u64>().ok()?, rest)
        }
        _ => (0, raw),
    };
    let mut parts = clock.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes > 59 || seconds > 59 {
        return None;
    }
    Some(Duration::from_secs(
        days * 86_400 + hours * 3600 + minutes * 60 + seconds,
    ))
}

/// Minimal ISO-8601 duration subset: `PnDTnHnMnS` with optional fractional
/// seconds. Years and months are rejected (no fixed length).
fn parse_iso8601(raw: &str) -> Option<Duration> {
    let rest = raw.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = Duration::ZERO;
    let mut number = String::new();

    for c in date_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else if c == 'D' {
            total += Duration::from_secs(number.parse::<u64>().ok()? * 86_400);
            number.clear();
        } else {
            return None;
        }
    }
    if !number.is_empty() {
        return None;
    }

    for c in time_part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            let value: f64 = number.parse().ok()?;
            number.clear();
            total += match c {
                'H' => Duration::from_secs_f64(value * 3600.0),
                'M' => Duration::from_secs_f64(value * 60.0),
                'S' => Duration::from_secs_f64(value),
                _ => return None,
            };
        }
    }
    if !number.is_empty() {
        return None;
    }
    if total == Duration::ZERO && raw == "P" {
        return None;
    }
    Some(total)
}
