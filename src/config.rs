//! Configuration
//!
//! `AppConfig` mirrors the TOML file (every key optional, see `Default`).
//! Environment variables prefixed with `EDGEPICK_` override file values.
//! The pipeline never reads `AppConfig` directly: `pipeline_config()` derives
//! an immutable `PipelineConfig` that is passed down the call chain.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::probe::{
    CandidateSource, FilterBounds, LatencyConfig, ProbeMode, RequestProbeConfig,
    ThroughputConfig, DEFAULT_ACCEPTED_CODES, DEFAULT_MAX_DELAY, DEFAULT_MAX_LOSS_RATE,
    DEFAULT_MIN_DELAY, MAX_CONCURRENCY,
};

const ENV_PREFIX: &str = "EDGEPICK";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Main configuration, one field per TOML key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Latency probing concurrency
    pub routines: usize,
    /// Trials per address
    pub ping_times: u32,
    /// Port for connect-mode trials
    pub tcp_port: u16,
    /// Upper bound on mean delay (ms); 9999 disables the bound
    pub max_delay: u64,
    /// Lower bound on mean delay (ms)
    pub min_delay: u64,
    /// Upper bound on loss rate; 1.0 accepts everything
    pub max_loss_rate: f64,
    /// Per-trial timeout
    #[serde(with = "duration_serde")]
    pub trial_timeout: Duration,

    /// Use request-mode trials instead of connect-mode
    pub httping: bool,
    /// Accepted status code (0 = 200/301/302)
    pub httping_code: u16,
    /// Comma separated accepted regions (request mode only)
    pub cfcolo: String,

    /// Number of addresses that must pass the throughput test
    pub test_count: usize,
    /// Throughput budget per address (seconds)
    pub download_time: u64,
    /// Concurrent throughput probes
    pub download_concurrency: usize,
    /// Endpoint used for request trials and downloads
    pub url: String,
    /// Minimum acceptable throughput (MB/s)
    pub min_speed: f64,
    pub disable_download: bool,

    /// Results shown and published per run
    pub print_num: usize,
    pub ip_file: String,
    pub ipv4_file: String,
    pub ipv6_file: String,
    pub ip_text: String,
    /// CSV export path (empty disables export)
    pub output: String,
    /// Enumerate every IPv4 address instead of sampling one per /24
    pub test_all: bool,

    /// Full pipeline attempts when too few addresses qualify
    pub max_attempts: u32,
    /// Minimum qualifying addresses before retries stop
    pub min_num: usize,

    pub debug: bool,
    /// Append every log line to this file as well (empty disables)
    pub log_file: String,

    pub alidns: AliDnsConfig,
    pub dnspod: DnsPodConfig,
    pub cloudflare: CloudflareConfig,
    pub cfkv: CloudflareKvConfig,
    pub cron: CronConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            routines: 200,
            ping_times: 4,
            tcp_port: 443,
            max_delay: DEFAULT_MAX_DELAY.as_millis() as u64,
            min_delay: DEFAULT_MIN_DELAY.as_millis() as u64,
            max_loss_rate: DEFAULT_MAX_LOSS_RATE,
            trial_timeout: Duration::from_millis(1000),
            httping: false,
            httping_code: 0,
            cfcolo: String::new(),
            test_count: 10,
            download_time: 10,
            download_concurrency: 1,
            url: "https://speed.cloudflare.com/__down?bytes=200000000".into(),
            min_speed: 0.0,
            disable_download: false,
            print_num: 10,
            ip_file: "ip.txt".into(),
            ipv4_file: String::new(),
            ipv6_file: String::new(),
            ip_text: String::new(),
            output: "result.csv".into(),
            test_all: false,
            max_attempts: 1,
            min_num: 0,
            debug: false,
            log_file: String::new(),
            alidns: AliDnsConfig::default(),
            dnspod: DnsPodConfig::default(),
            cloudflare: CloudflareConfig::default(),
            cfkv: CloudflareKvConfig::default(),
            cron: CronConfig::default(),
        }
    }
}

/// Alibaba Cloud DNS credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AliDnsConfig {
    pub enable: bool,
    pub accesskey_id: String,
    pub accesskey_secret: String,
    pub domain: String,
    pub subdomain: String,
    pub ttl: u32,
}

impl Default for AliDnsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            accesskey_id: String::new(),
            accesskey_secret: String::new(),
            domain: String::new(),
            subdomain: String::new(),
            ttl: 600,
        }
    }
}

/// DNSPod (Tencent Cloud) credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsPodConfig {
    pub enable: bool,
    pub secret_id: String,
    pub secret_key: String,
    pub domain: String,
    pub subdomain: String,
    pub ttl: u32,
}

impl Default for DnsPodConfig {
    fn default() -> Self {
        Self {
            enable: false,
            secret_id: String::new(),
            secret_key: String::new(),
            domain: String::new(),
            subdomain: String::new(),
            ttl: 600,
        }
    }
}

/// Cloudflare DNS credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    pub enable: bool,
    pub api_token: String,
    pub zone_id: String,
    pub domain: String,
    pub subdomain: String,
    pub proxied: bool,
    /// 1 means automatic
    pub ttl: u32,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            enable: false,
            api_token: String::new(),
            zone_id: String::new(),
            domain: String::new(),
            subdomain: String::new(),
            proxied: false,
            ttl: 1,
        }
    }
}

/// Cloudflare KV namespace used to publish the full result list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareKvConfig {
    pub enable: bool,
    pub api_token: String,
    pub account_id: String,
    pub namespace_id: String,
}

/// Periodic health cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub enable: bool,
    /// Health-check delay bound (ms)
    pub latency_threshold: u64,
    /// Health-check loss bound
    pub loss_rate_threshold: f64,
    /// Minutes between health checks
    pub check_interval: u64,
    /// Hours between forced full tests
    pub test_interval: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enable: false,
            latency_threshold: 9999,
            loss_rate_threshold: 1.0,
            check_interval: 30,
            test_interval: 24,
        }
    }
}

/// Retry bound for the orchestrated pipeline
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_qualifying: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            min_qualifying: 0,
            backoff: Duration::from_secs(3),
        }
    }
}

/// Immutable per-invocation configuration of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: CandidateSource,
    pub exhaustive: bool,
    pub latency: LatencyConfig,
    pub filter: FilterBounds,
    pub throughput: ThroughputConfig,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    /// Derived configuration for a health check of the published set.
    ///
    /// Only the candidate source and the delay/loss upper bounds change.
    pub fn for_health_check(&self, published: &[IpAddr], health: &HealthCycleConfig) -> Self {
        let mut derived = self.clone();
        derived.source = CandidateSource::Addresses(published.to_vec());
        derived.exhaustive = false;
        derived.filter.max_delay = health.max_delay;
        derived.filter.max_loss_rate = health.max_loss_rate;
        derived.throughput.enabled = false;
        derived
    }

    /// Same run restricted to a single candidate source
    pub fn with_source(&self, source: CandidateSource) -> Self {
        let mut derived = self.clone();
        derived.source = source;
        derived
    }
}

/// Timers and thresholds of the health cycle
#[derive(Debug, Clone)]
pub struct HealthCycleConfig {
    pub check_interval: Duration,
    pub full_test_interval: Duration,
    pub max_delay: Duration,
    pub max_loss_rate: f64,
}

/// Where final results go besides the record stores
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub print_num: usize,
    pub csv_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load from `path`, or from `config.toml` when no path is given.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file falls back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_file(path)?,
            None => match Self::load_file(Path::new(DEFAULT_CONFIG_FILE)) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to load {}: {}, using defaults", DEFAULT_CONFIG_FILE, e);
                    Self::default()
                }
            },
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid config file: {}", e)))
    }

    /// Apply `EDGEPICK_*` environment variables on top of file values
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name));

        override_parsed(&get, "ROUTINES", &mut self.routines);
        override_parsed(&get, "PING_TIMES", &mut self.ping_times);
        override_parsed(&get, "TCP_PORT", &mut self.tcp_port);
        override_parsed(&get, "MAX_DELAY", &mut self.max_delay);
        override_parsed(&get, "MIN_DELAY", &mut self.min_delay);
        override_parsed(&get, "MAX_LOSS_RATE", &mut self.max_loss_rate);
        override_parsed(&get, "HTTPING", &mut self.httping);
        override_parsed(&get, "HTTPING_CODE", &mut self.httping_code);
        override_parsed(&get, "CFCOLO", &mut self.cfcolo);
        override_parsed(&get, "TEST_COUNT", &mut self.test_count);
        override_parsed(&get, "DOWNLOAD_TIME", &mut self.download_time);
        override_parsed(&get, "URL", &mut self.url);
        override_parsed(&get, "MIN_SPEED", &mut self.min_speed);
        override_parsed(&get, "DISABLE_DOWNLOAD", &mut self.disable_download);
        override_parsed(&get, "PRINT_NUM", &mut self.print_num);
        override_parsed(&get, "IP_FILE", &mut self.ip_file);
        override_parsed(&get, "IPV4_FILE", &mut self.ipv4_file);
        override_parsed(&get, "IPV6_FILE", &mut self.ipv6_file);
        override_parsed(&get, "IP_TEXT", &mut self.ip_text);
        override_parsed(&get, "OUTPUT", &mut self.output);
        override_parsed(&get, "TEST_ALL", &mut self.test_all);
        override_parsed(&get, "MAX_ATTEMPTS", &mut self.max_attempts);
        override_parsed(&get, "MIN_NUM", &mut self.min_num);
        override_parsed(&get, "DEBUG", &mut self.debug);
        override_parsed(&get, "LOG_FILE", &mut self.log_file);

        override_parsed(&get, "ALIDNS_ENABLE", &mut self.alidns.enable);
        override_parsed(&get, "ALIDNS_ACCESSKEY_ID", &mut self.alidns.accesskey_id);
        override_parsed(&get, "ALIDNS_ACCESSKEY_SECRET", &mut self.alidns.accesskey_secret);
        override_parsed(&get, "ALIDNS_DOMAIN", &mut self.alidns.domain);
        override_parsed(&get, "ALIDNS_SUBDOMAIN", &mut self.alidns.subdomain);
        override_parsed(&get, "ALIDNS_TTL", &mut self.alidns.ttl);

        override_parsed(&get, "DNSPOD_ENABLE", &mut self.dnspod.enable);
        override_parsed(&get, "DNSPOD_SECRET_ID", &mut self.dnspod.secret_id);
        override_parsed(&get, "DNSPOD_SECRET_KEY", &mut self.dnspod.secret_key);
        override_parsed(&get, "DNSPOD_DOMAIN", &mut self.dnspod.domain);
        override_parsed(&get, "DNSPOD_SUBDOMAIN", &mut self.dnspod.subdomain);
        override_parsed(&get, "DNSPOD_TTL", &mut self.dnspod.ttl);

        override_parsed(&get, "CLOUDFLARE_ENABLE", &mut self.cloudflare.enable);
        override_parsed(&get, "CLOUDFLARE_API_TOKEN", &mut self.cloudflare.api_token);
        override_parsed(&get, "CLOUDFLARE_ZONE_ID", &mut self.cloudflare.zone_id);
        override_parsed(&get, "CLOUDFLARE_DOMAIN", &mut self.cloudflare.domain);
        override_parsed(&get, "CLOUDFLARE_SUBDOMAIN", &mut self.cloudflare.subdomain);
        override_parsed(&get, "CLOUDFLARE_PROXIED", &mut self.cloudflare.proxied);
        override_parsed(&get, "CLOUDFLARE_TTL", &mut self.cloudflare.ttl);

        override_parsed(&get, "CFKV_ENABLE", &mut self.cfkv.enable);
        override_parsed(&get, "CFKV_API_TOKEN", &mut self.cfkv.api_token);
        override_parsed(&get, "CFKV_ACCOUNT_ID", &mut self.cfkv.account_id);
        override_parsed(&get, "CFKV_NAMESPACE_ID", &mut self.cfkv.namespace_id);

        override_parsed(&get, "CRON_ENABLE", &mut self.cron.enable);
        override_parsed(&get, "CRON_LATENCY_THRESHOLD", &mut self.cron.latency_threshold);
        override_parsed(&get, "CRON_LOSS_RATE_THRESHOLD", &mut self.cron.loss_rate_threshold);
        override_parsed(&get, "CRON_CHECK_INTERVAL", &mut self.cron.check_interval);
        override_parsed(&get, "CRON_TEST_INTERVAL", &mut self.cron.test_interval);
    }

    /// Candidate source by precedence: inline text > v4/v6 files > combined file
    pub fn candidate_source(&self) -> CandidateSource {
        if !self.ip_text.trim().is_empty() {
            return CandidateSource::Inline(self.ip_text.clone());
        }
        if !self.ipv4_file.is_empty() || !self.ipv6_file.is_empty() {
            return CandidateSource::FamilyFiles {
                v4: non_empty_path(&self.ipv4_file),
                v6: non_empty_path(&self.ipv6_file),
            };
        }
        CandidateSource::File(PathBuf::from(&self.ip_file))
    }

    /// Derive the immutable run configuration
    pub fn pipeline_config(&self) -> PipelineConfig {
        let mode = if self.httping {
            let accepted_codes = if self.httping_code > 0 {
                vec![self.httping_code]
            } else {
                DEFAULT_ACCEPTED_CODES.to_vec()
            };
            ProbeMode::Request(RequestProbeConfig {
                url: self.url.clone(),
                accepted_codes,
                regions: parse_regions(&self.cfcolo),
            })
        } else {
            ProbeMode::Connect
        };

        let defaults = Self::default();
        let max_loss_rate = if (0.0..=1.0).contains(&self.max_loss_rate) {
            self.max_loss_rate
        } else {
            warn!(
                "max_loss_rate {} outside [0, 1], using {}",
                self.max_loss_rate, defaults.max_loss_rate
            );
            defaults.max_loss_rate
        };

        let filter = FilterBounds {
            max_delay: Duration::from_millis(if self.max_delay > 0 {
                self.max_delay
            } else {
                defaults.max_delay
            }),
            min_delay: Duration::from_millis(self.min_delay),
            max_loss_rate,
        };

        if self.min_speed > 0.0 && filter.max_delay == DEFAULT_MAX_DELAY {
            warn!("min_speed is set without max_delay; runs may retry until max_attempts to fill test_count");
        }

        PipelineConfig {
            source: self.candidate_source(),
            exhaustive: self.test_all,
            latency: LatencyConfig {
                concurrency: positive_or(self.routines, defaults.routines).min(MAX_CONCURRENCY),
                trials: if self.ping_times > 0 { self.ping_times } else { defaults.ping_times },
                port: if self.tcp_port > 0 { self.tcp_port } else { defaults.tcp_port },
                timeout: self.trial_timeout,
                mode,
            },
            filter,
            throughput: ThroughputConfig {
                enabled: !self.disable_download,
                url: self.url.clone(),
                target_count: positive_or(self.test_count, defaults.test_count),
                budget: Duration::from_secs(positive_or(
                    self.download_time as usize,
                    defaults.download_time as usize,
                ) as u64),
                min_speed: self.min_speed.max(0.0) * 1024.0 * 1024.0,
                concurrency: positive_or(self.download_concurrency, 1).min(MAX_CONCURRENCY),
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                min_qualifying: self.min_num,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn health_cycle_config(&self) -> HealthCycleConfig {
        let defaults = CronConfig::default();
        let cron = &self.cron;
        HealthCycleConfig {
            check_interval: Duration::from_secs(
                positive_or(cron.check_interval as usize, defaults.check_interval as usize) as u64
                    * 60,
            ),
            full_test_interval: Duration::from_secs(
                positive_or(cron.test_interval as usize, defaults.test_interval as usize) as u64
                    * 3600,
            ),
            max_delay: Duration::from_millis(if cron.latency_threshold > 0 {
                cron.latency_threshold
            } else {
                defaults.latency_threshold
            }),
            max_loss_rate: if (0.0..=1.0).contains(&cron.loss_rate_threshold) {
                cron.loss_rate_threshold
            } else {
                defaults.loss_rate_threshold
            },
        }
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        non_empty_path(&self.log_file)
    }

    pub fn output_config(&self) -> OutputConfig {
        let trimmed = self.output.trim();
        OutputConfig {
            print_num: self.print_num,
            csv_path: if trimmed.is_empty() {
                None
            } else {
                Some(PathBuf::from(trimmed))
            },
        }
    }
}

fn override_parsed<T, F>(get: &F, name: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        if raw.is_empty() {
            return;
        }
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring {}_{}={:?}: cannot parse", ENV_PREFIX, name, raw),
        }
    }
}

fn positive_or(value: usize, fallback: usize) -> usize {
    if value > 0 {
        value
    } else {
        fallback
    }
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(raw.trim()))
    }
}

fn parse_regions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// Serde helper for Duration (using milliseconds for simplicity)
mod duration_serde {
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
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
