//! Latency Prober
//!
//! Runs `trials` sequential trials against every candidate on a fixed-size
//! worker pool. Two trial kinds are supported:
//! - TCP connect to `addr:port`
//! - HTTP HEAD request pinned to `addr`, checking the status code and
//!   reading the serving region from edge headers

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::candidates::Candidate;
use super::result::ProbeResult;

/// Hard cap on worker count
pub const MAX_CONCURRENCY: usize = 1000;

/// Status codes accepted by request trials when none is configured
pub const DEFAULT_ACCEPTED_CODES: [u16; 3] = [200, 301, 302];

/// Latency probing configuration
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Worker count
    pub concurrency: usize,
    /// Trials per candidate
    pub trials: u32,
    /// Port for connect trials
    pub port: u16,
    /// Per-trial timeout
    pub timeout: Duration,
    pub mode: ProbeMode,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            concurrency: 200,
            trials: 4,
            port: 443,
            timeout: Duration::from_secs(1),
            mode: ProbeMode::Connect,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeMode {
    Connect,
    Request(RequestProbeConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestProbeConfig {
    pub url: String,
    pub accepted_codes: Vec<u16>,
    /// Upper-case region codes; empty accepts any region
    pub regions: Vec<String>,
}

/// Outcome of a single trial
#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Success {
        elapsed: Duration,
        region: Option<String>,
    },
    Failure,
}

/// One trial against one address
#[async_trait::async_trait]
pub trait TrialProbe: Send + Sync {
    async fn trial(&self, addr: IpAddr) -> TrialOutcome;

    /// Whether a candidate whose trials reported `region` should be kept
    fn accepts_region(&self, _region: Option<&str>) -> bool {
        true
    }
}

/// TCP connect trial; the connection is dropped as soon as it is up
pub struct ConnectProbe {
    port: u16,
    timeout: Duration,
}

impl ConnectProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait::async_trait]
impl TrialProbe for ConnectProbe {
    async fn trial(&self, addr: IpAddr) -> TrialOutcome {
        let target = SocketAddr::new(addr, self.port);
        let start = Instant::now();

        match timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => TrialOutcome::Success {
                elapsed: start.elapsed(),
                region: None,
            },
            Ok(Err(e)) => {
                debug!("TCP connect failed for {}: {}", target, e);
                TrialOutcome::Failure
            }
            Err(_) => {
                debug!("TCP connect timeout for {}", target);
                TrialOutcome::Failure
            }
        }
    }
}

/// HTTP HEAD trial with the request host pinned to the candidate address
pub struct RequestProbe {
    url: Url,
    host: String,
    port: u16,
    timeout: Duration,
    accepted_codes: Vec<u16>,
    regions: Vec<String>,
}

impl RequestProbe {
    pub fn new(config: &RequestProbeConfig, timeout: Duration) -> crate::Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| crate::Error::config(format!("invalid probe url {}: {}", config.url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| crate::Error::config(format!("probe url {} has no host", config.url)))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        Ok(Self {
            url,
            host,
            port,
            timeout,
            accepted_codes: config.accepted_codes.clone(),
            regions: config.regions.clone(),
        })
    }

    fn client_for(&self, addr: IpAddr) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .resolve(&self.host, SocketAddr::new(addr, self.port))
            .redirect(Policy::none())
            .timeout(self.timeout)
            .build()
    }
}

#[async_trait::async_trait]
impl TrialProbe for RequestProbe {
    async fn trial(&self, addr: IpAddr) -> TrialOutcome {
        let client = match self.client_for(addr) {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build probe client for {}: {}", addr, e);
                return TrialOutcome::Failure;
            }
        };

        let start = Instant::now();
        match client.head(self.url.clone()).send().await {
            Ok(resp) => {
                let elapsed = start.elapsed();
                let status = resp.status().as_u16();
                if !self.accepted_codes.contains(&status) {
                    debug!("Request trial {} returned status {}", addr, status);
                    return TrialOutcome::Failure;
                }
                TrialOutcome::Success {
                    elapsed,
                    region: region_from_headers(resp.headers()),
                }
            }
            Err(e) => {
                debug!("Request trial failed for {}: {}", addr, e);
                TrialOutcome::Failure
            }
        }
    }

    fn accepts_region(&self, region: Option<&str>) -> bool {
        if self.regions.is_empty() {
            return true;
        }
        region.map_or(false, |r| self.regions.iter().any(|want| want == r))
    }
}

/// Serving region from edge response headers.
///
/// `cf-ray: <id>-HKG` yields the suffix after the last `-`;
/// `x-amz-cf-pop: SFO53-P1` yields the first three characters.
pub fn region_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(ray) = headers.get("cf-ray").and_then(|v| v.to_str().ok()) {
        if let Some((_, region)) = ray.rsplit_once('-') {
            if !region.is_empty() {
                return Some(region.to_ascii_uppercase());
            }
        }
    }
    if let Some(pop) = headers.get("x-amz-cf-pop").and_then(|v| v.to_str().ok()) {
        let region: String = pop.chars().take(3).collect();
        if region.len() == 3 {
            return Some(region.to_ascii_uppercase());
        }
    }
    None
}

/// Build the trial probe for a configuration
pub fn trial_probe_for(config: &LatencyConfig) -> crate::Result<Arc<dyn TrialProbe>> {
    Ok(match &config.mode {
        ProbeMode::Connect => Arc::new(ConnectProbe::new(config.port, config.timeout)),
        ProbeMode::Request(req) => Arc::new(RequestProbe::new(req, config.timeout)?),
    })
}

/// Fixed-size worker pool over a candidate queue
pub struct LatencyProber {
    probe: Arc<dyn TrialProbe>,
    concurrency: usize,
    trials: u32,
}

impl LatencyProber {
    pub fn new(probe: Arc<dyn TrialProbe>, concurrency: usize, trials: u32) -> Self {
        Self {
            probe,
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
            trials: trials.max(1),
        }
    }

    /// Probe every candidate exactly once.
    ///
    /// Returns one result per candidate (zero-success candidates included),
    /// minus candidates rejected by the region filter. Order is unspecified.
    pub async fn probe_all(&self, candidates: Vec<Candidate>) -> Vec<ProbeResult> {
        let total = candidates.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = self.concurrency.min(total);
        info!(
            "Latency probing {} candidates ({} workers, {} trials each)",
            total, workers, self.trials
        );

        let (tx, rx) = mpsc::channel::<Candidate>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let results = Arc::new(parking_lot::Mutex::new(Vec::with_capacity(total)));

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let rx = rx.clone();
            let results = results.clone();
            let probe = self.probe.clone();
            let trials = self.trials;
            pool.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(candidate) = next else { break };
                    if let Some(result) = run_trials(probe.as_ref(), candidate.addr, trials).await {
                        results.lock().push(result);
                    }
                }
            });
        }

        for candidate in candidates {
            if tx.send(candidate).await.is_err() {
                warn!("Latency workers exited early");
                break;
            }
        }
        drop(tx);

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                warn!("Latency worker failed: {}", e);
            }
        }

        let results = std::mem::take(&mut *results.lock());
        let reachable = results.iter().filter(|r| r.received > 0).count();
        info!("Latency probing done: {}/{} reachable", reachable, total);
        results
    }
}

/// Sequential trials against one address
async fn run_trials(probe: &dyn TrialProbe, addr: IpAddr, trials: u32) -> Option<ProbeResult> {
    let mut received = 0u32;
    let mut total = Duration::ZERO;
    let mut region = None;

    for _ in 0..trials {
        if let TrialOutcome::Success {
            elapsed,
            region: seen,
        } = probe.trial(addr).await
        {
            received += 1;
            total += elapsed;
            if region.is_none() {
                region = seen;
            }
        }
    }

    if received > 0 && !probe.accepts_region(region.as_deref()) {
        debug!("Dropping {}: region {:?} not accepted", addr, region);
        return None;
    }

    Some(ProbeResult::from_trials(addr, trials, received, total, region))
}
