//! Throughput Prober
//!
//! Downloads from the test endpoint through each ranked candidate, in ranked
//! order, until enough candidates meet the minimum speed.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Url;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::result::{sort_by_throughput, RankedResult, RankedSet};

/// Throughput phase configuration
#[derive(Debug, Clone)]
pub struct ThroughputConfig {
    pub enabled: bool,
    pub url: String,
    /// Stop dispatching once this many candidates qualified
    pub target_count: usize,
    /// Time budget per candidate
    pub budget: Duration,
    /// Bytes per second; 0 accepts any measurement
    pub min_speed: f64,
    pub concurrency: usize,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://speed.cloudflare.com/__down?bytes=200000000".into(),
            target_count: 10,
            budget: Duration::from_secs(10),
            min_speed: 0.0,
            concurrency: 1,
        }
    }
}

/// Measures sustained download speed through one address
#[async_trait::async_trait]
pub trait SpeedProbe: Send + Sync {
    /// Bytes per second over at most `budget`; 0.0 on failure
    async fn measure(&self, addr: IpAddr, budget: Duration) -> f64;
}

/// Streams the download URL with its host pinned to the candidate
pub struct HttpDownloadProbe {
    url: Url,
    host: String,
    port: u16,
}

impl HttpDownloadProbe {
    pub fn new(url: &str) -> crate::Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| crate::Error::config(format!("invalid download url {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| crate::Error::config(format!("download url {} has no host", url)))?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(443);
        Ok(Self {
            url: parsed,
            host,
            port,
        })
    }

    async fn download(&self, addr: IpAddr, budget: Duration) -> reqwest::Result<(u64, Duration)> {
        let client = reqwest::Client::builder()
            .resolve(&self.host, SocketAddr::new(addr, self.port))
            .connect_timeout(budget)
            .build()?;

        let start = Instant::now();
        let deadline = start + budget;
        let mut resp = match timeout(budget, client.get(self.url.clone()).send()).await {
            Ok(resp) => resp?.error_for_status()?,
            Err(_) => {
                debug!("No response from {} within {:?}", addr, budget);
                return Ok((0, start.elapsed()));
            }
        };
        let mut bytes = 0u64;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, resp.chunk()).await {
                Ok(Ok(Some(chunk))) => bytes += chunk.len() as u64,
                Ok(Ok(None)) => break,
                Ok(Err(e)) if bytes == 0 => return Err(e),
                Ok(Err(e)) => {
                    debug!("Download from {} cut short: {}", addr, e);
                    break;
                }
                Err(_) => break,
            }
        }
        Ok((bytes, start.elapsed()))
    }
}

#[async_trait::async_trait]
impl SpeedProbe for HttpDownloadProbe {
    async fn measure(&self, addr: IpAddr, budget: Duration) -> f64 {
        match self.download(addr, budget).await {
            Ok((bytes, elapsed)) if !elapsed.is_zero() => bytes as f64 / elapsed.as_secs_f64(),
            Ok(_) => 0.0,
            Err(e) => {
                debug!("Download through {} failed: {}", addr, e);
                0.0
            }
        }
    }
}

pub struct ThroughputProber {
    probe: Arc<dyn SpeedProbe>,
    config: ThroughputConfig,
}

impl ThroughputProber {
    pub fn new(probe: Arc<dyn SpeedProbe>, config: ThroughputConfig) -> Self {
        Self { probe, config }
    }

    /// Measure ranked candidates until `target_count` qualify.
    ///
    /// Dispatch follows ranking order; nothing new is dispatched once the
    /// target is reached, in-flight measurements still complete. Qualifying
    /// results come back fastest first. When disabled the input passes
    /// through in ranking order.
    pub async fn run(&self, ranked: RankedSet) -> Vec<RankedResult> {
        if !self.config.enabled {
            return ranked.into_vec();
        }
        let target = self.config.target_count.max(1);
        let concurrency = self.config.concurrency.max(1);
        info!(
            "Throughput testing up to {} of {} candidates",
            target,
            ranked.len()
        );

        let accepted = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set = JoinSet::new();

        for candidate in ranked.into_vec() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if accepted.load(Ordering::SeqCst) >= target {
                break;
            }

            let probe = self.probe.clone();
            let accepted = accepted.clone();
            let budget = self.config.budget;
            let min_speed = self.config.min_speed;
            join_set.spawn(async move {
                let _permit = permit;
                let speed = probe.measure(candidate.addr(), budget).await;
                debug!(
                    "{} measured {:.2} MB/s",
                    candidate.addr(),
                    speed / 1024.0 / 1024.0
                );
                if speed >= min_speed {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    Some(candidate.with_throughput(speed))
                } else {
                    None
                }
            });
        }

        let mut qualified = Vec::new();
        while let Some(done) = join_set.join_next().await {
            match done {
                Ok(Some(result)) => qualified.push(result),
                Ok(None) => {}
                Err(e) => warn!("Throughput task failed: {}", e),
            }
        }
        sort_by_throughput(&mut qualified);
        info!("Throughput testing done: {} qualified", qualified.len());
        qualified
    }
}
