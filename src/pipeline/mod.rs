//! Pipeline Orchestration
//!
//! `PipelineOrchestrator` runs candidates -> latency -> filters -> throughput
//! and repeats the whole sequence while too few addresses qualify.
//! `PublishingRunner` wraps it with output and publication for the binary
//! and the health cycle.

pub mod health;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::{HealthCycleConfig, OutputConfig, PipelineConfig};
use crate::dns::Publisher;
use crate::error::Result;
use crate::output::{export_csv, filename_with_suffix, print_results};
use crate::probe::{
    trial_probe_for, CandidateSetBuilder, HttpDownloadProbe, LatencyProber, RankedResult,
    RankedSet, SpeedProbe, ThroughputProber, TrialProbe,
};

pub use health::{CycleState, HealthCycleController, TickOutcome, Timer};

pub struct PipelineOrchestrator {
    trial_probe: Arc<dyn TrialProbe>,
    speed_probe: Arc<dyn SpeedProbe>,
}

impl PipelineOrchestrator {
    pub fn new(trial_probe: Arc<dyn TrialProbe>, speed_probe: Arc<dyn SpeedProbe>) -> Self {
        Self {
            trial_probe,
            speed_probe,
        }
    }

    /// Probes matching the configured mode and download endpoint
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self::new(
            trial_probe_for(&config.latency)?,
            Arc::new(HttpDownloadProbe::new(&config.throughput.url)?),
        ))
    }

    /// Candidates, latency probing, ranking and filtering
    async fn probe_and_filter(&self, config: &PipelineConfig) -> Result<RankedSet> {
        let candidates = CandidateSetBuilder::new(config.exhaustive).build(&config.source)?;
        let prober = LatencyProber::new(
            self.trial_probe.clone(),
            config.latency.concurrency,
            config.latency.trials,
        );
        let results = prober.probe_all(candidates).await;
        let ranked = RankedSet::rank(results).apply(&config.filter);
        info!("{} addresses passed the delay/loss bounds", ranked.len());
        Ok(ranked)
    }

    async fn attempt(&self, config: &PipelineConfig) -> Result<Vec<RankedResult>> {
        let ranked = self.probe_and_filter(config).await?;
        let throughput = ThroughputProber::new(self.speed_probe.clone(), config.throughput.clone());
        Ok(throughput.run(ranked).await)
    }

    /// Run until `min_qualifying` addresses qualify or attempts run out.
    ///
    /// Returns the last attempt's results even when still short.
    /// Configuration errors end the run immediately.
    pub async fn run(&self, config: &PipelineConfig) -> Result<Vec<RankedResult>> {
        let retry = &config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let started = Instant::now();
        let mut results = Vec::new();

        for attempt in 1..=max_attempts {
            results = self.attempt(config).await?;
            if results.len() >= retry.min_qualifying {
                break;
            }
            if attempt < max_attempts {
                warn!(
                    "Only {} addresses qualified (minimum {}), retrying in {:?} ({}/{})",
                    results.len(),
                    retry.min_qualifying,
                    retry.backoff,
                    attempt,
                    max_attempts
                );
                tokio::time::sleep(retry.backoff).await;
            } else {
                warn!(
                    "Only {} addresses qualified (minimum {}) after {} attempts",
                    results.len(),
                    retry.min_qualifying,
                    max_attempts
                );
            }
        }

        info!(
            "Pipeline finished with {} results in {:.1}s",
            results.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(results)
    }

    /// Latency and filters only, for re-validating published addresses
    pub async fn health_probe(&self, config: &PipelineConfig) -> Result<RankedSet> {
        self.probe_and_filter(config).await
    }
}

/// What the health cycle drives
#[async_trait::async_trait]
pub trait SpeedTestRunner: Send {
    /// Full pipeline plus publication; returns the new published set
    async fn full_test(&mut self) -> Vec<IpAddr>;

    /// Number of `published` addresses still within the health bounds
    async fn health_check(&mut self, published: &[IpAddr]) -> usize;
}

/// Full tests with output and publication to the record stores
pub struct PublishingRunner {
    orchestrator: PipelineOrchestrator,
    pipeline: PipelineConfig,
    health: HealthCycleConfig,
    output: OutputConfig,
    publisher: Publisher,
}

impl PublishingRunner {
    pub fn new(
        orchestrator: PipelineOrchestrator,
        pipeline: PipelineConfig,
        health: HealthCycleConfig,
        output: OutputConfig,
        publisher: Publisher,
    ) -> Self {
        Self {
            orchestrator,
            pipeline,
            health,
            output,
            publisher,
        }
    }

    fn emit(&self, results: &[RankedResult], suffix: Option<&str>) {
        if let Some(path) = &self.output.csv_path {
            let path = match suffix {
                Some(suffix) => filename_with_suffix(path, suffix),
                None => path.clone(),
            };
            if let Err(e) = export_csv(&path, results) {
                error!("Failed to write {}: {}", path.display(), e);
            }
        }
        print_results(results, self.output.print_num);
    }
}

#[async_trait::async_trait]
impl SpeedTestRunner for PublishingRunner {
    async fn full_test(&mut self) -> Vec<IpAddr> {
        let mut published = Vec::new();

        for (family, source) in self.pipeline.source.split_families() {
            let config = self.pipeline.with_source(source);
            let label = family.map(|f| f.label());
            if let Some(label) = label {
                info!("Testing {} candidates", label);
            }

            let results = match self.orchestrator.run(&config).await {
                Ok(results) => results,
                Err(e) => {
                    error!("Speed test failed: {}", e);
                    continue;
                }
            };
            self.emit(&results, label);

            let report = self.publisher.publish(&results).await;
            for failure in report.failures() {
                if let Err(e) = &failure.result {
                    warn!("{} ({}) not updated: {}", failure.store, failure.target, e);
                }
            }
            published.extend(report.published);
        }

        info!("Published set now has {} addresses", published.len());
        published
    }

    async fn health_check(&mut self, published: &[IpAddr]) -> usize {
        if published.is_empty() {
            return 0;
        }
        let config = self.pipeline.for_health_check(published, &self.health);
        match self.orchestrator.health_probe(&config).await {
            Ok(survivors) => survivors.len(),
            Err(e) => {
                error!("Health check failed: {}", e);
                0
            }
        }
    }
}
