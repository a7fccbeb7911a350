//! End-to-end runs through the public API with scripted probes and an
//! in-memory record store.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use edgepick::config::{HealthCycleConfig, OutputConfig, PipelineConfig, RetryPolicy};
use edgepick::dns::{Publisher, RecordStore, RecordType, RemoteRecord};
use edgepick::pipeline::{
    CycleState, HealthCycleController, PipelineOrchestrator, PublishingRunner, SpeedTestRunner,
    TickOutcome,
};
use edgepick::probe::{
    CandidateSource, FilterBounds, LatencyConfig, SpeedProbe, ThroughputConfig, TrialOutcome,
    TrialProbe,
};
use edgepick::Result;

/// Delay of 10ms per unit of the last octet; addresses in `down` never answer
#[derive(Default)]
struct OctetNetwork {
    down: Mutex<HashSet<IpAddr>>,
}

#[async_trait::async_trait]
impl TrialProbe for OctetNetwork {
    async fn trial(&self, addr: IpAddr) -> TrialOutcome {
        if self.down.lock().contains(&addr) {
            return TrialOutcome::Failure;
        }
        let last = match addr {
            IpAddr::V4(v4) => v4.octets()[3],
            IpAddr::V6(v6) => v6.octets()[15],
        };
        TrialOutcome::Success {
            elapsed: Duration::from_millis(u64::from(last) * 10),
            region: None,
        }
    }
}

struct ConstantSpeed {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl SpeedProbe for ConstantSpeed {
    async fn measure(&self, _addr: IpAddr, _budget: Duration) -> f64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        2.0 * 1024.0 * 1024.0
    }
}

/// A records only, ids assigned sequentially
struct MemoryStore {
    records: Mutex<Vec<RemoteRecord>>,
    next_id: AtomicUsize,
}

impl MemoryStore {
    fn with_values(values: &[&str]) -> Arc<Self> {
        let records = values
            .iter()
            .enumerate()
            .map(|(i, v)| RemoteRecord {
                id: format!("r{}", i + 1),
                record_type: RecordType::A,
                value: v.to_string(),
                ttl: 600,
            })
            .collect::<Vec<_>>();
        Arc::new(Self {
            next_id: AtomicUsize::new(records.len() + 1),
            records: Mutex::new(records),
        })
    }

    fn values(&self) -> Vec<(String, String)> {
        let mut values: Vec<_> = self
            .records
            .lock()
            .iter()
            .map(|r| (r.id.clone(), r.value.clone()))
            .collect();
        values.sort();
        values
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn ttl(&self) -> u32 {
        600
    }

    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.record_type == record_type)
            .cloned()
            .collect())
    }

    async fn create(&self, record_type: RecordType, value: &str, ttl: u32) -> Result<RemoteRecord> {
        let record = RemoteRecord {
            id: format!("r{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            record_type,
            value: value.to_string(),
            ttl,
        };
        self.records.lock().push(record.clone());
        Ok(record)
    }

    async fn update(&self, _: RecordType, id: &str, value: &str, ttl: u32) -> Result<()> {
        if let Some(record) = self.records.lock().iter_mut().find(|r| r.id == id) {
            record.value = value.to_string();
            record.ttl = ttl;
        }
        Ok(())
    }

    async fn delete(&self, _: RecordType, id: &str) -> Result<()> {
        self.records.lock().retain(|r| r.id != id);
        Ok(())
    }
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        source: CandidateSource::Inline("10.0.0.4,10.0.0.2,10.0.0.1,10.0.0.3".into()),
        exhaustive: false,
        latency: LatencyConfig {
            concurrency: 4,
            trials: 2,
            ..LatencyConfig::default()
        },
        filter: FilterBounds::default(),
        throughput: ThroughputConfig {
            target_count: 3,
            ..ThroughputConfig::default()
        },
        retry: RetryPolicy {
            max_attempts: 2,
            min_qualifying: 1,
            backoff: Duration::ZERO,
        },
    }
}

fn health_config() -> HealthCycleConfig {
    HealthCycleConfig {
        check_interval: Duration::from_secs(60),
        full_test_interval: Duration::from_secs(3600),
        max_delay: Duration::from_millis(100),
        max_loss_rate: 0.0,
    }
}

struct Fixture {
    network: Arc<OctetNetwork>,
    speed: Arc<ConstantSpeed>,
    store: Arc<MemoryStore>,
    runner: PublishingRunner,
}

fn fixture(csv_path: Option<std::path::PathBuf>) -> Fixture {
    let network = Arc::new(OctetNetwork::default());
    let speed = Arc::new(ConstantSpeed {
        calls: AtomicUsize::new(0),
    });
    let store = MemoryStore::with_values(&["10.0.0.2", "192.0.2.9", "192.0.2.10"]);

    let stores: Vec<Arc<dyn RecordStore>> = vec![store.clone()];
    let runner = PublishingRunner::new(
        PipelineOrchestrator::new(network.clone(), speed.clone()),
        pipeline_config(),
        health_config(),
        OutputConfig {
            print_num: 2,
            csv_path,
        },
        Publisher::new(stores, Vec::new(), 2),
    );

    Fixture {
        network,
        speed,
        store,
        runner,
    }
}

fn ips(values: &[&str]) -> Vec<IpAddr> {
    values.iter().map(|v| v.parse().unwrap()).collect()
}

#[tokio::test]
async fn full_test_publishes_top_results_with_minimal_changes() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("result.csv");
    let mut fx = fixture(Some(csv.clone()));

    let published = fx.runner.full_test().await;

    assert_eq!(published, ips(&["10.0.0.1", "10.0.0.2"]));
    // r1 already held a wanted value, r2 was rewritten, r3 removed
    assert_eq!(
        fx.store.values(),
        vec![
            ("r1".to_string(), "10.0.0.2".to_string()),
            ("r2".to_string(), "10.0.0.1".to_string())
        ]
    );
    assert_eq!(fx.speed.calls.load(Ordering::SeqCst), 3);

    let content = std::fs::read_to_string(&csv).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[1].starts_with("10.0.0.1,2,2,0.00,10.00,2.00"));
}

#[tokio::test]
async fn health_check_counts_survivors_of_published_set() {
    let mut fx = fixture(None);
    let published = ips(&["10.0.0.1", "10.0.0.2", "10.0.0.20"]);

    // 10.0.0.20 answers in 200ms, above the 100ms health bound
    assert_eq!(fx.runner.health_check(&published).await, 2);

    fx.network.down.lock().insert("10.0.0.1".parse().unwrap());
    assert_eq!(fx.runner.health_check(&published).await, 1);

    // health checks never measure throughput
    assert_eq!(fx.speed.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.runner.health_check(&[]).await, 0);
}

#[tokio::test]
async fn degraded_address_triggers_republish() {
    let fx = fixture(None);
    let network = fx.network.clone();
    let store = fx.store.clone();
    let mut controller = HealthCycleController::new(fx.runner, health_config());

    controller.start().await;
    assert_eq!(controller.published(), ips(&["10.0.0.1", "10.0.0.2"]).as_slice());

    let outcome = controller.on_health_tick().await;
    assert_eq!(outcome, TickOutcome::Healthy { checked: 2 });

    network.down.lock().insert("10.0.0.1".parse().unwrap());
    let outcome = controller.on_health_tick().await;
    assert_eq!(
        outcome,
        TickOutcome::Degraded {
            checked: 2,
            survivors: 1,
            published: 2
        }
    );
    assert_eq!(controller.state(), CycleState::Monitoring);
    assert_eq!(controller.published(), ips(&["10.0.0.2", "10.0.0.3"]).as_slice());
    assert_eq!(
        store.values(),
        vec![
            ("r1".to_string(), "10.0.0.2".to_string()),
            ("r2".to_string(), "10.0.0.3".to_string())
        ]
    );
}

#[tokio::test]
async fn unusable_source_publishes_nothing() {
    let store = MemoryStore::with_values(&["192.0.2.9"]);
    let stores: Vec<Arc<dyn RecordStore>> = vec![store.clone()];
    let mut config = pipeline_config();
    config.source = CandidateSource::Inline("not-an-address".into());

    let mut runner = PublishingRunner::new(
        PipelineOrchestrator::new(
            Arc::new(OctetNetwork::default()),
            Arc::new(ConstantSpeed {
                calls: AtomicUsize::new(0),
            }),
        ),
        config,
        health_config(),
        OutputConfig {
            print_num: 2,
            csv_path: None,
        },
        Publisher::new(stores, Vec::new(), 2),
    );

    assert!(runner.full_test().await.is_empty());
    // existing records are left alone when nothing was measured
    assert_eq!(
        store.values(),
        vec![("r1".to_string(), "192.0.2.9".to_string())]
    );
}
