//! Publication of final results
//!
//! The top `print_num` results are split by address family; every enabled
//! store is reconciled for A and AAAA independently. A family without
//! results is left untouched. One store failing never stops the others.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{error, info, warn};

use super::reconcile::{reconcile, ReconcileSummary};
use super::{enabled_result_publishers, enabled_stores, RecordStore, RecordType};
use crate::config::AppConfig;
use crate::error::Result;
use crate::probe::{AddressFamily, RankedResult};

/// Sink for the full result list of one family (key/value stores)
#[async_trait::async_trait]
pub trait ResultPublisher: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, family: AddressFamily, results: &[RankedResult]) -> Result<()>;
}

/// Outcome of one store for one record type or family
#[derive(Debug)]
pub struct StoreOutcome {
    pub store: String,
    /// Record type or family label
    pub target: String,
    /// `None` for result publishers
    pub result: Result<Option<ReconcileSummary>>,
}

#[derive(Debug, Default)]
pub struct PublishReport {
    /// Addresses that were offered to the record stores
    pub published: Vec<IpAddr>,
    pub outcomes: Vec<StoreOutcome>,
}

impl PublishReport {
    pub fn failures(&self) -> impl Iterator<Item = &StoreOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}

pub struct Publisher {
    stores: Vec<Arc<dyn RecordStore>>,
    result_publishers: Vec<Arc<dyn ResultPublisher>>,
    print_num: usize,
}

impl Publisher {
    pub fn new(
        stores: Vec<Arc<dyn RecordStore>>,
        result_publishers: Vec<Arc<dyn ResultPublisher>>,
        print_num: usize,
    ) -> Self {
        Self {
            stores,
            result_publishers,
            print_num,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            enabled_stores(config),
            enabled_result_publishers(config),
            config.print_num,
        )
    }

    /// Desired A and AAAA values from the top `print_num` results
    pub fn desired_values(&self, results: &[RankedResult]) -> (Vec<String>, Vec<String>) {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for result in results.iter().take(self.print_num) {
            match AddressFamily::of(&result.addr()) {
                AddressFamily::V4 => v4.push(result.addr().to_string()),
                AddressFamily::V6 => v6.push(result.addr().to_string()),
            }
        }
        (v4, v6)
    }

    pub async fn publish(&self, results: &[RankedResult]) -> PublishReport {
        let mut report = PublishReport::default();
        if results.is_empty() {
            info!("No results to publish");
            return report;
        }

        let (v4, v6) = self.desired_values(results);
        report.published = v4
            .iter()
            .chain(v6.iter())
            .filter_map(|v| v.parse().ok())
            .collect();

        for store in &self.stores {
            if let Err(e) = store.validate() {
                error!("Skipping {}: {}", store.name(), e);
                report.outcomes.push(StoreOutcome {
                    store: store.name().to_string(),
                    target: "config".into(),
                    result: Err(e),
                });
                continue;
            }

            for (record_type, desired) in [(RecordType::A, &v4), (RecordType::AAAA, &v6)] {
                if desired.is_empty() {
                    continue;
                }
                info!("Syncing {} {} records to {}", desired.len(), record_type, store.name());
                let result = reconcile(store.as_ref(), record_type, desired).await;
                match &result {
                    Err(e) if e.is_store_rejection() => {
                        warn!("{} rejected the {} record sync: {}", store.name(), record_type, e);
                    }
                    Err(e) => {
                        error!("Sync of {} records to {} failed: {}", record_type, store.name(), e);
                    }
                    Ok(_) => {}
                }
                report.outcomes.push(StoreOutcome {
                    store: store.name().to_string(),
                    target: record_type.to_string(),
                    result: result.map(Some),
                });
            }
        }

        for publisher in &self.result_publishers {
            if let Err(e) = publisher.validate() {
                error!("Skipping {}: {}", publisher.name(), e);
                report.outcomes.push(StoreOutcome {
                    store: publisher.name().to_string(),
                    target: "config".into(),
                    result: Err(e),
                });
                continue;
            }

            for family in [AddressFamily::V4, AddressFamily::V6] {
                let subset: Vec<RankedResult> = results
                    .iter()
                    .filter(|r| AddressFamily::of(&r.addr()) == family)
                    .cloned()
                    .collect();
                if subset.is_empty() {
                    continue;
                }
                let result = publisher.publish(family, &subset).await;
                if let Err(e) = &result {
                    error!("Publishing {} results to {} failed: {}", family.label(), publisher.name(), e);
                } else {
                    info!("Published {} {} results to {}", subset.len(), family.label(), publisher.name());
                }
                report.outcomes.push(StoreOutcome {
                    store: publisher.name().to_string(),
                    target: family.label().to_string(),
                    result: result.map(|_| None),
                });
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::RemoteRecord;
    use crate::error::Error;
    use crate::probe::ProbeResult;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Store that records the desired values it was driven towards
    struct RecordingStore {
        name: &'static str,
        fail: bool,
        created: Mutex<Vec<(RecordType, String)>>,
    }

    impl RecordingStore {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                created: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl RecordStore for RecordingStore {
        fn name(&self) -> &str {
            self.name
        }

        fn ttl(&self) -> u32 {
            300
        }

        async fn list(&self, _record_type: RecordType) -> Result<Vec<RemoteRecord>> {
            if self.fail {
                return Err(Error::store(self.name, "unauthorized"));
            }
            Ok(Vec::new())
        }

        async fn create(&self, record_type: RecordType, value: &str, ttl: u32) -> Result<RemoteRecord> {
            self.created.lock().push((record_type, value.to_string()));
            Ok(RemoteRecord {
                id: value.to_string(),
                record_type,
                value: value.to_string(),
                ttl,
            })
        }

        async fn update(&self, _: RecordType, _: &str, _: &str, _: u32) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _: RecordType, _: &str) -> Result<()> {
            Ok(())
        }
    }

    struct CountingPublisher {
        calls: Mutex<Vec<(AddressFamily, usize)>>,
    }

    #[async_trait::async_trait]
    impl ResultPublisher for CountingPublisher {
        fn name(&self) -> &str {
            "counting"
        }

        async fn publish(&self, family: AddressFamily, results: &[RankedResult]) -> Result<()> {
            self.calls.lock().push((family, results.len()));
            Ok(())
        }
    }

    fn result(addr: &str) -> RankedResult {
        RankedResult::new(ProbeResult::from_trials(
            addr.parse().unwrap(),
            4,
            4,
            Duration::from_millis(200),
            None,
        ))
    }

    #[tokio::test]
    async fn test_failing_store_does_not_block_others() {
        let broken = RecordingStore::new("broken", true);
        let healthy = RecordingStore::new("healthy", false);
        let stores: Vec<Arc<dyn RecordStore>> = vec![broken.clone(), healthy.clone()];
        let publisher = Publisher::new(stores, Vec::new(), 2);

        let results = vec![result("1.1.1.1"), result("2606:4700::1"), result("1.0.0.1")];
        let report = publisher.publish(&results).await;

        assert_eq!(
            report.published,
            vec![
                "1.1.1.1".parse::<IpAddr>().unwrap(),
                "2606:4700::1".parse::<IpAddr>().unwrap()
            ]
        );
        assert_eq!(report.failures().count(), 2);
        assert!(report
            .failures()
            .all(|f| matches!(&f.result, Err(e) if e.is_store_rejection())));
        assert!(!report.all_succeeded());
        assert_eq!(
            *healthy.created.lock(),
            vec![
                (RecordType::A, "1.1.1.1".to_string()),
                (RecordType::AAAA, "2606:4700::1".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_family_without_results_is_untouched() {
        let store: Arc<dyn RecordStore> = RecordingStore::new("only", false);
        let publisher = Publisher::new(vec![store], Vec::new(), 10);

        let report = publisher.publish(&[result("1.1.1.1"), result("1.0.0.1")]).await;

        assert!(report.all_succeeded());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].target, "A");
    }

    #[tokio::test]
    async fn test_result_publishers_get_full_family_lists() {
        let counting = Arc::new(CountingPublisher {
            calls: Mutex::new(Vec::new()),
        });
        let sinks: Vec<Arc<dyn ResultPublisher>> = vec![counting.clone()];
        let publisher = Publisher::new(Vec::new(), sinks, 1);

        let results = vec![result("1.1.1.1"), result("1.0.0.1"), result("2606:4700::1")];
        publisher.publish(&results).await;

        assert_eq!(
            *counting.calls.lock(),
            vec![(AddressFamily::V4, 2), (AddressFamily::V6, 1)]
        );
    }

    #[tokio::test]
    async fn test_nothing_to_publish() {
        let store: Arc<dyn RecordStore> = RecordingStore::new("only", false);
        let publisher = Publisher::new(vec![store], Vec::new(), 10);
        let report = publisher.publish(&[]).await;
        assert!(report.published.is_empty());
        assert!(report.outcomes.is_empty());
    }
}
