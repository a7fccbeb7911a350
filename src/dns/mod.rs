//! Record stores
//!
//! Every provider is a thin `RecordStore` adapter; the matching logic lives
//! once in `reconcile`. `publisher` decides what each store should hold.

pub mod alidns;
pub mod cfkv;
pub mod cloudflare;
pub mod dnspod;
pub mod publisher;
pub mod reconcile;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::Result;
use crate::probe::AddressFamily;

pub use alidns::AliDnsStore;
pub use cfkv::CloudflareKvPublisher;
pub use cloudflare::CloudflareStore;
pub use dnspod::DnsPodStore;
pub use publisher::{Publisher, PublishReport, ResultPublisher, StoreOutcome};
pub use reconcile::{plan, reconcile, ReconcilePlan, ReconcileSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    AAAA,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
        }
    }

    pub fn for_family(family: AddressFamily) -> Self {
        match family {
            AddressFamily::V4 => RecordType::A,
            AddressFamily::V6 => RecordType::AAAA,
        }
    }

    pub fn for_addr(addr: &IpAddr) -> Self {
        Self::for_family(AddressFamily::of(addr))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record as currently held by a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    /// Store-assigned, opaque
    pub id: String,
    pub record_type: RecordType,
    pub value: String,
    pub ttl: u32,
}

/// Minimal capability a provider exposes to the reconciler.
///
/// Each instance is bound to one (domain, subdomain).
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    fn name(&self) -> &str;

    /// TTL used for created and updated records
    fn ttl(&self) -> u32;

    /// Credential and identifier completeness, checked before any request
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>>;

    async fn create(&self, record_type: RecordType, value: &str, ttl: u32) -> Result<RemoteRecord>;

    async fn update(&self, record_type: RecordType, id: &str, value: &str, ttl: u32) -> Result<()>;

    async fn delete(&self, record_type: RecordType, id: &str) -> Result<()>;
}

/// `sub.domain`, or the bare domain for an empty or `@` subdomain
pub fn full_name(subdomain: &str, domain: &str) -> String {
    let sub = subdomain.trim();
    if sub.is_empty() || sub == "@" {
        domain.to_string()
    } else {
        format!("{}.{}", sub, domain)
    }
}

/// Stores enabled in the configuration, in a fixed order
pub fn enabled_stores(config: &AppConfig) -> Vec<Arc<dyn RecordStore>> {
    let mut stores: Vec<Arc<dyn RecordStore>> = Vec::new();
    if config.alidns.enable {
        stores.push(Arc::new(AliDnsStore::new(config.alidns.clone())));
    }
    if config.dnspod.enable {
        stores.push(Arc::new(DnsPodStore::new(config.dnspod.clone())));
    }
    if config.cloudflare.enable {
        stores.push(Arc::new(CloudflareStore::new(config.cloudflare.clone())));
    }
    stores
}

/// Result publishers enabled in the configuration
pub fn enabled_result_publishers(config: &AppConfig) -> Vec<Arc<dyn ResultPublisher>> {
    let mut publishers: Vec<Arc<dyn ResultPublisher>> = Vec::new();
    if config.cfkv.enable {
        publishers.push(Arc::new(CloudflareKvPublisher::new(config.cfkv.clone())));
    }
    publishers
}

/// Shared client for store APIs
pub(crate) fn api_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name() {
        assert_eq!(full_name("cdn", "example.com"), "cdn.example.com");
        assert_eq!(full_name("@", "example.com"), "example.com");
        assert_eq!(full_name("", "example.com"), "example.com");
    }

    #[test]
    fn test_record_type_for_addr() {
        assert_eq!(RecordType::for_addr(&"1.1.1.1".parse().unwrap()), RecordType::A);
        assert_eq!(RecordType::for_addr(&"2606:4700::1".parse().unwrap()), RecordType::AAAA);
        assert_eq!(RecordType::AAAA.to_string(), "AAAA");
    }

    #[test]
    fn test_enabled_stores_follow_flags() {
        let mut config = AppConfig::default();
        assert!(enabled_stores(&config).is_empty());
        assert!(enabled_result_publishers(&config).is_empty());

        config.cloudflare.enable = true;
        config.alidns.enable = true;
        config.cfkv.enable = true;
        let names: Vec<String> = enabled_stores(&config)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["alidns", "cloudflare"]);
        assert_eq!(enabled_result_publishers(&config).len(), 1);
    }
}
