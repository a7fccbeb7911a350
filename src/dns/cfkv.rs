//! Cloudflare KV result publisher
//!
//! Writes the whole result list of a family under `ipv4` / `ipv6`, and the
//! update time under `ipv4time` / `ipv6time`.

use super::cloudflare::{read_envelope, CLOUDFLARE_API};
use super::{api_client, ResultPublisher};
use crate::config::CloudflareKvConfig;
use crate::error::{Error, Result};
use crate::probe::{AddressFamily, RankedResult};

const STORE_NAME: &str = "cfkv";

pub struct CloudflareKvPublisher {
    config: CloudflareKvConfig,
}

impl CloudflareKvPublisher {
    pub fn new(config: CloudflareKvConfig) -> Self {
        Self { config }
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let url = format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values/{}",
            CLOUDFLARE_API, self.config.account_id, self.config.namespace_id, key
        );
        let resp = api_client()?
            .put(url)
            .bearer_auth(&self.config.api_token)
            .header("Content-Type", "text/plain")
            .body(value)
            .send()
            .await?;
        read_envelope::<serde_json::Value>(STORE_NAME, resp).await?;
        Ok(())
    }
}

/// `ip,sent,received,loss%,delay_ms,MB/s` entries joined by `&`
pub fn encode_results(results: &[RankedResult]) -> String {
    results
        .iter()
        .map(|r| {
            format!(
                "{},{},{},{:.2},{},{:.2}",
                r.addr(),
                r.probe.sent,
                r.probe.received,
                r.loss_rate() * 100.0,
                r.probe.delay.map(|d| d.as_millis()).unwrap_or(0),
                r.throughput_mb()
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait::async_trait]
impl ResultPublisher for CloudflareKvPublisher {
    fn name(&self) -> &str {
        STORE_NAME
    }

    fn validate(&self) -> Result<()> {
        if self.config.api_token.is_empty()
            || self.config.account_id.is_empty()
            || self.config.namespace_id.is_empty()
        {
            return Err(Error::config(
                "cfkv: api_token, account_id and namespace_id are required",
            ));
        }
        Ok(())
    }

    async fn publish(&self, family: AddressFamily, results: &[RankedResult]) -> Result<()> {
        let key = family.label();
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.put(key, encode_results(results)).await?;
        self.put(&format!("{}time", key), now).await?;
        Ok(())
    }
}
