//! Cloudflare DNS adapter (API v4, bearer token)

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{api_client, full_name, RecordStore, RecordType, RemoteRecord};
use crate::config::CloudflareConfig;
use crate::error::{Error, Result};

pub(crate) const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

/// Response envelope shared by every Cloudflare API
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    pub result: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiMessage {
    pub code: i64,
    pub message: String,
}

impl<T> Envelope<T> {
    /// Turn an unsuccessful envelope into a store error
    pub fn into_result(self, store: &str) -> Result<Option<T>> {
        if self.success {
            return Ok(self.result);
        }
        Err(match self.errors.first() {
            Some(e) => Error::store(store, format!("{} (code: {})", e.message, e.code)),
            None => Error::store(store, "request failed"),
        })
    }
}

/// Parse a Cloudflare response body, whatever the HTTP status
pub(crate) async fn read_envelope<T>(store: &str, resp: reqwest::Response) -> Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let status = resp.status();
    let body = resp.text().await?;
    debug!("{} response ({}): {}", store, status, body);
    let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
        Error::store(store, format!("unexpected response ({}): {}", status, e))
    })?;
    envelope.into_result(store)
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
    #[serde(default)]
    ttl: u32,
}

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
}

pub struct CloudflareStore {
    config: CloudflareConfig,
    name: String,
}

impl CloudflareStore {
    pub fn new(config: CloudflareConfig) -> Self {
        let name = full_name(&config.subdomain, &config.domain);
        Self { config, name }
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", CLOUDFLARE_API, self.config.zone_id)
    }

    fn body<'a>(&'a self, record_type: RecordType, value: &'a str, ttl: u32) -> RecordBody<'a> {
        RecordBody {
            record_type: record_type.as_str(),
            name: &self.name,
            content: value,
            ttl,
            proxied: self.config.proxied,
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for CloudflareStore {
    fn name(&self) -> &str {
        "cloudflare"
    }

    fn ttl(&self) -> u32 {
        self.config.ttl
    }

    fn validate(&self) -> Result<()> {
        if self.config.api_token.is_empty()
            || self.config.zone_id.is_empty()
            || self.config.domain.is_empty()
        {
            return Err(Error::config("cloudflare: api_token, zone_id and domain are required"));
        }
        Ok(())
    }

    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>> {
        let resp = api_client()?
            .get(self.records_url())
            .bearer_auth(&self.config.api_token)
            .query(&[("type", record_type.as_str()), ("name", self.name.as_str())])
            .send()
            .await?;
        let records: Vec<DnsRecord> = read_envelope(self.name(), resp).await?.unwrap_or_default();

        Ok(records
            .into_iter()
            .filter(|r| r.record_type == record_type.as_str())
            .map(|r| RemoteRecord {
                id: r.id,
                record_type,
                value: r.content,
                ttl: r.ttl,
            })
            .collect())
    }

    async fn create(&self, record_type: RecordType, value: &str, ttl: u32) -> Result<RemoteRecord> {
        let resp = api_client()?
            .post(self.records_url())
            .bearer_auth(&self.config.api_token)
            .json(&self.body(record_type, value, ttl))
            .send()
            .await?;
        let created: Option<DnsRecord> = read_envelope(self.name(), resp).await?;

        Ok(RemoteRecord {
            id: created.map(|r| r.id).unwrap_or_default(),
            record_type,
            value: value.to_string(),
            ttl,
        })
    }

    async fn update(&self, record_type: RecordType, id: &str, value: &str, ttl: u32) -> Result<()> {
        let resp = api_client()?
            .put(format!("{}/{}", self.records_url(), id))
            .bearer_auth(&self.config.api_token)
            .json(&self.body(record_type, value, ttl))
            .send()
            .await?;
        read_envelope::<serde_json::Value>(self.name(), resp).await?;
        Ok(())
    }

    async fn delete(&self, _record_type: RecordType, id: &str) -> Result<()> {
        let resp = api_client()?
            .delete(format!("{}/{}", self.records_url(), id))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        read_envelope::<serde_json::Value>(self.name(), resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CloudflareConfig {
        CloudflareConfig {
            enable: true,
            api_token: "token".into(),
            zone_id: "zone".into(),
            domain: "example.com".into(),
            subdomain: "cdn".into(),
            ..CloudflareConfig::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(CloudflareStore::new(config()).validate().is_ok());

        let mut missing = config();
        missing.zone_id.clear();
        let err = CloudflareStore::new(missing).validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_record_body() {
        let store = CloudflareStore::new(config());
        let body = serde_json::to_value(store.body(RecordType::AAAA, "2606:4700::1", 1)).unwrap();
        assert_eq!(body["type"], "AAAA");
        assert_eq!(body["name"], "cdn.example.com");
        assert_eq!(body["proxied"], false);
        assert_eq!(body["ttl"], 1);
    }

    #[test]
    fn test_envelope_errors() {
        let ok: Envelope<Vec<serde_json::Value>> =
            serde_json::from_str(r#"{"success":true,"errors":[],"result":[]}"#).unwrap();
        assert_eq!(ok.into_result("cloudflare").unwrap(), Some(Vec::new()));

        let rejected: Envelope<serde_json::Value> = serde_json::from_str(
            r#"{"success":false,"errors":[{"code":10000,"message":"Authentication error"}]}"#,
        )
        .unwrap();
        let err = rejected.into_result("cloudflare").unwrap_err();
        assert_eq!(
            err.to_string(),
            "cloudflare API error: Authentication error (code: 10000)"
        );
    }
}
