//! Alibaba Cloud DNS adapter (RPC API, HMAC-SHA1 signature v1.0)

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tracing::debug;

use super::{api_client, RecordStore, RecordType, RemoteRecord};
use crate::config::AliDnsConfig;
use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

const ALIDNS_API: &str = "https://alidns.aliyuncs.com/";
const API_VERSION: &str = "2015-01-09";
const STORE_NAME: &str = "alidns";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeResponse {
    domain_records: DomainRecords,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DomainRecords {
    #[serde(default)]
    record: Vec<AliRecord>,
}

#[derive(Debug, Deserialize)]
struct AliRecord {
    #[serde(rename = "RecordId")]
    record_id: String,
    #[serde(rename = "RR")]
    rr: String,
    #[serde(rename = "Type")]
    record_type: String,
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "TTL", default)]
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "RecordId")]
    record_id: String,
}

pub struct AliDnsStore {
    config: AliDnsConfig,
}

impl AliDnsStore {
    pub fn new(config: AliDnsConfig) -> Self {
        Self { config }
    }

    /// Host record; the apex is `@`
    fn rr(&self) -> &str {
        let sub = self.config.subdomain.trim();
        if sub.is_empty() {
            "@"
        } else {
            sub
        }
    }

    /// Add common parameters and the signature to `params`
    fn signed_query(&self, mut params: BTreeMap<String, String>) -> Result<String> {
        let common = [
            ("Format", "JSON".to_string()),
            ("Version", API_VERSION.to_string()),
            ("AccessKeyId", self.config.accesskey_id.clone()),
            ("SignatureMethod", "HMAC-SHA1".to_string()),
            ("SignatureVersion", "1.0".to_string()),
            ("SignatureNonce", uuid::Uuid::new_v4().to_string()),
            (
                "Timestamp",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
        ];
        for (k, v) in common {
            params.insert(k.to_string(), v);
        }

        let signature = sign(&params, &self.config.accesskey_secret)?;
        params.insert("Signature".to_string(), signature);
        Ok(canonical_query(&params))
    }

    async fn call<T>(&self, params: BTreeMap<String, String>) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let action = params.get("Action").cloned().unwrap_or_default();
        let url = format!("{}?{}", ALIDNS_API, self.signed_query(params)?);
        let resp = api_client()?.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!("alidns {} response ({}): {}", action, status, body);

        if let Ok(ErrorBody {
            code: Some(code),
            message,
        }) = serde_json::from_str::<ErrorBody>(&body)
        {
            return Err(Error::store(
                STORE_NAME,
                format!("{}: {}", code, message.unwrap_or_default()),
            ));
        }
        if !status.is_success() {
            return Err(Error::store(STORE_NAME, format!("HTTP {}", status)));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// RFC 3986 encoding: only unreserved characters pass through
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn sign(params: &BTreeMap<String, String>, secret: &str) -> Result<String> {
    let string_to_sign = format!("GET&%2F&{}", percent_encode(&canonical_query(params)));
    let mut mac = HmacSha1::new_from_slice(format!("{}&", secret).as_bytes())
        .map_err(|e| Error::config(format!("alidns: invalid signing key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[async_trait::async_trait]
impl RecordStore for AliDnsStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    fn ttl(&self) -> u32 {
        self.config.ttl
    }

    fn validate(&self) -> Result<()> {
        if self.config.accesskey_id.is_empty()
            || self.config.accesskey_secret.is_empty()
            || self.config.domain.is_empty()
        {
            return Err(Error::config(
                "alidns: accesskey_id, accesskey_secret and domain are required",
            ));
        }
        Ok(())
    }

    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>> {
        let resp: DescribeResponse = self
            .call(params(&[
                ("Action", "DescribeDomainRecords"),
                ("DomainName", self.config.domain.as_str()),
                ("RRKeyWord", self.rr()),
                ("Type", record_type.as_str()),
                ("PageSize", "500"),
            ]))
            .await?;

        Ok(resp
            .domain_records
            .record
            .into_iter()
            .filter(|r| r.rr == self.rr() && r.record_type == record_type.as_str())
            .map(|r| RemoteRecord {
                id: r.record_id,
                record_type,
                value: r.value,
                ttl: r.ttl,
            })
            .collect())
    }

    async fn create(&self, record_type: RecordType, value: &str, ttl: u32) -> Result<RemoteRecord> {
        let ttl_str = ttl.to_string();
        let resp: AddResponse = self
            .call(params(&[
                ("Action", "AddDomainRecord"),
                ("DomainName", self.config.domain.as_str()),
                ("RR", self.rr()),
                ("Type", record_type.as_str()),
                ("Value", value),
                ("TTL", ttl_str.as_str()),
            ]))
            .await?;
        Ok(RemoteRecord {
            id: resp.record_id,
            record_type,
            value: value.to_string(),
            ttl,
        })
    }

    async fn update(&self, record_type: RecordType, id: &str, value: &str, ttl: u32) -> Result<()> {
        let ttl_str = ttl.to_string();
        self.call::<serde_json::Value>(params(&[
            ("Action", "UpdateDomainRecord"),
            ("RecordId", id),
            ("RR", self.rr()),
            ("Type", record_type.as_str()),
            ("Value", value),
            ("TTL", ttl_str.as_str()),
        ]))
        .await?;
        Ok(())
    }

    async fn delete(&self, _record_type: RecordType, id: &str) -> Result<()> {
        self.call::<serde_json::Value>(params(&[
            ("Action", "DeleteDomainRecord"),
            ("RecordId", id),
        ]))
        .await?;
        Ok(())
    }
}
