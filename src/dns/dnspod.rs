//! DNSPod adapter (Tencent Cloud API 3.0, TC3-HMAC-SHA256)

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{api_client, RecordStore, RecordType, RemoteRecord};
use crate::config::DnsPodConfig;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const HOST: &str = "dnspod.tencentcloudapi.com";
const SERVICE: &str = "dnspod";
const API_VERSION: &str = "2021-03-23";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const RECORD_LINE: &str = "默认";
const NO_RECORDS: &str = "ResourceNotFound.NoDataOfRecord";
const STORE_NAME: &str = "dnspod";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Response")]
    response: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct RecordList {
    #[serde(rename = "RecordList", default)]
    records: Vec<PodRecord>,
}

#[derive(Debug, Deserialize)]
struct PodRecord {
    #[serde(rename = "RecordId")]
    record_id: u64,
    #[serde(rename = "Type")]
    record_type: String,
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "TTL", default)]
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct Created {
    #[serde(rename = "RecordId")]
    record_id: u64,
}

/// Failure returned inside a 200 response
#[derive(Debug)]
enum CallError {
    Api(ApiError),
    Other(Error),
}

impl From<Error> for CallError {
    fn from(err: Error) -> Self {
        CallError::Other(err)
    }
}

impl From<CallError> for Error {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Api(e) => Error::store(STORE_NAME, format!("{}: {}", e.code, e.message)),
            CallError::Other(e) => e,
        }
    }
}

pub struct DnsPodStore {
    config: DnsPodConfig,
}

impl DnsPodStore {
    pub fn new(config: DnsPodConfig) -> Self {
        Self { config }
    }

    fn subdomain(&self) -> &str {
        let sub = self.config.subdomain.trim();
        if sub.is_empty() {
            "@"
        } else {
            sub
        }
    }

    /// `Authorization` header for `payload` sent at `timestamp`
    fn authorization(&self, payload: &str, timestamp: i64) -> Result<String> {
        let date = chrono::DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::config(format!("dnspod: bad timestamp {}", timestamp)))?
            .format("%Y-%m-%d")
            .to_string();

        let canonical_request = format!(
            "POST\n/\n\ncontent-type:{}\nhost:{}\n\ncontent-type;host\n{}",
            CONTENT_TYPE,
            HOST,
            hex::encode(Sha256::digest(payload.as_bytes()))
        );
        let scope = format!("{}/{}/tc3_request", date, SERVICE);
        let string_to_sign = format!(
            "TC3-HMAC-SHA256\n{}\n{}\n{}",
            timestamp,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let secret_date = hmac_sha256(format!("TC3{}", self.config.secret_key).as_bytes(), &date)?;
        let secret_service = hmac_sha256(&secret_date, SERVICE)?;
        let secret_signing = hmac_sha256(&secret_service, "tc3_request")?;
        let signature = hex::encode(hmac_sha256(&secret_signing, &string_to_sign)?);

        Ok(format!(
            "TC3-HMAC-SHA256 Credential={}/{}, SignedHeaders=content-type;host, Signature={}",
            self.config.secret_id, scope, signature
        ))
    }

    async fn call<T>(&self, action: &str, body: serde_json::Value) -> std::result::Result<T, CallError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let payload = body.to_string();
        let timestamp = chrono::Utc::now().timestamp();
        let authorization = self.authorization(&payload, timestamp)?;

        let resp = api_client()?
            .post(format!("https://{}/", HOST))
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", API_VERSION)
            .body(payload)
            .send()
            .await
            .map_err(Error::from)?;
        let text = resp.text().await.map_err(Error::from)?;
        debug!("dnspod {} response: {}", action, text);

        let envelope: Envelope = serde_json::from_str(&text).map_err(Error::from)?;
        if let Some(err) = envelope.response.get("Error") {
            let api: ApiError = serde_json::from_value(err.clone()).map_err(Error::from)?;
            return Err(CallError::Api(api));
        }
        Ok(serde_json::from_value(envelope.response).map_err(Error::from)?)
    }
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::config(format!("dnspod: invalid signing key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn parse_id(id: &str) -> Result<u64> {
    id.parse()
        .map_err(|_| Error::Decode(format!("dnspod record id {:?} is not numeric", id)))
}

#[async_trait::async_trait]
impl RecordStore for DnsPodStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    fn ttl(&self) -> u32 {
        self.config.ttl
    }

    fn validate(&self) -> Result<()> {
        if self.config.secret_id.is_empty()
            || self.config.secret_key.is_empty()
            || self.config.domain.is_empty()
        {
            return Err(Error::config("dnspod: secret_id, secret_key and domain are required"));
        }
        Ok(())
    }

    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>> {
        let body = json!({
            "Domain": self.config.domain,
            "Subdomain": self.subdomain(),
            "RecordType": record_type.as_str(),
        });
        let list: RecordList = match self.call("DescribeRecordList", body).await {
            Ok(list) => list,
            Err(CallError::Api(e)) if e.code == NO_RECORDS => RecordList::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(list
            .records
            .into_iter()
            .filter(|r| r.record_type == record_type.as_str())
            .map(|r| RemoteRecord {
                id: r.record_id.to_string(),
                record_type,
                value: r.value,
                ttl: r.ttl,
            })
            .collect())
    }

    async fn create(&self, record_type: RecordType, value: &str, ttl: u32) -> Result<RemoteRecord> {
        let body = json!({
            "Domain": self.config.domain,
            "SubDomain": self.subdomain(),
            "RecordType": record_type.as_str(),
            "RecordLine": RECORD_LINE,
            "Value": value,
            "TTL": ttl,
        });
        let created: Created = self.call("CreateRecord", body).await?;
        Ok(RemoteRecord {
            id: created.record_id.to_string(),
            record_type,
            value: value.to_string(),
            ttl,
        })
    }

    async fn update(&self, record_type: RecordType, id: &str, value: &str, ttl: u32) -> Result<()> {
        let body = json!({
            "Domain": self.config.domain,
            "RecordId": parse_id(id)?,
            "SubDomain": self.subdomain(),
            "RecordType": record_type.as_str(),
            "RecordLine": RECORD_LINE,
            "Value": value,
            "TTL": ttl,
        });
        self.call::<serde_json::Value>("ModifyRecord", body).await?;
        Ok(())
    }

    async fn delete(&self, _record_type: RecordType, id: &str) -> Result<()> {
        let body = json!({
            "Domain": self.config.domain,
            "RecordId": parse_id(id)?,
        });
        self.call::<serde_json::Value>("DeleteRecord", body).await?;
        Ok(())
    }
}
