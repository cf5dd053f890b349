//! HTTP remote store backend (feature `upload-http`).
//!
//! Speaks a small resumable-upload protocol against an object storage
//! gateway:
//!
//! - `GET    {base}/segments/{device}/{seq}/offset`   -> `{"offset": n}`
//! - `PUT    {base}/segments/{device}/{seq}/chunk?offset=n` (raw bytes)
//!                                                    -> `{"offset": n}`
//! - `POST   {base}/segments/{device}/{seq}/finalize` (checksum + length)
//! - `PUT    {base}/segments/{device}/{seq}/metadata` (metadata JSON)
//!
//! 5xx, 408, 429 and transport errors are transient; other statuses are
//! permanent.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::{RemoteStore, UploadError};
use crate::SegmentId;

#[derive(Clone, Debug)]
pub struct HttpRemoteStoreConfig {
    /// Base URL of the storage gateway, e.g. "https://storage.example/v1".
    pub base_url: String,
    /// Bearer token, if the gateway requires one.
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HttpRemoteStoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpRemoteStore {
    base: Url,
    auth_token: Option<String>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct OffsetResponse {
    offset: u64,
}

impl HttpRemoteStore {
    pub fn new(config: HttpRemoteStoreConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| anyhow::anyhow!("invalid upload base_url: {}", e))?;
        let agent = ureq::AgentBuilder::new()
            .timeout(config.request_timeout)
            .build();
        Ok(Self {
            base,
            auth_token: config.auth_token,
            agent,
        })
    }

    fn segment_url(&self, id: &SegmentId, leaf: &str) -> Result<Url, UploadError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| UploadError::Permanent("base_url cannot be a base".into()))?
            .push("segments")
            .push(&id.device_id)
            .push(&format!("{:020}", id.seq))
            .push(leaf);
        Ok(url)
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let mut req = self.agent.request_url(method, url);
        if let Some(token) = &self.auth_token {
            req = req.set("Authorization", &format!("Bearer {}", token));
        }
        req
    }

    fn parse_offset(response: ureq::Response) -> Result<u64, UploadError> {
        let body = response
            .into_string()
            .map_err(|e| UploadError::Transient(format!("response read failed: {}", e)))?;
        let parsed: OffsetResponse = serde_json::from_str(&body)
            .map_err(|e| UploadError::Permanent(format!("malformed offset response: {}", e)))?;
        Ok(parsed.offset)
    }
}

fn classify(err: ureq::Error) -> UploadError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let msg = format!("HTTP {}: {}", code, body.chars().take(200).collect::<String>());
            if code >= 500 || code == 408 || code == 429 {
                UploadError::Transient(msg)
            } else {
                UploadError::Permanent(msg)
            }
        }
        other => UploadError::Transient(other.to_string()),
    }
}

impl RemoteStore for HttpRemoteStore {
    fn name(&self) -> &'static str {
        "http"
    }

    fn committed_offset(&mut self, id: &SegmentId) -> Result<u64, UploadError> {
        let url = self.segment_url(id, "offset")?;
        let response = self.request("GET", &url).call().map_err(classify)?;
        Self::parse_offset(response)
    }

    fn put_chunk(
        &mut self,
        id: &SegmentId,
        offset: u64,
        chunk: &[u8],
    ) -> Result<u64, UploadError> {
        let mut url = self.segment_url(id, "chunk")?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string());
        let response = self
            .request("PUT", &url)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(chunk)
            .map_err(classify)?;
        Self::parse_offset(response)
    }

    fn finalize(
        &mut self,
        id: &SegmentId,
        checksum: [u8; 32],
        total_len: u64,
    ) -> Result<(), UploadError> {
        let url = self.segment_url(id, "finalize")?;
        let body = serde_json::json!({
            "checksum": hex::encode(checksum),
            "len": total_len,
        });
        self.request("POST", &url)
            .set("Content-Type", "application/json")
            .send_string(&body.to_string())
            .map_err(classify)?;
        Ok(())
    }

    fn put_metadata(&mut self, id: &SegmentId, meta_json: &str) -> Result<(), UploadError> {
        let url = self.segment_url(id, "metadata")?;
        self.request("PUT", &url)
            .set("Content-Type", "application/json")
            .send_string(meta_json)
            .map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_segment_urls() {
        let store = HttpRemoteStore::new(HttpRemoteStoreConfig {
            base_url: "https://storage.example/v1".into(),
            ..HttpRemoteStoreConfig::default()
        })
        .unwrap();
        let id = SegmentId::new("device:rear_cam", 7).unwrap();
        let url = store.segment_url(&id, "offset").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.example/v1/segments/device:rear_cam/00000000000000000007/offset"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let result = HttpRemoteStore::new(HttpRemoteStoreConfig {
            base_url: "not a url".into(),
            ..HttpRemoteStoreConfig::default()
        });
        assert!(result.is_err());
    }
}
