//! Signed JSON delivery to an HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, warn};

use datagen_core::types::Row;

use super::{Batch, DeliveryOutcome, OutputSink};
use crate::types::WebhookSpec;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Methods a webhook sink may be configured with. GET carries the envelope
/// as query parameters, with `data` as a JSON string.
pub const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH"];

/// Body posted to the endpoint.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub task_id: &'a str,
    pub task_name: &'a str,
    pub data: &'a [Row],
    pub count: usize,
    pub timestamp: String,
}

/// Hex HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature produced by [`sign`].
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub struct WebhookSink {
    client: reqwest::Client,
    spec: WebhookSpec,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, spec: WebhookSpec, timeout: Duration) -> Self {
        Self {
            client,
            spec,
            timeout,
        }
    }

    /// Build the request for `envelope`. The signature covers the JSON body,
    /// or the encoded query string for GET.
    fn build(&self, method: Method, envelope: &Envelope<'_>) -> Result<reqwest::Request, String> {
        let mut request = self
            .client
            .request(method.clone(), &self.spec.url)
            .timeout(self.timeout);
        for (name, value) in &self.spec.headers {
            if name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        request = request.header(TIMESTAMP_HEADER, envelope.timestamp.as_str());

        let body = if method == Method::GET {
            let data = serde_json::to_string(envelope.data)
                .map_err(|e| format!("serialize envelope: {e}"))?;
            let count = envelope.count.to_string();
            request = request.query(&[
                ("task_id", envelope.task_id),
                ("task_name", envelope.task_name),
                ("count", count.as_str()),
                ("timestamp", envelope.timestamp.as_str()),
                ("data", data.as_str()),
            ]);
            None
        } else {
            // Serialize once: the signature covers exactly these bytes.
            let body = serde_json::to_vec(envelope).map_err(|e| format!("serialize envelope: {e}"))?;
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
            Some(body)
        };

        let mut request = request.build().map_err(|e| e.to_string())?;
        if let Some(secret) = self.spec.secret.as_deref() {
            let signed = match &body {
                Some(bytes) => sign(secret, bytes),
                None => sign(secret, request.url().query().unwrap_or_default().as_bytes()),
            };
            let value = HeaderValue::from_str(&signed).map_err(|e| e.to_string())?;
            request.headers_mut().insert(SIGNATURE_HEADER, value);
        }
        Ok(request)
    }

    async fn send(&self, envelope: &Envelope<'_>) -> DeliveryOutcome {
        let method = match Method::from_bytes(self.spec.method.to_ascii_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => return DeliveryOutcome::failed(format!("invalid method {}", self.spec.method)),
        };
        let request = match self.build(method, envelope) {
            Ok(r) => r,
            Err(e) => return DeliveryOutcome::failed(e),
        };

        match self.client.execute(request).await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %self.spec.url, status = resp.status().as_u16(), "webhook delivered");
                DeliveryOutcome::success(format!("HTTP {}", resp.status().as_u16()))
            }
            Ok(resp) => {
                warn!(url = %self.spec.url, status = resp.status().as_u16(), "webhook rejected");
                DeliveryOutcome::failed(format!("HTTP {}", resp.status().as_u16()))
            }
            Err(e) if e.is_timeout() => {
                warn!(url = %self.spec.url, "webhook timed out");
                DeliveryOutcome::failed(format!("timed out after {}s", self.timeout.as_secs()))
            }
            Err(e) => {
                warn!(url = %self.spec.url, "webhook failed: {e}");
                DeliveryOutcome::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl OutputSink for WebhookSink {
    async fn deliver(&self, batch: &Batch<'_>) -> DeliveryOutcome {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let envelope = Envelope {
            task_id: batch.task_id,
            task_name: batch.task_name,
            data: batch.rows,
            count: batch.rows.len(),
            timestamp,
        };
        self.send(&envelope).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn signature_matches_reference_hmac() {
        // RFC 4231 test case 2
        assert_eq!(
            sign("Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn any_changed_byte_breaks_the_signature() {
        let body = br#"{"task_id":"t","count":1}"#.to_vec();
        let sig = sign("s3cret", &body);
        assert!(verify("s3cret", &body, &sig));

        for i in 0..body.len() {
            let mut tampered = body.clone();
            tampered[i] ^= 0x01;
            assert!(!verify("s3cret", &tampered, &sig), "byte {i}");
        }
        assert!(!verify("other", &body, &sig));
        assert!(!verify("s3cret", &body, "not-hex"));
    }

    #[test]
    fn get_request_carries_envelope_in_query() {
        let mut spec = WebhookSpec::new("http://127.0.0.1:9/hook");
        spec.method = "get".into();
        spec.secret = Some("k".into());
        let sink = WebhookSink::new(reqwest::Client::new(), spec, Duration::from_secs(1));

        let mut row = Row::new();
        row.insert("name".into(), serde_json::json!("Ada"));
        let rows = vec![row];
        let envelope = Envelope {
            task_id: "t1",
            task_name: "daily",
            data: &rows,
            count: 1,
            timestamp: "2026-01-01T00:00:00.000Z".into(),
        };

        let request = sink.build(Method::GET, &envelope).unwrap();
        assert!(request.body().is_none());
        assert!(request.headers().get(CONTENT_TYPE).is_none());

        let query = request.url().query().unwrap().to_string();
        let signature = request.headers()[SIGNATURE_HEADER].to_str().unwrap();
        assert!(verify("k", query.as_bytes(), signature));

        let pairs: BTreeMap<String, String> = request.url().query_pairs().into_owned().collect();
        assert_eq!(pairs["task_id"], "t1");
        assert_eq!(pairs["count"], "1");
        let data: Vec<Row> = serde_json::from_str(&pairs["data"]).unwrap();
        assert_eq!(data[0]["name"], "Ada");
    }
}
