use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{NetError, NetResult};
use crate::transport::{Method, Response};

/// Outbound batch body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnvelope {
    pub batch_id: String,
    pub requests: Vec<BatchRequestItem>,
}

/// One logical request inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequestItem {
    pub id: String,
    pub url: String,
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Batch response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponseEnvelope {
    pub batch_id: String,
    #[serde(default)]
    pub responses: Vec<BatchResponseItem>,
}

/// Result of one logical request inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponseItem {
    pub request_id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResponseItem {
    pub fn ok(request_id: impl Into<String>, status: u16, data: Value) -> Self {
        Self { request_id: request_id.into(), status, data: Some(data), error: None }
    }

    pub fn failed(request_id: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), status, data: None, error: Some(error.into()) }
    }

    /// An `error` field or a status of 400 and above rejects the request
    pub fn into_result(self) -> NetResult<Response> {
        if let Some(message) = self.error {
            return Err(NetError::RequestRejected {
                request_id: self.request_id,
                status: self.status,
                message,
            });
        }
        if self.status >= 400 {
            let message = match &self.data {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => format!("status {}", self.status),
            };
            return Err(NetError::RequestRejected {
                request_id: self.request_id,
                status: self.status,
                message,
            });
        }
        Ok(Response {
            status: self.status,
            headers: BTreeMap::new(),
            data: self.data.unwrap_or(Value::Null),
        })
    }
}

/// Identity of a coalescable read: method, url and headers (names folded to
/// lowercase)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CoalesceKey {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
}

impl CoalesceKey {
    pub(crate) fn new(method: Method, url: &str, headers: &BTreeMap<String, String>) -> Self {
        let mut headers: Vec<(String, String)> =
            headers.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.clone())).collect();
        headers.sort();
        Self { method, url: url.to_string(), headers }
    }
}

pub(crate) type Completion = oneshot::Sender<NetResult<Response>>;

/// A logical request waiting in (or travelling with) a batch
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub(crate) id: String,
    pub(crate) url: String,
    pub(crate) method: Method,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) body: Option<Value>,
    pub(crate) priority: usize,
    pub(crate) enqueued_at: Instant,
    pub(crate) retry_count: u32,
    pub(crate) coalesce_key: Option<CoalesceKey>,
    /// Callers awaiting this request, in arrival order
    pub(crate) waiters: Vec<Completion>,
}

impl QueuedRequest {
    pub(crate) fn to_wire(&self) -> BatchRequestItem {
        BatchRequestItem {
            id: self.id.clone(),
            url: self.url.clone(),
            method: self.method,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// Deliver `result` to every waiter
    pub(crate) fn complete(self, result: NetResult<Response>) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Validates the wire shape of an outbound batch.
    ///
    /// Assertions:
    /// - Keys are camelCase and a missing body is omitted.
    #[test]
    fn test_envelope_wire_shape() {
        let envelope = BatchEnvelope {
            batch_id: "b-1".to_string(),
            requests: vec![BatchRequestItem {
                id: "r-1".to_string(),
                url: "https://api.example.com/items".to_string(),
                method: Method::Get,
                headers: BTreeMap::new(),
                body: None,
            }],
        };

        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            value,
            json!({
                "batchId": "b-1",
                "requests": [{
                    "id": "r-1",
                    "url": "https://api.example.com/items",
                    "method": "GET",
                    "headers": {}
                }]
            })
        );
    }

    /// Validates response entries map to results.
    #[test]
    fn test_response_item_into_result() {
        let ok: BatchResponseItem =
            serde_json::from_value(json!({"requestId": "r-1", "status": 200, "data": {"n": 1}}))
                .unwrap();
        assert_eq!(ok.into_result().unwrap().data, json!({"n": 1}));

        let rejected = BatchResponseItem::failed("r-2", 409, "conflict").into_result();
        assert!(matches!(
            rejected,
            Err(NetError::RequestRejected { status: 409, ref message, .. }) if message == "conflict"
        ));

        let server_error = BatchResponseItem::ok("r-3", 503, json!("busy")).into_result();
        assert_eq!(server_error.unwrap_err().status(), Some(503));
    }

    /// Validates the coalescing key ignores header order and name case.
    #[test]
    fn test_coalesce_key_normalizes_headers() {
        let mut a = BTreeMap::new();
        a.insert("Accept".to_string(), "application/json".to_string());
        a.insert("x-tenant".to_string(), "7".to_string());
        let mut b = BTreeMap::new();
        b.insert("X-Tenant".to_string(), "7".to_string());
        b.insert("accept".to_string(), "application/json".to_string());

        assert_eq!(CoalesceKey::new(Method::Get, "/a", &a), CoalesceKey::new(Method::Get, "/a", &b));
        assert_ne!(CoalesceKey::new(Method::Get, "/a", &a), CoalesceKey::new(Method::Head, "/a", &a));
    }
}
