use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Client as ReqwestClient;
use serde_json::Value;
use synclink_common::error::CommonError;
use tracing::debug;

use super::{Endpoint, Method, OutboundRequest, RequestBody, Response, Transport, TransportHandle};
use crate::error::{NetError, NetResult};

/// State behind an HTTP [`TransportHandle`]
#[derive(Debug)]
struct HttpConnection {
    client: ReqwestClient,
    endpoint: Endpoint,
}

/// reqwest-backed transport; one client per logical connection
#[derive(Debug, Clone)]
pub struct HttpTransport {
    request_timeout: Duration,
    user_agent: Option<String>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30), user_agent: None }
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout applied when a request carries none of its own
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Options => reqwest::Method::OPTIONS,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn map_reqwest_error(err: &reqwest::Error, timeout: Duration) -> NetError {
    if err.is_timeout() {
        return NetError::OperationTimeout { timeout };
    }
    NetError::transport(format!("http request failed: {err}"), err.status().map(|s| s.as_u16()))
}

/// Empty bodies become `null`, non-JSON bodies a string
fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> NetResult<TransportHandle> {
        if endpoint.kind().is_streaming() {
            return Err(NetError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                message: "streaming transports are not supported over http".to_string(),
            });
        }

        let mut builder = ReqwestClient::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(1)
            .no_proxy();
        if let Some(agent) = &self.user_agent {
            builder = builder.user_agent(agent.clone());
        }

        let client = builder.build().map_err(|err| NetError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;

        debug!(endpoint = %endpoint, "http connection prepared");
        Ok(TransportHandle::new(HttpConnection { client, endpoint: endpoint.clone() }))
    }

    async fn send(
        &self,
        handle: &TransportHandle,
        request: &OutboundRequest,
    ) -> NetResult<Response> {
        let connection = handle.downcast_ref::<HttpConnection>().ok_or_else(|| {
            CommonError::internal_in("transport", "handle does not belong to the http transport")
        })?;

        let options = &request.options;
        let timeout = options.timeout.unwrap_or(self.request_timeout);
        let mut builder = connection
            .client
            .request(reqwest_method(options.method), &request.url)
            .timeout(timeout);

        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &options.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Raw { bytes, content_type, content_encoding }) => {
                let mut raw = builder.header(CONTENT_TYPE, content_type.as_str());
                if let Some(encoding) = content_encoding {
                    raw = raw.header(CONTENT_ENCODING, encoding.as_str());
                }
                raw.body(bytes.clone())
            }
            None => builder,
        };

        debug!(
            endpoint = %connection.endpoint,
            method = %options.method,
            url = %request.url,
            "sending http request"
        );

        let response = builder.send().await.map_err(|err| map_reqwest_error(&err, timeout))?;
        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let bytes = response.bytes().await.map_err(|err| map_reqwest_error(&err, timeout))?;

        debug!(url = %request.url, status = status.as_u16(), "received http response");

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            let message = if body.is_empty() {
                format!("{} returned {status}", request.url)
            } else {
                format!("{} returned {status}: {}", request.url, body.trim())
            };
            return Err(NetError::transport(message, Some(status.as_u16())));
        }

        Ok(Response { status: status.as_u16(), headers, data: decode_body(&bytes) })
    }

    async fn close(&self, handle: &TransportHandle) -> NetResult<()> {
        if let Some(connection) = handle.downcast_ref::<HttpConnection>() {
            debug!(endpoint = %connection.endpoint, "http connection closed");
        }
        Ok(())
    }
}
