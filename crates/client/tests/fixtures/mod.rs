//! Shared fixtures for synclink-client integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use synclink_client::{
    Endpoint, NetError, NetResult, OutboundRequest, Response, Transport, TransportHandle,
};

/// Identifies the logical connection a request was sent on
#[derive(Debug)]
pub struct ConnectionTag(pub usize);

/// In-memory transport
///
/// Every connect yields a numbered handle; sends answer with the queued
/// responses first, then `200 {"connection": n, "url": ...}`.
#[derive(Default)]
pub struct MockTransport {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub sends: AtomicUsize,
    responses: Mutex<VecDeque<NetResult<Response>>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_response(&self, response: NetResult<Response>) {
        self.responses.lock().push_back(response);
    }

    pub fn push_status(&self, status: u16) {
        self.push_response(Err(NetError::transport(format!("status {status}"), Some(status))));
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _endpoint: &Endpoint, _timeout: Duration) -> NetResult<TransportHandle> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(TransportHandle::new(ConnectionTag(n)))
    }

    async fn send(&self, handle: &TransportHandle, request: &OutboundRequest) -> NetResult<Response> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(queued) = self.responses.lock().pop_front() {
            return queued;
        }
        let connection = handle.downcast_ref::<ConnectionTag>().map(|tag| tag.0);
        Ok(ok_response(json!({ "connection": connection, "url": request.url })))
    }

    async fn close(&self, _handle: &TransportHandle) -> NetResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn ok_response(data: serde_json::Value) -> Response {
    Response { status: 200, headers: BTreeMap::new(), data }
}
