//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docstore_client::{ClientResult, RawResponse, Request, Transport};
use serde_json::{json, Value};

/// 24-hex object id derived from `n`.
pub fn oid(n: u32) -> String {
    format!("{:024x}", n)
}

/// Transport that answers everything with `[]` after a delay, tracking how
/// many calls overlap.
#[derive(Default)]
pub struct CountingTransport {
    pub delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    order: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
}

impl CountingTransport {
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// URLs in the order calls started.
    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    /// `_id` lists of every multi-get received, in arrival order.
    pub fn multi_gets(&self) -> Vec<Vec<String>> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .filter_map(|body| body["selector"]["_id"]["$in"].as_array().cloned())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, request: Request) -> ClientResult<RawResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(request.url.clone());
        if let Some(body) = &request.body {
            self.bodies.lock().unwrap().push(body.clone());
        }

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(RawResponse::json(200, &json!([])))
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Install a test-scoped subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
