//! Bounded-concurrency dispatch queue.
//!
//! Every outbound call goes through here. A fixed pool of workers drains one
//! FIFO; at most `concurrency` calls are in flight. Status handling lives
//! here and nowhere else: callers receive either a decoded [`Reply`] or a
//! classified [`ClientError`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::auth::Credentials;
use crate::deferred::{Deferred, Promise};
use crate::error::{ClientError, ClientResult};
use crate::transport::{RawResponse, Request, Transport};
use crate::types::Reply;

/// One outbound call and the deferred it settles.
#[derive(Debug)]
pub struct Task {
    pub request: Request,
    pub deferred: Deferred<Reply>,
}

/// Queue counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicUsize,
}

impl QueueStats {
    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Tasks currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of tasks executing at once so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Tasks settled so far.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

/// Handle to the worker pool. Cloning shares the pool.
///
/// Workers stop once every handle is dropped and the queue is drained.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Task>,
    stats: Arc<QueueStats>,
}

struct WorkerContext {
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    stats: Arc<QueueStats>,
}

impl DispatchQueue {
    /// Start `concurrency` workers on the current Tokio runtime.
    pub fn new(
        concurrency: usize,
        transport: Arc<dyn Transport>,
        credentials: Credentials,
    ) -> ClientResult<Self> {
        if concurrency == 0 {
            return Err(ClientError::Config {
                message: "concurrency must be at least 1".into(),
            });
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|e| ClientError::Config {
            message: format!("dispatch queue needs a Tokio runtime: {}", e),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(QueueStats::default());
        let context = Arc::new(WorkerContext {
            rx: Mutex::new(rx),
            transport,
            credentials,
            stats: stats.clone(),
        });

        for worker in 0..concurrency {
            handle.spawn(run_worker(worker, context.clone()));
        }
        debug!(concurrency, "dispatch queue started");

        Ok(Self { tx, stats })
    }

    /// Queue a request. The returned promise settles when a worker has run it.
    pub fn submit(&self, request: Request) -> Promise<Reply> {
        if request.url.is_empty() {
            return Promise::rejected(ClientError::invalid_argument("request URL is empty"));
        }

        let deferred = Deferred::new();
        let promise = deferred.promise();

        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(task)) = self.tx.send(Task { request, deferred }) {
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            task.deferred.reject(ClientError::Abandoned);
        }
        promise
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

async fn run_worker(worker: usize, context: Arc<WorkerContext>) {
    loop {
        let next = {
            let mut rx = context.rx.lock().await;
            rx.recv().await
        };
        let Some(task) = next else {
            debug!(worker, "dispatch worker stopping");
            return;
        };

        let stats = &context.stats;
        stats.queued.fetch_sub(1, Ordering::SeqCst);
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let method = task.request.method.as_str();
        let url = task.request.url.clone();
        let outcome = execute(&context, task.request).await;

        stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        stats.completed.fetch_add(1, Ordering::SeqCst);

        match &outcome {
            Ok(_) => debug!(worker, method, url = %url, "task completed"),
            Err(e) => debug!(worker, method, url = %url, error = %e, "task failed"),
        }
        task.deferred.settle(outcome);
    }
}

async fn execute(context: &WorkerContext, request: Request) -> ClientResult<Reply> {
    // The key may change after construction, so it is read per task.
    let Some(key) = context.credentials.get() else {
        return Err(ClientError::MissingCredential);
    };
    let request = request.with_header("authorization", format!("Bearer {}", key));

    let response = context.transport.send(request).await?;
    classify(response)
}

/// Map a raw response onto a reply or an error.
pub fn classify(response: RawResponse) -> ClientResult<Reply> {
    if !response.is_success() {
        return Err(remote_error(response.status, &response.body));
    }
    if response.body.trim().is_empty() {
        return Ok(Reply::from_body(Value::Null));
    }
    let body: Value = serde_json::from_str(&response.body).map_err(|e| {
        ClientError::InvalidResponse {
            message: format!("failed to decode response body: {}", e),
        }
    })?;
    Ok(Reply::from_body(body))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoteErrorBody {
    code: Option<i64>,
    message: Option<String>,
    errors: BTreeMap<String, Value>,
}

fn remote_error(status: u16, body: &str) -> ClientError {
    let parsed = serde_json::from_str::<RemoteErrorBody>(body).ok();
    if parsed.is_none() && !body.trim().is_empty() {
        warn!(status, "remote error body is not JSON");
    }
    let parsed = parsed.unwrap_or_default();

    let message = parsed.message.unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            body.chars().take(200).collect()
        }
    });

    let fields = parsed
        .errors
        .into_iter()
        .map(|(field, message)| {
            let message = match message {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (field, message)
        })
        .collect();

    ClientError::Remote {
        status,
        code: parsed.code.unwrap_or(i64::from(status)),
        message,
        fields,
    }
}
