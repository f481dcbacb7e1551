//! Id-batching coalescer.
//!
//! Single-object fetches are parked in a pending table and sent as one
//! multi-get per entity type once the current scheduler turn is over.
//! Requests for an id that is already pending share its deferred, so N
//! callers asking for one object cost one network call.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::cache::ReadCache;
use crate::deferred::{Deferred, Promise};
use crate::dispatch::DispatchQueue;
use crate::error::{ClientError, ClientResult};
use crate::routes::Routes;
use crate::types::{check_entity_type, check_object_id, document_id, Document, Reply};

/// `entity type -> object id -> deferred`.
type PendingFetchTable = HashMap<String, HashMap<String, Deferred<Document>>>;

#[derive(Default)]
struct Pending {
    table: PendingFetchTable,
    spool_scheduled: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    queue: DispatchQueue,
    routes: Routes,
    cache: OnceLock<Arc<ReadCache>>,
    batch_window: Duration,
    runtime: Handle,
}

/// Merges same-turn single-id fetches into multi-gets.
#[derive(Clone)]
pub struct Coalescer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("batch_window", &self.shared.batch_window)
            .field("cache", &self.shared.cache.get().is_some())
            .finish_non_exhaustive()
    }
}

fn lock(mutex: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Coalescer {
    /// Must be called within a Tokio runtime; spools run on it.
    pub fn new(queue: DispatchQueue, routes: Routes, batch_window: Duration) -> ClientResult<Self> {
        let runtime = Handle::try_current().map_err(|e| ClientError::Config {
            message: format!("coalescer needs a Tokio runtime: {}", e),
        })?;
        Ok(Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending::default()),
                queue,
                routes,
                cache: OnceLock::new(),
                batch_window,
                runtime,
            }),
        })
    }

    /// Publish pending fetches into `cache` from now on. Returns `false` if a
    /// cache was already attached.
    pub fn attach_cache(&self, cache: Arc<ReadCache>) -> bool {
        self.shared.cache.set(cache).is_ok()
    }

    pub fn cache(&self) -> Option<&Arc<ReadCache>> {
        self.shared.cache.get()
    }

    /// Fetch one object. Registration happens now, not when the promise is
    /// first polled, so fetches issued back to back share a batch.
    pub fn fetch(&self, entity_type: &str, id: &str) -> Promise<Document> {
        let mut promises = self.fetch_many(entity_type, &[id.to_string()]);
        promises
            .pop()
            .unwrap_or_else(|| Promise::rejected(ClientError::Abandoned))
    }

    /// Fetch several objects of one type, one promise per id in order.
    ///
    /// Every id is registered under one lock, so a spool running on another
    /// worker thread cannot split them across multi-gets.
    pub fn fetch_many(&self, entity_type: &str, ids: &[String]) -> Vec<Promise<Document>> {
        if let Err(e) = check_entity_type(entity_type) {
            return ids.iter().map(|_| Promise::rejected(e.clone())).collect();
        }

        let cache = self.cache();
        let mut pending = lock(&self.shared.pending);
        let mut registered = false;

        let promises: Vec<Promise<Document>> = ids
            .iter()
            .map(|id| {
                if let Err(e) = check_object_id(id) {
                    return Promise::rejected(e);
                }
                if let Some(cached) = cache.and_then(|c| c.object(entity_type, id)) {
                    return cached;
                }

                let by_id = pending.table.entry(entity_type.to_string()).or_default();
                if let Some(existing) = by_id.get(id) {
                    return existing.promise();
                }

                let deferred = Deferred::new();
                let promise = deferred.promise();
                by_id.insert(id.clone(), deferred);
                if let Some(cache) = cache {
                    cache.put_object(entity_type, id, promise.clone());
                }
                registered = true;
                promise
            })
            .collect();

        let schedule = registered && !mem::replace(&mut pending.spool_scheduled, true);
        drop(pending);

        if schedule {
            self.shared.runtime.spawn(spool(self.shared.clone()));
        }
        promises
    }

    /// Number of fetches waiting for the next spool.
    pub fn pending(&self) -> usize {
        lock(&self.shared.pending)
            .table
            .values()
            .map(HashMap::len)
            .sum()
    }
}

/// Drain the pending table into one multi-get per entity type.
async fn spool(shared: Arc<Shared>) {
    tokio::task::yield_now().await;
    if !shared.batch_window.is_zero() {
        tokio::time::sleep(shared.batch_window).await;
    }

    let table = {
        let mut pending = lock(&shared.pending);
        pending.spool_scheduled = false;
        mem::take(&mut pending.table)
    };

    for (entity_type, batch) in table {
        if batch.is_empty() {
            continue;
        }
        let mut ids: Vec<String> = batch.keys().cloned().collect();
        ids.sort();
        debug!(entity_type = %entity_type, count = ids.len(), "spooling multi-get");

        let reply = shared.queue.submit(shared.routes.get_many(&entity_type, &ids));
        let cache = shared.cache.get().cloned();
        shared
            .runtime
            .spawn(settle_batch(entity_type, batch, reply, cache));
    }
}

async fn settle_batch(
    entity_type: String,
    batch: HashMap<String, Deferred<Document>>,
    reply: Promise<Reply>,
    cache: Option<Arc<ReadCache>>,
) {
    let reject = |id: &str, deferred: &Deferred<Document>, error: ClientError| {
        // A failed fetch must not stay cached; the next call refetches.
        if let Some(cache) = &cache {
            cache.evict_object_if(&entity_type, id, &deferred.promise());
        }
        deferred.reject(error);
    };

    let documents = match reply.await.and_then(Reply::into_documents) {
        Ok(paged) => paged.records,
        Err(error) => {
            warn!(entity_type = %entity_type, count = batch.len(), error = %error, "multi-get failed");
            for (id, deferred) in &batch {
                reject(id, deferred, error.clone());
            }
            return;
        }
    };

    let mut by_id: HashMap<String, Document> = HashMap::with_capacity(documents.len());
    for doc in documents {
        if let Some(id) = document_id(&doc).map(str::to_string) {
            by_id.insert(id, doc);
        }
    }

    for (id, deferred) in &batch {
        match by_id.get(id) {
            Some(doc) => {
                deferred.resolve(doc.clone());
            }
            None => reject(
                id,
                deferred,
                ClientError::NotFound {
                    entity_type: entity_type.clone(),
                    id: id.clone(),
                },
            ),
        }
    }
}
