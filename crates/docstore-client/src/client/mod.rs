//! Document-store client.
//!
//! Public API: no status code knowledge. Status mapping lives in dispatch.rs,
//! batching in coalesce.rs, caching in cache.rs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::auth::Credentials;
use crate::cache::{aggregate_key, search_key, CacheStats, ReadCache};
use crate::coalesce::Coalescer;
use crate::deferred::Promise;
use crate::dispatch::{DispatchQueue, QueueStats};
use crate::error::{ClientError, ClientResult};
use crate::invalidation::{ChannelConnector, ChannelState, InvalidationListener};
use crate::routes::Routes;
use crate::transport::{HttpTransport, Request, Transport};
use crate::types::{
    check_entity_type, check_object_id, document_id, ByIdsOutcome, ClientConfig, Document, Paged,
    Reply,
};

mod helpers;

use helpers::{apply_policy, expect_list, ids_of, partition, restricts_fields};

/// Client for one document-store endpoint and API key.
///
/// Cloning is cheap and shares the worker pool, pending batches and cache.
#[derive(Debug, Clone)]
pub struct DocumentClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: ClientConfig,
    credentials: Credentials,
    routes: Routes,
    transport: Arc<dyn Transport>,
    queue: DispatchQueue,
    coalescer: Coalescer,
    listener: Mutex<Option<InvalidationListener>>,
}

impl DocumentClient {
    /// Client over HTTP. Must be called within a Tokio runtime.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let transport = HttpTransport::new(Duration::from_secs(config.timeout_secs))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Client over a caller-supplied transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> ClientResult<Self> {
        config.validate()?;

        let credentials = Credentials::new(config.api_key.clone());
        let routes = Routes::new(&config.url);
        let queue = DispatchQueue::new(config.concurrency, transport.clone(), credentials.clone())?;
        let coalescer = Coalescer::new(
            queue.clone(),
            routes.clone(),
            Duration::from_millis(config.batch_window_ms),
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                credentials,
                routes,
                transport,
                queue,
                coalescer,
                listener: Mutex::new(None),
            }),
        })
    }

    pub fn from_env() -> ClientResult<Self> {
        Self::new(ClientConfig::from_env())
    }

    /// A separate client for the same endpoint using another API key.
    ///
    /// It gets its own worker pool and starts without a cache.
    pub fn with_api_key(&self, key: impl Into<String>) -> ClientResult<Self> {
        let config = self.inner.config.clone().with_api_key(key);
        Self::with_transport(config, self.inner.transport.clone())
    }

    /// Replace the API key; applies to every task dequeued from now on.
    pub fn set_api_key(&self, key: Option<String>) {
        self.inner.credentials.set(key);
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.credentials.is_authenticated()
    }

    pub fn base_url(&self) -> &str {
        self.inner.routes.base_url()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn queue_stats(&self) -> &QueueStats {
        self.inner.queue.stats()
    }

    fn cache(&self) -> Option<&Arc<ReadCache>> {
        self.inner.coalescer.cache()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache().map(|c| c.stats())
    }

    async fn call(&self, request: Request) -> ClientResult<Reply> {
        self.inner.queue.submit(request).await
    }

    /// Turn on caching and follow dirty notifications for `tenant_id`.
    ///
    /// Calling again replaces the listener and keeps the cache.
    pub async fn enable_cache(
        &self,
        tenant_id: &str,
        channel_url: &str,
        connector: &dyn ChannelConnector,
    ) -> ClientResult<()> {
        let cache = match self.cache() {
            Some(cache) => cache.clone(),
            None => {
                let cache = Arc::new(ReadCache::new(self.inner.config.cache_capacity));
                self.inner.coalescer.attach_cache(cache.clone());
                // Lost a race with a concurrent call: use the attached one.
                self.cache().cloned().unwrap_or(cache)
            }
        };

        let listener = InvalidationListener::start(connector, channel_url, tenant_id, cache).await?;
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
        debug!(tenant_id, channel_url, "cache enabled");
        Ok(())
    }

    /// State of the invalidation listener, if caching was enabled.
    pub fn channel_state(&self) -> Option<ChannelState> {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(InvalidationListener::state)
    }

    /// Fetch one document.
    ///
    /// Returns immediately; the request is batched with other `get_by_id`
    /// calls made before the current task yields. Await the promise for the
    /// document.
    pub fn get_by_id(&self, entity_type: &str, id: &str) -> Promise<Document> {
        self.inner.coalescer.fetch(entity_type, id)
    }

    /// Fetch one historical version. Not batched, not cached.
    pub async fn get_version(
        &self,
        entity_type: &str,
        id: &str,
        version: &str,
    ) -> ClientResult<Document> {
        check_entity_type(entity_type)?;
        check_object_id(id)?;
        if version.is_empty() {
            return Err(ClientError::invalid_argument("version must not be empty"));
        }
        let reply = self
            .call(self.inner.routes.get_version(entity_type, id, version))
            .await?;
        Ok(reply.body)
    }

    /// Fetch selected fields of one document. Not batched, not cached.
    pub async fn get_fields(
        &self,
        entity_type: &str,
        id: &str,
        fields: &[String],
    ) -> ClientResult<Document> {
        check_entity_type(entity_type)?;
        check_object_id(id)?;
        if fields.is_empty() {
            return Err(ClientError::invalid_argument("fields must not be empty"));
        }
        let reply = self
            .call(self.inner.routes.get_fields(entity_type, id, fields))
            .await?;
        Ok(reply.body)
    }

    /// Fetch several documents, with per-id failures kept.
    pub async fn get_by_ids_detailed(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> ByIdsOutcome {
        let promises = self.inner.coalescer.fetch_many(entity_type, ids);

        let mut outcomes = Vec::with_capacity(promises.len());
        for (id, promise) in ids.iter().zip(promises) {
            outcomes.push((id.clone(), promise.await));
        }
        partition(outcomes)
    }

    /// Fetch several documents under the configured partial-results policy.
    ///
    /// An empty id list resolves to an empty list without a network call.
    pub async fn get_by_ids(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> ClientResult<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let outcome = self.get_by_ids_detailed(entity_type, ids).await;
        apply_policy(outcome, self.inner.config.partial_results)
    }

    /// Every document of a type, with the service's metadata.
    pub async fn get_all(&self, entity_type: &str) -> ClientResult<Paged<Vec<Document>>> {
        check_entity_type(entity_type)?;
        self.call(self.inner.routes.get_all(entity_type))
            .await?
            .into_documents()
    }

    /// Version history of one document.
    pub async fn history(
        &self,
        entity_type: &str,
        id: &str,
    ) -> ClientResult<Paged<Vec<Document>>> {
        check_entity_type(entity_type)?;
        check_object_id(id)?;
        self.call(self.inner.routes.history(entity_type, id))
            .await?
            .into_documents()
    }

    /// Documents matching `selector`.
    ///
    /// With the cache on and no `fields` restriction, results are recorded in
    /// both the id-search and the object tier, so a repeated search is
    /// answered without a network call.
    pub async fn search(
        &self,
        entity_type: &str,
        selector: &Value,
        params: &Map<String, Value>,
    ) -> ClientResult<Paged<Vec<Document>>> {
        check_entity_type(entity_type)?;
        let cache = self.cache().filter(|_| !restricts_fields(params));
        let key = cache.map(|_| search_key(entity_type, selector, params));

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            if let Some(ids) = cache.ids(entity_type, key) {
                debug!(entity_type, hits = ids.len(), "search served from cache");
                let outcome = self.get_by_ids_detailed(entity_type, &ids).await;
                return Ok(Paged {
                    records: outcome.documents,
                    metadata: None,
                });
            }
        }

        let paged = self
            .call(self.inner.routes.search(entity_type, selector, params))
            .await?
            .into_documents()?;

        if let (Some(cache), Some(key)) = (cache, key) {
            cache.put_ids(entity_type, key, ids_of(&paged.records));
            for doc in &paged.records {
                if let Some(id) = document_id(doc) {
                    cache.put_object(entity_type, id, Promise::resolved(doc.clone()));
                }
            }
        }
        Ok(paged)
    }

    /// Ids of documents matching `selector`.
    pub async fn get_ids(
        &self,
        entity_type: &str,
        selector: &Value,
        params: &Map<String, Value>,
    ) -> ClientResult<Vec<String>> {
        check_entity_type(entity_type)?;
        let cache = self.cache().filter(|_| !restricts_fields(params));
        let key = cache.map(|_| search_key(entity_type, selector, params));

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            if let Some(ids) = cache.ids(entity_type, key) {
                return Ok(ids.as_ref().clone());
            }
        }

        let mut narrowed = params.clone();
        narrowed
            .entry("fields")
            .or_insert_with(|| json!(["_id"]));
        let paged = self
            .call(self.inner.routes.search(entity_type, selector, &narrowed))
            .await?
            .into_documents()?;
        let ids = ids_of(&paged.records);

        if let (Some(cache), Some(key)) = (cache, key) {
            cache.put_ids(entity_type, key, ids.clone());
        }
        Ok(ids)
    }

    /// Id of the first document matching `selector`, if any.
    pub async fn get_id(&self, entity_type: &str, selector: &Value) -> ClientResult<Option<String>> {
        let mut params = Map::new();
        params.insert("limit".to_string(), json!(1));
        Ok(self
            .get_ids(entity_type, selector, &params)
            .await?
            .into_iter()
            .next())
    }

    /// Run an aggregation pipeline.
    pub async fn aggregate(&self, entity_type: &str, pipeline: &[Value]) -> ClientResult<Vec<Value>> {
        check_entity_type(entity_type)?;
        if pipeline.is_empty() {
            return Err(ClientError::invalid_argument("pipeline must not be empty"));
        }
        let cache = self.cache();
        let key = cache.map(|_| aggregate_key(entity_type, pipeline));

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            if let Some(rows) = cache.aggregate(entity_type, key) {
                return Ok(rows.as_ref().clone());
            }
        }

        let reply = self
            .call(self.inner.routes.aggregate(entity_type, pipeline))
            .await?;
        let rows = expect_list(reply.body, "aggregate")?;

        if let (Some(cache), Some(key)) = (cache, key) {
            cache.put_aggregate(entity_type, key, rows.clone());
        }
        Ok(rows)
    }

    /// Create a document; returns what the service stored.
    pub async fn create(&self, entity_type: &str, doc: &Document) -> ClientResult<Document> {
        check_entity_type(entity_type)?;
        if !doc.is_object() {
            return Err(ClientError::invalid_argument("document must be a JSON object"));
        }
        let reply = self
            .call(self.inner.routes.create(entity_type, doc))
            .await?;
        Ok(reply.body)
    }

    /// Replace a document.
    pub async fn update(
        &self,
        entity_type: &str,
        id: &str,
        doc: &Document,
    ) -> ClientResult<Document> {
        check_entity_type(entity_type)?;
        check_object_id(id)?;
        if !doc.is_object() {
            return Err(ClientError::invalid_argument("document must be a JSON object"));
        }
        // Stale whatever the write's outcome.
        if let Some(cache) = self.cache() {
            cache.evict_object(entity_type, id);
        }
        let reply = self
            .call(self.inner.routes.update(entity_type, id, doc))
            .await?;
        Ok(reply.body)
    }

    /// Update when `doc` carries an `_id`, create otherwise.
    pub async fn save(&self, entity_type: &str, doc: &Document) -> ClientResult<Document> {
        match document_id(doc) {
            Some(id) => self.update(entity_type, id, doc).await,
            None => self.create(entity_type, doc).await,
        }
    }

    /// Delete a document.
    pub async fn destroy(&self, entity_type: &str, id: &str) -> ClientResult<Value> {
        check_entity_type(entity_type)?;
        check_object_id(id)?;
        if let Some(cache) = self.cache() {
            cache.evict_object(entity_type, id);
        }
        let reply = self
            .call(self.inner.routes.destroy(entity_type, id))
            .await?;
        Ok(reply.body)
    }
}
