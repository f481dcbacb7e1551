//! Dirty-notification listener.
//!
//! Joins a pub/sub channel named after the tenant and turns each
//! `"entityType|objectId"` message into a cache invalidation. The channel
//! library itself is a collaborator behind [`ChannelConnector`]; reconnects
//! are its business, not ours.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ReadCache;
use crate::error::{ClientError, ClientResult};

/// Connection state of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connected,
    Joined,
    Receiving,
}

/// Opens channels.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> ClientResult<Box<dyn Channel>>;
}

/// An open pub/sub connection.
#[async_trait]
pub trait Channel: Send + 'static {
    async fn join(&mut self, channel_id: &str) -> ClientResult<()>;

    /// Next raw text payload; `None` once the channel is closed.
    async fn next_message(&mut self) -> Option<String>;
}

/// Split a `"type|id"` payload. Anything else is malformed.
pub fn parse_message(text: &str) -> Option<(&str, &str)> {
    let mut parts = text.split('|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(entity_type), Some(id), None) if !entity_type.is_empty() && !id.is_empty() => {
            Some((entity_type, id))
        }
        _ => None,
    }
}

/// Running listener.
#[derive(Debug)]
pub struct InvalidationListener {
    state: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

impl InvalidationListener {
    /// Connect, join `tenant_id` and start applying messages to `cache`.
    ///
    /// Connect and join failures are returned; once joined, the listener runs
    /// until the channel closes.
    pub async fn start(
        connector: &dyn ChannelConnector,
        url: &str,
        tenant_id: &str,
        cache: Arc<ReadCache>,
    ) -> ClientResult<Self> {
        if tenant_id.is_empty() {
            return Err(ClientError::invalid_argument("tenant id must not be empty"));
        }

        let (state_tx, state) = watch::channel(ChannelState::Disconnected);

        let mut channel = connector.connect(url).await?;
        state_tx.send_replace(ChannelState::Connected);
        info!(url, "invalidation channel connected");

        channel.join(tenant_id).await?;
        state_tx.send_replace(ChannelState::Joined);
        info!(channel = tenant_id, "invalidation channel joined");

        let task = tokio::spawn(receive(channel, cache, state_tx));
        Ok(Self { state, task })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Wait until the listener reaches `wanted`.
    pub async fn wait_for_state(&mut self, wanted: ChannelState) -> ChannelState {
        let reached = self.state.wait_for(|s| *s == wanted).await.map(|s| *s);
        reached.unwrap_or_else(|_| *self.state.borrow())
    }

    /// Stop listening.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for InvalidationListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive(
    mut channel: Box<dyn Channel>,
    cache: Arc<ReadCache>,
    state: watch::Sender<ChannelState>,
) {
    while let Some(text) = channel.next_message().await {
        state.send_replace(ChannelState::Receiving);
        match parse_message(&text) {
            Some((entity_type, id)) => cache.invalidate(entity_type, id),
            None => warn!(message = %text, "ignoring malformed invalidation message"),
        }
    }
    state.send_replace(ChannelState::Disconnected);
    info!("invalidation channel closed");
}

/// In-process pub/sub hub implementing [`ChannelConnector`].
///
/// Useful for tests and for embedding the client next to a publisher in the
/// same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl MemoryHub {
    const TOPIC_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel_id: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel_id.to_string())
            .or_insert_with(|| broadcast::channel(Self::TOPIC_CAPACITY).0)
            .clone()
    }

    /// Publish a payload. Returns how many joined channels received it.
    pub fn publish(&self, channel_id: &str, text: impl Into<String>) -> usize {
        self.sender(channel_id).send(text.into()).unwrap_or(0)
    }

    /// Close a topic; joined channels see the end of their stream.
    pub fn close(&self, channel_id: &str) {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel_id);
    }
}

#[async_trait]
impl ChannelConnector for MemoryHub {
    async fn connect(&self, url: &str) -> ClientResult<Box<dyn Channel>> {
        debug!(url, "memory channel connected");
        Ok(Box::new(MemoryChannel {
            hub: self.clone(),
            rx: None,
        }))
    }
}

struct MemoryChannel {
    hub: MemoryHub,
    rx: Option<broadcast::Receiver<String>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn join(&mut self, channel_id: &str) -> ClientResult<()> {
        self.rx = Some(self.hub.sender(channel_id).subscribe());
        Ok(())
    }

    async fn next_message(&mut self) -> Option<String> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(text) => return Some(text),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "invalidation channel lagged, messages lost");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
