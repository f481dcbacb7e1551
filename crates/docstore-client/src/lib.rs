//! Client access layer for a remote document-store API.
//!
//! This crate sits between calling code and the REST endpoint, providing:
//!
//! - A bounded-concurrency dispatch queue for every outbound call
//! - Id-level batching: same-turn single-object fetches become one multi-get
//! - Deduplication of concurrent requests for the same object
//! - An optional read cache (objects, search ids, aggregates) invalidated by
//!   `"type|id"` notifications from a pub/sub channel
//!
//! # Quick Start
//!
//! ```no_run
//! use docstore_client::{ClientConfig, DocumentClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = DocumentClient::new(ClientConfig::from_env())?;
//!
//! // Issued back to back: one network call for both.
//! let alice = client.get_by_id("Person", "5f1d7c2e9a1b2c3d4e5f6a7b");
//! let bob = client.get_by_id("Person", "5f1d7c2e9a1b2c3d4e5f6a7c");
//! let (alice, bob) = (alice.await?, bob.await?);
//! println!("{} and {}", alice["name"], bob["name"]);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `DOCSTORE_URL` | API base URL (default: `https://api.docstore.dev/v1`) |
//! | `DOCSTORE_API_KEY` | API key, sent as a bearer token |
//! | `DOCSTORE_CONCURRENCY` | Maximum requests in flight (default: 8) |
//! | `DOCSTORE_TIMEOUT` | Request timeout in seconds (default: 30) |
//! | `DOCSTORE_CACHE_CAPACITY` | Search/aggregate cache entries per type (default: 1000) |
//! | `DOCSTORE_BATCH_WINDOW_MS` | Extra delay before a batch is sent (default: 0) |
//! | `DOCSTORE_PARTIAL_RESULTS` | `drop` or `fail` for partially failed multi-id fetches |

pub mod auth;
pub mod cache;
pub mod client;
pub mod coalesce;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod invalidation;
pub mod routes;
pub mod transport;
pub mod types;

// Re-export main types
pub use auth::Credentials;
pub use cache::{CacheStats, ReadCache};
pub use client::DocumentClient;
pub use coalesce::Coalescer;
pub use deferred::{Deferred, Promise};
pub use dispatch::{DispatchQueue, QueueStats, Task};
pub use error::{ClientError, ClientResult};
pub use invalidation::{
    parse_message, Channel, ChannelConnector, ChannelState, InvalidationListener, MemoryHub,
};
pub use routes::Routes;
pub use transport::{HttpTransport, Method, RawResponse, Request, Transport, USER_AGENT_VALUE};
pub use types::{
    document_id, is_object_id, ByIdsOutcome, ClientConfig, Document, Paged, PartialResults, Reply,
};
