//! Settle-once result hand-off.
//!
//! A [`Deferred`] is held by the producer (a dispatch worker or a spool) and
//! settled exactly once. Any number of [`Promise`]s observe the outcome; the
//! coalescer hands the same promise to every caller asking for one object.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::error::{ClientError, ClientResult};

type Slot<T> = Option<ClientResult<T>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Producer side of a single pending result.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: watch::Sender<Slot<T>>,
    id: u64,
}

/// Consumer side: a cloneable handle resolving to the deferred's outcome.
#[derive(Debug)]
pub struct Promise<T> {
    rx: watch::Receiver<Slot<T>>,
    id: u64,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            id: self.id,
        }
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error. Returns `false` if already settled.
    pub fn reject(&self, error: ClientError) -> bool {
        self.settle(Err(error))
    }

    /// Settle with either outcome. Returns `false` if already settled.
    pub fn settle(&self, outcome: ClientResult<T>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn promise(&self) -> Promise<T> {
        Promise {
            rx: self.tx.subscribe(),
            id: self.id,
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Promise<T> {
    /// A promise that is already settled.
    pub fn settled(outcome: ClientResult<T>) -> Self {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        deferred.settle(outcome);
        promise
    }

    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: ClientError) -> Self {
        Self::settled(Err(error))
    }

    /// Wait for the outcome.
    pub async fn wait(mut self) -> ClientResult<T> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ClientError::Abandoned))
    }

    /// Outcome if already settled, without waiting.
    pub fn peek(&self) -> Option<ClientResult<T>> {
        self.rx.borrow().clone()
    }

    /// Whether both promises observe the same deferred.
    pub fn same_as(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> IntoFuture for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = ClientResult<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = ClientResult<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
