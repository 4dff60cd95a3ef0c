//! Event bus implementation for publishing crawl lifecycle events
//!
//! Delivery is synchronous: `publish` invokes every registered subscriber
//! in registration order before returning, so per-subscriber delivery
//! order always matches publication order. Subscribers must not block; a
//! subscriber that needs asynchronous handling should enqueue internally.
//! A panicking subscriber is caught, logged, and counted, and never
//! disturbs the publisher or its peers.

use log::{debug, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::errors::EventBusError;
use super::metrics::EventBusMetrics;
use super::types::CrawlEvent;

/// Callback invoked for each published event
pub type Subscriber = Box<dyn Fn(&CrawlEvent) + Send + Sync>;

/// Handle returned by [`CrawlEventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// Synchronous pub/sub bus for crawl events
pub struct CrawlEventBus {
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    metrics: EventBusMetrics,
}

impl Default for CrawlEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            metrics: EventBusMetrics::new(),
        }
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> &EventBusMetrics {
        &self.metrics
    }

    /// Register a subscriber. Subscribers registered earlier are invoked
    /// earlier for every event.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&CrawlEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.push((id, Box::new(callback)));
        self.metrics.update_subscriber_count(subs.len());
        SubscriberId(id)
    }

    /// Remove a previously registered subscriber
    pub fn unsubscribe(&self, id: SubscriberId) -> Result<(), EventBusError> {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id.0);
        if subs.len() == before {
            return Err(EventBusError::UnknownSubscriber(id.0));
        }
        self.metrics.update_subscriber_count(subs.len());
        Ok(())
    }

    /// Number of active subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Publish an event to all subscribers, in registration order
    ///
    /// Fire-and-forget: subscriber panics are caught and logged, and do
    /// not propagate to the publisher or to later subscribers.
    pub fn publish(&self, event: &CrawlEvent) -> Result<(), EventBusError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(EventBusError::Shutdown);
        }

        let subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        for (id, callback) in subs.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                self.metrics.increment_panics();
                warn!("Subscriber {id} panicked handling {} event", event.name());
            }
        }
        self.metrics.increment_published();
        debug!("Published {} to {} subscribers", event.name(), subs.len());
        Ok(())
    }

    /// Stop accepting publications. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Whether the bus has been shut down
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CrawlEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlEventBus")
            .field("subscribers", &self.subscriber_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
