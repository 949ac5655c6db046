use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use crate::errors::DeliveryError;
use crate::models::{MarketUpdate, SessionId, Tick};
use crate::subscription::SubscriptionRegistry;

/// Statistics for the fan-out broadcaster
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FanoutStats {
    /// Sessions with an attached sink
    pub session_count: usize,
    /// Ticks taken off the feed channel (lifetime)
    pub ticks_received: u64,
    /// Successful per-session deliveries (lifetime)
    pub deliveries: u64,
    /// Deliveries that failed because the sink was missing, closed or full
    pub delivery_failures: u64,
    /// Ticks dropped for a non-positive last price
    pub invalid_dropped: u64,
}

#[derive(Default)]
struct Counters {
    ticks_received: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    invalid_dropped: AtomicU64,
}

/// Delivers ticks to the sessions interested in their token
///
/// Each session has a dedicated bounded sink. A closed or full sink never
/// blocks or fails delivery to the others; the update is dropped for that
/// session only and nothing is retried.
///
/// # Example
/// ```ignore
/// let broadcaster = FanoutBroadcaster::new(Arc::clone(&registry));
/// let mut updates = broadcaster.attach_session(session);
///
/// // Feed task sends decoded ticks to tick_tx
/// broadcaster.spawn(tick_rx);
/// ```
#[derive(Clone)]
pub struct FanoutBroadcaster {
    registry: Arc<SubscriptionRegistry>,
    sinks: Arc<DashMap<SessionId, mpsc::Sender<MarketUpdate>>>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl FanoutBroadcaster {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self::with_capacity(registry, Self::DEFAULT_CAPACITY)
    }

    /// Broadcaster whose session sinks hold at most `capacity` updates
    pub fn with_capacity(registry: Arc<SubscriptionRegistry>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        tracing::info!("📡 FanoutBroadcaster created (session buffer {})", capacity);

        Self {
            registry,
            sinks: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            capacity,
        }
    }

    /// Create the sink for `session` and return its receiving end
    ///
    /// Attaching an already attached session replaces its sink.
    pub fn attach_session(&self, session: SessionId) -> mpsc::Receiver<MarketUpdate> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.sinks.insert(session, tx).is_some() {
            tracing::warn!("📡 Replaced existing sink for session {}", session);
        } else {
            tracing::debug!("📡 Sink attached for session {}", session);
        }
        rx
    }

    pub fn detach_session(&self, session: SessionId) -> bool {
        let removed = self.sinks.remove(&session).is_some();
        if removed {
            tracing::debug!("📡 Sink detached for session {}", session);
        }
        removed
    }

    pub fn has_session(&self, session: SessionId) -> bool {
        self.sinks.contains_key(&session)
    }

    /// Send `update` to one session
    pub fn deliver(&self, session: SessionId, update: MarketUpdate) -> Result<(), DeliveryError> {
        let sink = self
            .sinks
            .get(&session)
            .ok_or(DeliveryError::SessionNotFound(session))?;

        sink.try_send(update).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::SessionLagging(session),
            TrySendError::Closed(_) => DeliveryError::SessionClosed(session),
        })
    }

    /// Fan one tick out to every session interested in its token
    ///
    /// Returns the number of successful deliveries.
    pub fn on_tick(&self, tick: &Tick) -> usize {
        self.counters.ticks_received.fetch_add(1, Ordering::Relaxed);

        if !tick.is_valid() {
            self.counters.invalid_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Dropping tick for {} with price {}", tick.token, tick.last_traded_price);
            return 0;
        }

        let sessions = self.registry.sessions_for_token(&tick.token);
        if sessions.is_empty() {
            return 0;
        }

        let update = tick.to_market_update();
        let mut delivered = 0;

        for session in sessions {
            match self.deliver(session, update.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("📡 Delivery of {} failed: {}", update.room(), e);
                }
            }
        }

        self.counters
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Drain the tick channel until every sender is dropped
    pub async fn run(self, mut tick_rx: mpsc::UnboundedReceiver<Tick>) {
        tracing::info!("📡 Fan-out loop started");

        while let Some(tick) = tick_rx.recv().await {
            self.on_tick(&tick);
        }

        tracing::warn!("📡 Fan-out loop ended (feed channel closed)");
    }

    pub fn spawn(&self, tick_rx: mpsc::UnboundedReceiver<Tick>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(tick_rx))
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            session_count: self.sinks.len(),
            ticks_received: self.counters.ticks_received.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.counters.delivery_failures.load(Ordering::Relaxed),
            invalid_dropped: self.counters.invalid_dropped.load(Ordering::Relaxed),
        }
    }
}
