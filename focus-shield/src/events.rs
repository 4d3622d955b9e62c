//! Diagnostic log stream and observable session signals
//!
//! The bus carries a bounded, lossy log of diagnostic lines plus three state
//! signals (tunnel active, displayed blocked counter, lockdown). Readers
//! subscribe independently; slow readers lose the oldest log lines instead of
//! holding back the writer.

use crate::metrics::MetricsWindow;
use futures_util::stream::{self, Stream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Log lines buffered per reader before the oldest are dropped
pub const EVENT_BUFFER_CAPACITY: usize = 100;

/// One entry on the diagnostic stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Diagnostic line
    Message(String),
    /// Observers should clear what they have displayed so far
    Cleared,
}

/// Reader side of the diagnostic stream
pub struct EventSubscription {
    rx: broadcast::Receiver<BusEvent>,
}

impl EventSubscription {
    /// Next event in FIFO order, skipping over anything dropped for lagging
    ///
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Event reader lagged, {} entries dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Adapt into a `Stream` of events
    pub fn into_stream(self) -> impl Stream<Item = BusEvent> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

struct Inner {
    events: broadcast::Sender<BusEvent>,
    active: watch::Sender<bool>,
    counter: watch::Sender<u64>,
    lockdown: watch::Sender<bool>,
    metrics: Mutex<MetricsWindow>,
}

/// Process-wide diagnostics and state signals, passed around explicitly
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Bus whose counter uses the given metrics window
    pub fn new(window: Duration) -> Self {
        Self::with_metrics(MetricsWindow::new(window))
    }

    /// Bus around an existing metrics window
    pub fn with_metrics(metrics: MetricsWindow) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_CAPACITY);
        let (active, _) = watch::channel(false);
        let (counter, _) = watch::channel(metrics.displayed());
        let (lockdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                events,
                active,
                counter,
                lockdown,
                metrics: Mutex::new(metrics),
            }),
        }
    }

    /// Append a diagnostic line
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        // No subscribers is fine: the log is diagnostic only
        let _ = self.inner.events.send(BusEvent::Message(message));
    }

    /// Tell observers to clear their console
    pub fn clear(&self) {
        let _ = self.inner.events.send(BusEvent::Cleared);
    }

    /// Publish whether a session is up
    pub fn set_active(&self, active: bool) {
        self.inner.active.send_replace(active);
    }

    /// Publish whether lockdown is engaged
    pub fn set_lockdown(&self, lockdown: bool) {
        self.inner.lockdown.send_replace(lockdown);
    }

    /// Feed the engine's raw counter through the metrics window
    pub fn update_counter(&self, raw: u64) -> u64 {
        let displayed = self.metrics().update(raw);
        self.inner.counter.send_replace(displayed);
        displayed
    }

    /// Manually zero the displayed counter
    pub fn reset_counter(&self) {
        self.metrics().reset();
        self.inner.counter.send_replace(0);
    }

    /// Receive log lines from now on
    pub fn subscribe_events(&self) -> EventSubscription {
        EventSubscription {
            rx: self.inner.events.subscribe(),
        }
    }

    /// Watch the active signal
    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.inner.active.subscribe()
    }

    /// Watch the displayed counter
    pub fn subscribe_counter(&self) -> watch::Receiver<u64> {
        self.inner.counter.subscribe()
    }

    /// Watch the lockdown signal
    pub fn subscribe_lockdown(&self) -> watch::Receiver<bool> {
        self.inner.lockdown.subscribe()
    }

    /// Current active signal
    pub fn is_active(&self) -> bool {
        *self.inner.active.borrow()
    }

    /// Current lockdown signal
    pub fn is_lockdown(&self) -> bool {
        *self.inner.lockdown.borrow()
    }

    /// Current displayed counter
    pub fn counter(&self) -> u64 {
        *self.inner.counter.borrow()
    }

    fn metrics(&self) -> MutexGuard<'_, MetricsWindow> {
        // A panic while holding the lock cannot leave the window half-updated
        self.inner
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::metrics::DEFAULT_WINDOW)
    }
}
