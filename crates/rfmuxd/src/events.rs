//! Fan-out of sweep events to live subscribers.
//!
//! The bridge holds a list of sinks behind a mutex. `emit` never awaits:
//! each sink either accepts the event immediately or is dropped from the
//! list. There is no buffering or replay beyond what a sink queues itself.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rfmux_core::SweepEvent;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default queue depth for channel subscribers.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Identifier returned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Why a sink rejected an event.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    #[error("sink lagging (queue full)")]
    Lagging,
}

/// A consumer of sweep events.
///
/// `deliver` must not block. Returning an error unregisters the sink.
pub trait EventSink: Send {
    fn deliver(&mut self, event: &SweepEvent) -> Result<(), SinkError>;
}

/// Sink backed by a bounded mpsc queue.
pub struct ChannelSink {
    sender: mpsc::Sender<SweepEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<SweepEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&mut self, event: &SweepEvent) -> Result<(), SinkError> {
        self.sender.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Lagging,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

struct Registered {
    id: SinkId,
    sink: Box<dyn EventSink>,
}

#[derive(Default)]
struct BridgeState {
    next_id: u64,
    sinks: Vec<Registered>,
}

/// Event fan-out shared by the sweep engine and the socket server.
///
/// Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBridge {
    inner: Arc<Mutex<BridgeState>>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a sink panicked mid-delivery; the list
    // itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a sink. It receives every event emitted from now on.
    pub fn register(&self, sink: Box<dyn EventSink>) -> SinkId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = SinkId(state.next_id);
        state.sinks.push(Registered { id, sink });
        debug!(sink = id.0, total = state.sinks.len(), "Event sink registered");
        id
    }

    /// Registers a channel sink and returns its receiving end.
    pub fn subscribe(&self, capacity: usize) -> (SinkId, mpsc::Receiver<SweepEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.register(Box::new(ChannelSink::new(tx)));
        (id, rx)
    }

    /// Removes a sink. Returns false if it was already gone.
    pub fn unregister(&self, id: SinkId) -> bool {
        let mut state = self.lock();
        let before = state.sinks.len();
        state.sinks.retain(|r| r.id != id);
        before != state.sinks.len()
    }

    /// Delivers an event to every sink, dropping the ones that fail.
    ///
    /// Returns how many sinks accepted the event.
    pub fn emit(&self, event: &SweepEvent) -> usize {
        let mut state = self.lock();
        let mut delivered = 0;

        state.sinks.retain_mut(|registered| match registered.sink.deliver(event) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(e) => {
                warn!(
                    sink = registered.id.0,
                    event = event.name(),
                    error = %e,
                    "Dropping event sink"
                );
                false
            }
        });

        delivered
    }

    pub fn sink_count(&self) -> usize {
        self.lock().sinks.len()
    }

    /// Spawns a task emitting `heartbeat` every `period` until cancelled.
    pub fn spawn_heartbeat(&self, period: Duration, cancel: CancellationToken) {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Heartbeat task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        bridge.emit(&SweepEvent::heartbeat());
                    }
                }
            }
        });
    }
}
