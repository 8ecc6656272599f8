//! Fan-out of access decisions to live subscribers.
//!
//! The capture worker publishes into a crossbeam queue and never waits on subscribers. A
//! dedicated dispatch thread drains the queue and pushes one JSON envelope per event to every
//! registered subscriber. Delivery is best effort: a subscriber whose send fails is dropped,
//! and late joiners get no replay.

use crate::access::AccessDecision;
use crate::metrics;

use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the dispatcher waits on an empty queue before checking for shutdown.
pub const DISPATCH_POLL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(flatten)]
    pub decision: AccessDecision,
    pub timestamp: DateTime<Utc>,
}

/// Wire envelope: `{"type": "detection", "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    Detection(DetectionEvent),
}

#[derive(Debug, Error)]
#[error("subscriber disconnected")]
pub struct SubscriberGone;

/// A push-capable text channel to one client.
pub trait Subscriber: Send {
    fn send(&self, text: &str) -> Result<(), SubscriberGone>;
}

impl Subscriber for tokio::sync::mpsc::UnboundedSender<String> {
    fn send(&self, text: &str) -> Result<(), SubscriberGone> {
        tokio::sync::mpsc::UnboundedSender::send(self, text.to_string()).map_err(|_| SubscriberGone)
    }
}

impl Subscriber for Sender<String> {
    fn send(&self, text: &str) -> Result<(), SubscriberGone> {
        Sender::send(self, text.to_string()).map_err(|_| SubscriberGone)
    }
}

pub type SubscriberId = u64;

#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, Box<dyn Subscriber>>>,
}

impl SubscriberSet {
    pub fn register(&self, subscriber: Box<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.insert(id, subscriber);
                subscribers.len()
            }
            Err(_) => return id,
        };
        metrics::SUBSCRIBERS.set(count as i64);
        info!("Subscriber {} registered ({} active)", id, count);
        id
    }

    pub fn deregister(&self, id: SubscriberId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if subscribers.remove(&id).is_some() {
                metrics::SUBSCRIBERS.set(subscribers.len() as i64);
                info!("Subscriber {} removed ({} active)", id, subscribers.len());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends `text` to everyone, dropping subscribers whose send fails. Returns how many
    /// received it.
    pub fn broadcast(&self, text: &str) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|id, subscriber| match subscriber.send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping subscriber {}: {}", id, e);
                false
            }
        });
        metrics::SUBSCRIBERS.set(subscribers.len() as i64);
        subscribers.len()
    }
}

/// Producer handle given to the detection pipeline. Never blocks.
#[derive(Clone)]
pub struct EventPublisher {
    queue: Sender<DetectionEvent>,
}

impl EventPublisher {
    pub fn new(queue: Sender<DetectionEvent>) -> Self {
        Self { queue }
    }

    /// False when the distributor is gone.
    pub fn publish(&self, event: DetectionEvent) -> bool {
        self.queue.send(event).is_ok()
    }
}

pub struct EventDistributor {
    queue: Sender<DetectionEvent>,
    pending: Receiver<DetectionEvent>,
    subscribers: Arc<SubscriberSet>,
    dispatcher: Mutex<Option<Dispatcher>>,
    poll: Duration,
}

struct Dispatcher {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Default for EventDistributor {
    fn default() -> Self {
        Self::new(DISPATCH_POLL)
    }
}

impl EventDistributor {
    pub fn new(poll: Duration) -> Self {
        let (queue, pending) = unbounded();
        Self {
            queue,
            pending,
            subscribers: Arc::new(SubscriberSet::default()),
            dispatcher: Mutex::new(None),
            poll,
        }
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(self.queue.clone())
    }

    pub fn subscribers(&self) -> Arc<SubscriberSet> {
        self.subscribers.clone()
    }

    pub fn register(&self, subscriber: Box<dyn Subscriber>) -> SubscriberId {
        self.subscribers.register(subscriber)
    }

    pub fn deregister(&self, id: SubscriberId) {
        self.subscribers.deregister(id)
    }

    /// Spawns the dispatch thread. Calling it while already running does nothing.
    pub fn start(&self) -> io::Result<()> {
        let Ok(mut dispatcher) = self.dispatcher.lock() else {
            return Ok(());
        };
        if dispatcher.is_some() {
            return Ok(());
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let pending = self.pending.clone();
        let subscribers = self.subscribers.clone();
        let run_shutdown = shutdown.clone();
        let poll = self.poll;
        let handle = thread::Builder::new()
            .name("event-dispatch".to_string())
            .spawn(move || dispatch(pending, subscribers, run_shutdown, poll))?;
        *dispatcher = Some(Dispatcher { shutdown, handle });
        info!("Event dispatcher started");
        Ok(())
    }

    /// Stops the dispatch thread after its current wait. Idempotent.
    pub fn stop(&self) {
        let run = match self.dispatcher.lock() {
            Ok(mut dispatcher) => dispatcher.take(),
            Err(_) => None,
        };
        if let Some(run) = run {
            run.shutdown.store(true, Ordering::SeqCst);
            if run.handle.join().is_err() {
                error!("Event dispatcher panicked");
            }
            info!("Event dispatcher stopped");
        }
    }
}

impl Drop for EventDistributor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(
    pending: Receiver<DetectionEvent>,
    subscribers: Arc<SubscriberSet>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    loop {
        match pending.recv_timeout(poll) {
            Ok(event) => deliver(&subscribers, event),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn deliver(subscribers: &SubscriberSet, event: DetectionEvent) {
    let plate = event.decision.plate.clone();
    let text = match serde_json::to_string(&HubMessage::Detection(event)) {
        Ok(text) => text,
        Err(e) => {
            error!("Cannot serialize detection of {}: {}", plate, e);
            return;
        }
    };
    let delivered = subscribers.broadcast(&text);
    metrics::EVENTS_BROADCAST.inc();
    info!("Detection {} sent to {} subscribers", plate, delivered);
}
