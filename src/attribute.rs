//! Attribute change publication
//!
//! Devices expose their observable state (obs state, health, last command
//! result, block scalars) as attributes. Subscribers get at-least-once
//! delivery of change events carrying value, timestamp and quality; an
//! event is only emitted when the value actually changed.

use std::sync::Mutex;
use tokio::sync::broadcast;
use vcc_shared::now_ms;

/// Quality flag attached to every change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Valid,
    Invalid,
}

/// One attribute change
#[derive(Debug, Clone)]
pub struct ChangeEvent<T> {
    pub attribute: &'static str,
    pub value: T,
    pub timestamp_ms: u64,
    pub quality: Quality,
}

/// Publisher for a single attribute with duplicate suppression
pub struct AttributePublisher<T> {
    name: &'static str,
    tx: broadcast::Sender<ChangeEvent<T>>,
    last: Mutex<Option<T>>,
}

impl<T: Clone + PartialEq + Send + 'static> AttributePublisher<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            name,
            tx,
            last: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attach a subscriber; receives every change event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent<T>> {
        self.tx.subscribe()
    }

    /// The most recently published value, if any
    pub fn last(&self) -> Option<T> {
        self.last.lock().unwrap().clone()
    }

    /// Publish a new value. Returns false if the value is unchanged and
    /// the event was suppressed.
    pub fn publish(&self, value: T) -> bool {
        self.publish_with_quality(value, Quality::Valid)
    }

    pub fn publish_with_quality(&self, value: T, quality: Quality) -> bool {
        let mut last = self.last.lock().unwrap();
        if last.as_ref() == Some(&value) {
            return false;
        }
        *last = Some(value.clone());
        // Nobody subscribed yet is fine; the value is still retained
        let _ = self.tx.send(ChangeEvent {
            attribute: self.name,
            value,
            timestamp_ms: now_ms(),
            quality,
        });
        true
    }
}
