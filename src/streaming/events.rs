//! Session event fan-out.
//!
//! A bounded single-producer channel: emissions are serialized, no event is
//! dropped while the stream is open, and a slow consumer may briefly block
//! the producer.

use std::sync::mpsc::{IntoIter, Receiver, SyncSender};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TranscriptionEvent {
    /// Live display state: the stable prefix plus the volatile tail.
    DisplayUpdate {
        confirmed_text: String,
        provisional_text: String,
    },
    /// The confirmed transcript grew; the new text is always an extension
    /// of every previously confirmed text.
    Confirmed { text: String },
    Stats(Stats),
    /// Final transcript. Emitted exactly once by `stop()`, never after
    /// `cancel()`; the stream closes right after.
    Ended { full_text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub encoded_window_count: usize,
    pub total_audio_seconds: f64,
    pub tokens_per_second: f64,
    pub real_time_factor: f64,
    pub peak_memory_gb: f64,
}

/// Capability for reading peak memory use, injected at session construction.
pub trait MemoryProbe: Send + Sync {
    fn peak_memory_gb(&self) -> f64;
}

/// Probe that reports nothing. The default for hosts without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMemoryProbe;

impl MemoryProbe for NoopMemoryProbe {
    fn peak_memory_gb(&self) -> f64 {
        0.0
    }
}

/// Consumer half of the session event channel.
pub struct EventStream {
    rx: Receiver<TranscriptionEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: Receiver<TranscriptionEvent>) -> Self {
        Self { rx }
    }

    /// Blocks until the next event; `None` once the stream has closed.
    pub fn recv(&self) -> Option<TranscriptionEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<TranscriptionEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<TranscriptionEvent> {
        self.rx.try_recv().ok()
    }
}

impl IntoIterator for EventStream {
    type Item = TranscriptionEvent;
    type IntoIter = IntoIter<TranscriptionEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.rx.into_iter()
    }
}

/// Producer half. Closing drops the sender, which ends the consumer's
/// iteration; emissions after close are discarded.
pub(crate) struct EventSender {
    tx: Mutex<Option<SyncSender<TranscriptionEvent>>>,
}

impl EventSender {
    pub(crate) fn new(tx: SyncSender<TranscriptionEvent>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn emit(&self, event: TranscriptionEvent) {
        let guard = self
            .tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_err() {
                log::debug!("event receiver dropped; discarding event");
            }
        }
    }

    pub(crate) fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}
