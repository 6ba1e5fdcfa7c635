//! ==============================================================================
//! queue.rs - the dispatch queue feeding the broadcast writer
//! ==============================================================================
//!
//! purpose:
//!     carries update events from many producers (sampler, connection readers)
//!     to exactly one consumer (the broadcast writer).
//!
//! guarantees:
//!     - bounded: never more than QUEUE_CAPACITY events in flight.
//!     - push waits while full (backpressure), pop waits while empty.
//!     - one global arrival order; each producer's own events stay in order.
//!     - events are moved in and moved out, each consumed exactly once.
//!
//! ==============================================================================

use crate::domain::{AlarmSong, DisplaySchedule, Metric, Sample, Scale, Thresholds};
use crate::error::QueueClosed;
use crate::registry::ConnId;

use tokio::sync::mpsc;

/// maximum events waiting for the writer
pub const QUEUE_CAPACITY: usize = 24;

/// what the writer has to do
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// a sensor tick
    Sample(Sample),
    /// global: new warning levels
    Warnings(Thresholds),
    /// global: new alarm selection
    Sound(AlarmSong),
    /// global: new display on/off times
    DisplaySchedule(DisplaySchedule),
    /// per client: switch the charted metric
    SwitchMetric(Metric),
    /// per client: switch the chart time scale
    ChangeScale(Scale),
    /// first subscribe: stream head plus the bootstrap frame
    Subscribe,
    /// serve the dashboard page
    Page,
    /// stream the readings log
    Export,
    /// truncate the readings log
    Purge,
    /// malformed request
    Error,
}

/// one unit of work for the writer
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    /// client the update is addressed to; None for a broadcast
    pub target: Option<ConnId>,
    /// connection the update came from; None for sensor ticks
    pub source: Option<ConnId>,
    pub op: Op,
}

impl UpdateEvent {
    pub fn sample(sample: Sample) -> Self {
        Self { target: None, source: None, op: Op::Sample(sample) }
    }

    /// a global settings change originating from `source`
    pub fn global(source: ConnId, op: Op) -> Self {
        Self { target: None, source: Some(source), op }
    }

    /// an update for `target` requested over `source`
    pub fn addressed(source: ConnId, target: ConnId, op: Op) -> Self {
        Self { target: Some(target), source: Some(source), op }
    }

    /// a reply to the requesting connection itself
    pub fn reply(conn: ConnId, op: Op) -> Self {
        Self::addressed(conn, conn, op)
    }
}

/// create a bounded dispatch queue
pub fn dispatch_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (EventSender { tx }, EventReceiver { rx })
}

/// producer handle; clone one per producer
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<UpdateEvent>,
}

impl EventSender {
    /// enqueue, waiting while the queue is full
    pub async fn push(&self, event: UpdateEvent) -> Result<(), QueueClosed> {
        self.tx.send(event).await.map_err(|_| QueueClosed)
    }

    /// events currently waiting
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// the single consumer handle
pub struct EventReceiver {
    rx: mpsc::Receiver<UpdateEvent>,
}

impl EventReceiver {
    /// dequeue, waiting while empty; None once every producer is gone
    pub async fn pop(&mut self) -> Option<UpdateEvent> {
        self.rx.recv().await
    }
}
