// Record fan-out across consumers with independent cadences
//
// The multiplexer owns one accumulation queue per attached sink. A
// record ingested while a sink is active lands in that sink's queue
// exactly once; a periodic flush drains the queue and hands the whole
// batch to the sink's delivery function as one unit. Sinks never see
// each other: a slow consumer only ever delays its own queue.
//
// Deactivation performs a final flush before the sink goes idle, so a
// consumer that is being stopped still receives everything buffered for
// it. The recording path depends on this.

use crate::buffer::{OverflowPolicy, QueueMetrics, RecordQueue};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where a sink's flushed batches go
pub type SinkDelivery = Box<dyn Fn(Vec<String>) + Send + Sync>;

/// Static description of one sink
pub struct SinkConfig {
    pub name: String,
    pub flush_interval_ms: u64,
    pub policy: OverflowPolicy,
    /// Ignored for `Unbounded` sinks
    pub capacity: usize,
    pub start_active: bool,
}

/// Handle to an attached sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(usize);

struct Sink {
    name: String,
    flush_interval_ms: u64,
    queue: RecordQueue,
    delivery: SinkDelivery,
    active: AtomicBool,
    // Serializes drain+deliver so concurrent flushes cannot reorder batches
    flush_gate: Mutex<()>,
}

impl Sink {
    /// Drain the queue and deliver the batch as one unit. The gate keeps
    /// a timer flush and a deactivation flush from interleaving their
    /// deliveries.
    fn flush(&self) -> usize {
        let _gate = self.flush_gate.lock();
        let batch = self.queue.drain_all();
        let count = batch.len();
        if count > 0 {
            (self.delivery)(batch);
        }
        count
    }
}

/// Fan-out hub between the framed record stream and its consumers
pub struct Multiplexer {
    sinks: RwLock<Vec<Arc<Sink>>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register a sink; records ingested from now on are queued for it
    /// whenever it is active.
    pub fn attach_sink(&self, config: SinkConfig, delivery: SinkDelivery) -> SinkId {
        let sink = Arc::new(Sink {
            queue: RecordQueue::new(config.policy, config.capacity),
            delivery,
            active: AtomicBool::new(config.start_active),
            flush_gate: Mutex::new(()),
            flush_interval_ms: config.flush_interval_ms,
            name: config.name,
        });

        let mut sinks = self.sinks.write();
        sinks.push(sink);
        let id = SinkId(sinks.len() - 1);

        let sink = &sinks[id.0];
        log::info!(
            "attached sink '{}' ({:?}, flush every {} ms)",
            sink.name,
            sink.queue.policy(),
            sink.flush_interval_ms
        );
        id
    }

    /// Queue a batch for every active sink, preserving record order
    pub fn ingest(&self, batch: &[String]) {
        let sinks = self.sinks.read();
        for sink in sinks.iter() {
            if sink.active.load(Ordering::Acquire) {
                for record in batch {
                    sink.queue.push(record.clone());
                }
            }
        }
    }

    /// Drain the sink's queue and deliver it as one batch. Returns the
    /// number of records delivered.
    pub fn flush(&self, id: SinkId) -> usize {
        match self.sink(id) {
            Some(sink) => sink.flush(),
            None => 0,
        }
    }

    /// Gate a sink on or off. Turning a sink off first flushes whatever
    /// its queue holds, so no buffered record is stranded.
    pub fn set_sink_active(&self, id: SinkId, active: bool) {
        let Some(sink) = self.sink(id) else {
            return;
        };

        if active {
            sink.active.store(true, Ordering::Release);
            log::info!("sink '{}' activated", sink.name);
        } else {
            // Stop accepting first so the final flush is really final
            sink.active.store(false, Ordering::Release);
            let flushed = sink.flush();
            log::info!(
                "sink '{}' deactivated ({} record(s) flushed on stop)",
                sink.name,
                flushed
            );
        }
    }

    pub fn is_sink_active(&self, id: SinkId) -> bool {
        self.sink(id)
            .map(|s| s.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn sink_flush_interval_ms(&self, id: SinkId) -> Option<u64> {
        self.sink(id).map(|s| s.flush_interval_ms)
    }

    pub fn sink_metrics(&self, id: SinkId) -> Option<QueueMetrics> {
        self.sink(id).map(|s| s.queue.metrics())
    }

    fn sink(&self, id: SinkId) -> Option<Arc<Sink>> {
        self.sinks.read().get(id.0).cloned()
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}
