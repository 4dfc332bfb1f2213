// Pipeline cadences and capacities
//
// Defaults carry the rates the pipeline is tuned for: 1 ms device poll,
// ~30 Hz batch emission, 10 Hz display flush, 1 Hz recording flush and
// a 20 Hz window tick. Tests shrink the intervals.

use serde::{Deserialize, Serialize};

/// Tuning for one `MonitorController` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Device poll period for the non-blocking read loop (ms)
    pub poll_interval_ms: u64,

    /// Cadence at which framed records are released downstream as one batch (ms)
    pub emit_interval_ms: u64,

    /// Display sink flush cadence (ms)
    pub display_flush_interval_ms: u64,

    /// Recording sink flush cadence (ms)
    pub record_flush_interval_ms: u64,

    /// Window processor drain/parse cadence (ms)
    pub window_tick_interval_ms: u64,

    /// Sliding window capacity per channel, in samples
    pub window_size: usize,

    /// Outbound batch queue capacity; oldest records dropped on overflow
    pub emit_queue_capacity: usize,

    /// Display sink queue capacity; oldest records dropped on overflow
    pub display_queue_capacity: usize,

    /// Window staging queue capacity; oldest records dropped on overflow
    pub staging_capacity: usize,

    /// Device read size per poll, in bytes
    pub read_chunk_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1,
            emit_interval_ms: 33,
            display_flush_interval_ms: 100,
            record_flush_interval_ms: 1000,
            window_tick_interval_ms: 50,
            window_size: 100,
            emit_queue_capacity: 4096,
            display_queue_capacity: 4096,
            staging_capacity: 4000,
            read_chunk_size: 4096,
        }
    }
}
