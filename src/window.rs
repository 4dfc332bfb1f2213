// Sliding-window preparation for the plot sink
//
// Staged raw records are parsed on a fixed tick into per-channel
// sample windows sharing one x axis of monotonic sample indices. The
// channel count is not configured anywhere; it is established from the
// first record that parses, and stays fixed until the processor is
// reset for a new connection.

use crate::buffer::{OverflowPolicy, QueueMetrics, RecordQueue};
use crate::types::{MonitorError, MonitorResult, PlotFrame};
use std::collections::VecDeque;
use std::sync::Arc;

/// Parses staged records into fixed-capacity channel windows.
///
/// `ingest` is cheap and callable from any task (the staging queue is
/// lock-free); `tick` and the rest belong to the single owning task.
pub struct WindowProcessor {
    window_size: usize,
    num_channels: Option<usize>,
    channels: Vec<VecDeque<f64>>,
    x: VecDeque<u64>,
    next_index: u64,
    staging: Arc<RecordQueue>,
}

impl WindowProcessor {
    pub fn new(window_size: usize, staging_capacity: usize) -> Self {
        Self {
            window_size,
            num_channels: None,
            channels: Vec::new(),
            x: VecDeque::new(),
            next_index: 0,
            staging: Arc::new(RecordQueue::new(
                OverflowPolicy::DropOldest,
                staging_capacity,
            )),
        }
    }

    /// Stage a batch of raw records for the next tick
    pub fn ingest(&self, batch: &[String]) {
        for record in batch {
            self.staging.push(record.clone());
        }
    }

    /// Handle to the staging queue, for pushing from another task
    pub fn intake(&self) -> Arc<RecordQueue> {
        Arc::clone(&self.staging)
    }

    /// Drain and parse staged records, appending samples to the windows.
    ///
    /// A record that fails to parse, or whose field count disagrees with
    /// the established channel count, is discarded with a warning; the
    /// stream continues. Returns a frame only when at least one sample
    /// was appended, so an idle tick never re-emits stale windows.
    pub fn tick(&mut self) -> Option<PlotFrame> {
        let staged = self.staging.drain_all();
        if staged.is_empty() {
            return None;
        }

        let mut appended = 0usize;
        for record in &staged {
            let values = match parse_record(record) {
                Ok(values) => values,
                Err(e) => {
                    log::warn!("discarding record: {}", e);
                    continue;
                }
            };

            let expected = match self.num_channels {
                Some(n) => n,
                None => {
                    self.init_channels(values.len());
                    values.len()
                }
            };

            if values.len() != expected {
                log::warn!(
                    "discarding record '{}': expected {} field(s), got {}",
                    record,
                    expected,
                    values.len()
                );
                continue;
            }

            self.push_sample(&values);
            appended += 1;
        }

        if appended > 0 {
            Some(self.frame())
        } else {
            None
        }
    }

    /// Change the window capacity, keeping the `min(size, current)` most
    /// recent samples. Emits a frame immediately so observers see the
    /// new extent without waiting for data. Zero and unchanged sizes are
    /// ignored.
    pub fn set_window_size(&mut self, size: usize) -> Option<PlotFrame> {
        if size == 0 || size == self.window_size {
            return None;
        }

        let old = self.window_size;
        self.window_size = size;

        // Windows are rebuilt, not truncated in place
        for window in &mut self.channels {
            *window = rebuilt(window, size);
        }
        self.x = rebuilt(&self.x, size);

        log::info!("plot window resized {} -> {} samples", old, size);
        self.num_channels.map(|_| self.frame())
    }

    /// Forget everything from the previous connection: windows, x axis,
    /// sample index, staged records, and the established channel count.
    pub fn reset(&mut self) {
        self.num_channels = None;
        self.channels.clear();
        self.x.clear();
        self.next_index = 0;
        self.staging.clear();
        log::debug!("window processor reset");
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// `None` until the first record parses
    pub fn num_channels(&self) -> Option<usize> {
        self.num_channels
    }

    pub fn staging_metrics(&self) -> QueueMetrics {
        self.staging.metrics()
    }

    fn init_channels(&mut self, count: usize) {
        self.channels = (0..count)
            .map(|_| VecDeque::with_capacity(self.window_size))
            .collect();
        self.num_channels = Some(count);
        log::info!("channel count established from first record: {}", count);
    }

    fn push_sample(&mut self, values: &[f64]) {
        for (window, value) in self.channels.iter_mut().zip(values) {
            if window.len() == self.window_size {
                window.pop_front();
            }
            window.push_back(*value);
        }

        if self.x.len() == self.window_size {
            self.x.pop_front();
        }
        self.x.push_back(self.next_index);
        self.next_index += 1;
    }

    fn frame(&self) -> PlotFrame {
        PlotFrame {
            x: self.x.iter().copied().collect(),
            channels: self
                .channels
                .iter()
                .map(|window| window.iter().copied().collect())
                .collect(),
        }
    }
}

/// Split one record on commas and parse every field as f64
fn parse_record(record: &str) -> MonitorResult<Vec<f64>> {
    record
        .split(',')
        .map(|field| {
            let field = field.trim();
            field.parse::<f64>().map_err(|_| {
                MonitorError::Parse(format!("invalid field '{}' in record '{}'", field, record))
            })
        })
        .collect()
}

/// New window of `size` capacity holding the newest samples of `window`
fn rebuilt<T: Copy>(window: &VecDeque<T>, size: usize) -> VecDeque<T> {
    let keep = window.len().min(size);
    let mut next = VecDeque::with_capacity(size);
    next.extend(window.iter().skip(window.len() - keep).copied());
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_two_channel_window_of_two() {
        let mut processor = WindowProcessor::new(2, 100);

        processor.ingest(&records(&["10,20"]));
        processor.tick();
        processor.ingest(&records(&["11,21"]));
        processor.tick();
        processor.ingest(&records(&["12,22"]));
        let frame = processor.tick().unwrap();

        assert_eq!(frame.channels, vec![vec![11.0, 12.0], vec![21.0, 22.0]]);
        assert_eq!(frame.x, vec![1, 2]);
    }

    #[test]
    fn test_malformed_record_discarded() {
        let mut processor = WindowProcessor::new(10, 100);

        processor.ingest(&records(&["1,2,3", "bad", "4,5,3"]));
        let frame = processor.tick().unwrap();

        assert_eq!(processor.num_channels(), Some(3));
        assert_eq!(frame.x, vec![0, 1]);
        assert_eq!(frame.channels[0], vec![1.0, 4.0]);
        assert_eq!(frame.channels[1], vec![2.0, 5.0]);
        assert_eq!(frame.channels[2], vec![3.0, 3.0]);
    }

    #[test]
    fn test_channel_count_is_sticky() {
        let mut processor = WindowProcessor::new(10, 100);

        processor.ingest(&records(&["1,2,3"]));
        processor.tick();
        assert_eq!(processor.num_channels(), Some(3));

        // Narrower and wider records are discarded, not re-established
        processor.ingest(&records(&["7,8", "1,2,3,4", "9,9,9"]));
        let frame = processor.tick().unwrap();

        assert_eq!(processor.num_channels(), Some(3));
        assert_eq!(frame.channels[0], vec![1.0, 9.0]);
    }

    #[test]
    fn test_lazy_initialization() {
        let mut processor = WindowProcessor::new(10, 100);
        assert_eq!(processor.num_channels(), None);

        // Unparseable records never establish a channel count
        processor.ingest(&records(&["garbage"]));
        assert!(processor.tick().is_none());
        assert_eq!(processor.num_channels(), None);

        processor.ingest(&records(&["5"]));
        let frame = processor.tick().unwrap();
        assert_eq!(processor.num_channels(), Some(1));
        assert_eq!(frame.channels, vec![vec![5.0]]);
    }

    #[test]
    fn test_empty_tick_emits_nothing() {
        let mut processor = WindowProcessor::new(10, 100);
        processor.ingest(&records(&["1,2"]));
        assert!(processor.tick().is_some());

        // No staged records: no emission, stale windows stay private
        assert!(processor.tick().is_none());
    }

    #[test]
    fn test_shrink_keeps_newest() {
        let mut processor = WindowProcessor::new(10, 100);
        for i in 0..5 {
            processor.ingest(&[format!("{},{}", i, i * 10)]);
            processor.tick();
        }

        let frame = processor.set_window_size(3).unwrap();
        assert_eq!(frame.x, vec![2, 3, 4]);
        assert_eq!(frame.channels[0], vec![2.0, 3.0, 4.0]);
        assert_eq!(frame.channels[1], vec![20.0, 30.0, 40.0]);

        // Subsequent samples respect the new capacity
        processor.ingest(&records(&["5,50"]));
        let frame = processor.tick().unwrap();
        assert_eq!(frame.x, vec![3, 4, 5]);
    }

    #[test]
    fn test_grow_keeps_all_current() {
        let mut processor = WindowProcessor::new(2, 100);
        for i in 0..4 {
            processor.ingest(&[i.to_string()]);
            processor.tick();
        }

        let frame = processor.set_window_size(5).unwrap();
        assert_eq!(frame.x, vec![2, 3]);
        assert_eq!(frame.channels[0], vec![2.0, 3.0]);
    }

    #[test]
    fn test_resize_noop_cases() {
        let mut processor = WindowProcessor::new(4, 100);
        processor.ingest(&records(&["1"]));
        processor.tick();

        assert!(processor.set_window_size(0).is_none());
        assert!(processor.set_window_size(4).is_none());
        assert_eq!(processor.window_size(), 4);
    }

    #[test]
    fn test_resize_before_first_record() {
        let mut processor = WindowProcessor::new(4, 100);
        assert!(processor.set_window_size(8).is_none());
        assert_eq!(processor.window_size(), 8);
    }

    #[test]
    fn test_staging_overflow_drops_oldest() {
        let mut processor = WindowProcessor::new(10, 2);

        processor.ingest(&records(&["1", "2", "3"]));
        let frame = processor.tick().unwrap();

        assert_eq!(frame.channels[0], vec![2.0, 3.0]);
        assert_eq!(processor.staging_metrics().total_dropped, 1);
    }

    #[test]
    fn test_reset_clears_session_state() {
        let mut processor = WindowProcessor::new(10, 100);
        processor.ingest(&records(&["1,2", "3,4"]));
        processor.tick();

        processor.reset();
        assert_eq!(processor.num_channels(), None);

        // A differently shaped stream re-establishes cleanly
        processor.ingest(&records(&["1,2,3"]));
        let frame = processor.tick().unwrap();
        assert_eq!(processor.num_channels(), Some(3));
        assert_eq!(frame.x, vec![0]);
    }
}
