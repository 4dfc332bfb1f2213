// Shared types for the acquisition pipeline
//
// One error taxonomy for the whole crate plus the frame type handed to
// the plot sink. Types that cross the host boundary derive serde.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the acquisition pipeline
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

/// One emission from the window processor: the shared x axis (monotonic
/// sample indices) plus one series per channel, oldest to newest. All
/// series have the same length as `x`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotFrame {
    pub x: Vec<u64>,
    pub channels: Vec<Vec<f64>>,
}

impl PlotFrame {
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_dimensions() {
        let frame = PlotFrame {
            x: vec![0, 1, 2],
            channels: vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
        };
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.num_channels(), 2);
        assert!(!frame.is_empty());

        let empty = PlotFrame {
            x: Vec::new(),
            channels: Vec::new(),
        };
        assert!(empty.is_empty());
    }
}
