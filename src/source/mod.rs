// Byte device abstraction
//
// The reader task polls one of these on its poll interval. Sources are
// deliberately dumb byte taps: no framing, no retry, no buffering
// beyond whatever the OS driver holds. A failed read means the
// connection is gone.

use crate::types::MonitorResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod replay;
#[cfg(target_family = "unix")]
mod serial;

pub use replay::ReplaySource;
#[cfg(target_family = "unix")]
pub use serial::SerialSource;

/// A byte device the reader task polls.
///
/// All methods are called from one task, so implementations hold plain
/// mutable state. `read_nonblocking` must return immediately whether or
/// not data is available.
pub trait ByteSource: Send {
    /// Acquire the device. Called inside the runtime, once, before the
    /// first read.
    fn open(&mut self) -> MonitorResult<()>;

    /// Read whatever is available right now into `buf`. `Ok(0)` means
    /// no data yet; an error means the connection is lost.
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> MonitorResult<usize>;

    /// Push bytes to the device
    fn write(&mut self, bytes: &[u8]) -> MonitorResult<()>;

    /// Release the device; reads and writes fail afterwards
    fn close(&mut self);

    /// Human-readable identity for status messages
    fn describe(&self) -> String;
}

/// Configuration for creating a byte source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Physical serial port
    #[cfg(target_family = "unix")]
    Serial { port: String, baud_rate: u32 },

    /// Replay a file's bytes in fixed chunks at a fixed interval.
    /// Deterministic input for tests and demos.
    Replay {
        path: PathBuf,
        chunk_size: usize,
        interval_ms: u64,
    },
}

impl SourceConfig {
    #[cfg(target_family = "unix")]
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self::Serial {
            port: port.into(),
            baud_rate,
        }
    }

    pub fn replay(path: impl Into<PathBuf>, chunk_size: usize, interval_ms: u64) -> Self {
        Self::Replay {
            path: path.into(),
            chunk_size,
            interval_ms,
        }
    }
}

/// Build a source from its configuration. The source comes back
/// unopened; the reader task opens it.
pub fn create_source(config: &SourceConfig) -> Box<dyn ByteSource> {
    match config {
        #[cfg(target_family = "unix")]
        SourceConfig::Serial { port, baud_rate } => {
            Box::new(SerialSource::new(port.clone(), *baud_rate))
        }
        SourceConfig::Replay {
            path,
            chunk_size,
            interval_ms,
        } => Box::new(ReplaySource::new(path.clone(), *chunk_size, *interval_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_builds_each_source() {
        let replay = create_source(&SourceConfig::replay("/tmp/in.csv", 64, 10));
        assert!(replay.describe().contains("replay"));

        #[cfg(target_family = "unix")]
        {
            let serial = create_source(&SourceConfig::serial("/dev/ttyUSB0", 115_200));
            assert!(serial.describe().contains("ttyUSB0"));
        }
    }
}
