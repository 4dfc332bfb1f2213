// File replay byte source
//
// Reads the whole file on open and hands it back in fixed chunks, one
// chunk per interval. The first chunk is released one interval after
// open, so callers get a quiet lead-in before data starts flowing.
// After the last byte every read reports no data; replay never fails
// the connection.

use super::ByteSource;
use crate::types::{MonitorError, MonitorResult};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub struct ReplaySource {
    path: PathBuf,
    chunk_size: usize,
    interval: Duration,
    data: Vec<u8>,
    offset: usize,
    last_chunk_at: Option<Instant>,
    open: bool,
}

impl ReplaySource {
    pub fn new(path: PathBuf, chunk_size: usize, interval_ms: u64) -> Self {
        Self {
            path,
            chunk_size: chunk_size.max(1),
            interval: Duration::from_millis(interval_ms),
            data: Vec::new(),
            offset: 0,
            last_chunk_at: None,
            open: false,
        }
    }

    /// Bytes not yet handed out
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl ByteSource for ReplaySource {
    fn open(&mut self) -> MonitorResult<()> {
        self.data = std::fs::read(&self.path)?;
        self.offset = 0;
        self.last_chunk_at = Some(Instant::now());
        self.open = true;
        log::info!(
            "replaying {} ({} bytes, {}-byte chunks every {:?})",
            self.path.display(),
            self.data.len(),
            self.chunk_size,
            self.interval
        );
        Ok(())
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> MonitorResult<usize> {
        if !self.open {
            return Err(MonitorError::Connection(
                "replay source is not open".to_string(),
            ));
        }
        if self.offset >= self.data.len() {
            return Ok(0);
        }

        let now = Instant::now();
        if let Some(last) = self.last_chunk_at {
            if now.duration_since(last) < self.interval {
                return Ok(0);
            }
        }

        let n = self
            .chunk_size
            .min(self.data.len() - self.offset)
            .min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.offset += n;
        self.last_chunk_at = Some(now);
        Ok(n)
    }

    fn write(&mut self, bytes: &[u8]) -> MonitorResult<()> {
        if !self.open {
            return Err(MonitorError::Connection(
                "replay source is not open".to_string(),
            ));
        }
        // Nowhere to put it; replay is read-only
        log::debug!("replay source ignoring {}-byte write", bytes.len());
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.data.clear();
        self.offset = 0;
    }

    fn describe(&self) -> String {
        format!("replay of {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite;
    use tempfile::NamedTempFile;

    fn replay_file(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_chunks_come_out_in_order() {
        let file = replay_file(b"abcdef");
        let mut source = ReplaySource::new(file.path().to_path_buf(), 4, 0);
        source.open().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
        assert_eq!(source.remaining(), 2);

        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");

        // Exhausted, but still healthy
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 0);
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_interval_gates_each_chunk() {
        let file = replay_file(b"xxyy");
        let mut source = ReplaySource::new(file.path().to_path_buf(), 2, 30);
        source.open().unwrap();

        let mut buf = [0u8; 8];
        // Not yet: the first chunk waits out one interval too
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 0);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 2);
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 0);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 2);
    }

    #[test]
    fn test_small_destination_buffer() {
        let file = replay_file(b"abcd");
        let mut source = ReplaySource::new(file.path().to_path_buf(), 64, 0);
        source.open().unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(source.read_nonblocking(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"d");
    }

    #[test]
    fn test_missing_file_fails_open() {
        let mut source = ReplaySource::new(PathBuf::from("/nonexistent/replay.csv"), 8, 0);
        assert!(source.open().is_err());
    }

    #[test]
    fn test_closed_source_rejects_io() {
        let file = replay_file(b"1,2\n");
        let mut source = ReplaySource::new(file.path().to_path_buf(), 8, 0);
        source.open().unwrap();
        source.close();

        let mut buf = [0u8; 8];
        assert!(source.read_nonblocking(&mut buf).is_err());
        assert!(source.write(b"cmd\n").is_err());
    }

    #[test]
    fn test_writes_are_swallowed_while_open() {
        let file = replay_file(b"1,2\n");
        let mut source = ReplaySource::new(file.path().to_path_buf(), 8, 0);
        source.open().unwrap();
        assert!(source.write(b"cmd\n").is_ok());
    }
}
