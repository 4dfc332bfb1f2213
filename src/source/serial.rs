// Serial port byte source
//
// Thin wrapper over tokio-serial's SerialStream. The stream registers
// with the runtime's reactor on open, so `open` must run inside the
// runtime; the reader task does exactly that.

use super::ByteSource;
use crate::types::{MonitorError, MonitorResult};
use std::io::ErrorKind;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

// Bounded spin for a full kernel write buffer before giving up
const WRITE_STALL_LIMIT: u32 = 32;

pub struct SerialSource {
    port: String,
    baud_rate: u32,
    stream: Option<SerialStream>,
}

impl SerialSource {
    pub fn new(port: String, baud_rate: u32) -> Self {
        Self {
            port,
            baud_rate,
            stream: None,
        }
    }
}

impl ByteSource for SerialSource {
    fn open(&mut self) -> MonitorResult<()> {
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .open_native_async()
            .map_err(|e| {
                MonitorError::Connection(format!("failed to open {}: {}", self.port, e))
            })?;

        log::info!("opened {} at {} baud", self.port, self.baud_rate);
        self.stream = Some(stream);
        Ok(())
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> MonitorResult<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(MonitorError::Connection(
                "serial port is not open".to_string(),
            ));
        };

        match stream.try_read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(MonitorError::Connection(format!(
                "read from {} failed: {}",
                self.port, e
            ))),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> MonitorResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(MonitorError::Connection(
                "serial port is not open".to_string(),
            ));
        };

        let mut written = 0;
        let mut stalls = 0;
        while written < bytes.len() {
            match stream.try_write(&bytes[written..]) {
                Ok(n) => {
                    written += n;
                    stalls = 0;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    stalls += 1;
                    if stalls > WRITE_STALL_LIMIT {
                        return Err(MonitorError::Connection(format!(
                            "write to {} stalled after {} bytes",
                            self.port, written
                        )));
                    }
                    std::thread::yield_now();
                }
                Err(e) => {
                    return Err(MonitorError::Connection(format!(
                        "write to {} failed: {}",
                        self.port, e
                    )));
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            log::info!("closed {}", self.port);
        }
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud_rate)
    }
}
