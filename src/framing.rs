// Incremental line framing
//
// Splits an arbitrary chunk stream into whole records. The device hands
// us bytes at whatever granularity the driver produces; record
// boundaries are newlines. At most one partial line is retained between
// calls, so the output is identical no matter how the byte stream was
// chunked.

/// Splits raw device bytes into trimmed, non-empty records and counts
/// them.
///
/// The partial tail is kept as bytes, not text, so a UTF-8 sequence
/// split across two reads is decoded only once the line completes.
/// The sequence counter increments exactly once per emitted record;
/// blank lines are discarded and never counted.
pub struct LineFramer {
    partial: Vec<u8>,
    sequence: u64,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            partial: Vec::new(),
            sequence: 0,
        }
    }

    /// Feed a chunk of device bytes, returning the records completed by
    /// this chunk in arrival order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);

        let mut records = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.partial[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.partial[start..end]);
            let trimmed = line.trim();

            if !trimmed.is_empty() {
                self.sequence += 1;
                records.push(trimmed.to_string());
            }
            start = end + 1;
        }

        self.partial.drain(..start);
        records
    }

    /// Records emitted since construction
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes held back waiting for a newline
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
