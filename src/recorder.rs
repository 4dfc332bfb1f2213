// Durable session recording with post-hoc loss detection
//
// The recorder is a plain state machine over one file: Idle ->
// Recording -> StopPending -> Closed(outcome). It never waits on
// upstream buffers. The task loop driving it feeds appends and control
// through one FIFO channel, so the recording sink's final flush is
// always processed before the finalize that follows it.
//
// Verification is independent of what the recorder believes it wrote:
// finalize re-opens the file and counts lines on disk.

use crate::types::{MonitorError, MonitorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Recording session lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RecorderState {
    Idle,
    Recording,
    StopPending,
    Closed(RecordingOutcome),
}

/// How a closed session ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RecordingOutcome {
    /// The file holds exactly the records the sequence span promised
    Verified { records: u64 },

    /// The file disagrees with the sequence span
    LossDetected { expected: u64, actual: u64 },

    /// An I/O failure ended the session
    Error { message: String },
}

impl fmt::Display for RecordingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingOutcome::Verified { records } => {
                write!(f, "verified, {} record(s) on disk", records)
            }
            RecordingOutcome::LossDetected { expected, actual } => {
                write!(
                    f,
                    "loss detected: expected {} record(s), found {}",
                    expected, actual
                )
            }
            RecordingOutcome::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Identity of one session, carried in events and logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub start_sequence: u64,
}

/// Command language of the recorder task. Appends and control share one
/// channel; channel order is processing order.
#[derive(Debug)]
pub enum RecorderCommand {
    Start { path: PathBuf, start_sequence: u64 },
    Append(Vec<String>),
    Stop { end_sequence: u64 },
    Finalize,
}

struct Session {
    info: SessionInfo,
    writer: BufWriter<File>,
    end_sequence: Option<u64>,
    /// File had zero bytes at open; only then may a header be written
    fresh_file: bool,
    wrote_header: bool,
    /// Data lines already in the file at open, excluded from verification
    preexisting_lines: u64,
    /// Pre-existing content ends mid-line; terminate it before writing
    needs_newline: bool,
    records_written: u64,
}

/// Append-only CSV session writer with verification on close
pub struct Recorder {
    state: RecorderState,
    session: Option<Session>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            state: RecorderState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> &RecorderState {
        &self.state
    }

    /// A session is open in Recording and StopPending
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            RecorderState::Recording | RecorderState::StopPending
        )
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref().map(|s| &s.info)
    }

    /// Open `path` for appending, creating it if absent. The header is
    /// not written here; it is derived from the first appended batch and
    /// only if the file was empty. A pre-existing file that ends
    /// mid-line is terminated with a newline before this session's first
    /// record, so the old last line keeps its boundary. An open failure
    /// closes the session as an error, with no retry.
    pub fn start(&mut self, path: &Path, start_sequence: u64) -> MonitorResult<SessionInfo> {
        match self.state {
            RecorderState::Idle | RecorderState::Closed(_) => {}
            _ => {
                return Err(MonitorError::InvalidState(format!(
                    "start_recording while a session is {:?}",
                    self.state
                )))
            }
        }

        let fresh_file = match std::fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };

        let preexisting_lines = if fresh_file {
            0
        } else {
            match count_data_lines(path) {
                Ok(n) => n,
                Err(e) => return Err(self.fail_open(path, e)),
            }
        };

        let needs_newline = if fresh_file {
            false
        } else {
            match ends_with_newline(path) {
                Ok(terminated) => !terminated,
                Err(e) => return Err(self.fail_open(path, e)),
            }
        };

        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => file,
            Err(e) => return Err(self.fail_open(path, e)),
        };

        let info = SessionInfo {
            id: Uuid::new_v4().to_string(),
            path: path.to_path_buf(),
            started_at: Utc::now(),
            start_sequence,
        };

        log::info!(
            "recording session {} started: {} (start sequence {}, {} pre-existing line(s))",
            info.id,
            info.path.display(),
            start_sequence,
            preexisting_lines
        );

        self.session = Some(Session {
            info: info.clone(),
            writer: BufWriter::new(file),
            end_sequence: None,
            fresh_file,
            wrote_header: false,
            preexisting_lines,
            needs_newline,
            records_written: 0,
        });
        self.state = RecorderState::Recording;
        Ok(info)
    }

    /// Write one line per record, then flush to stable storage.
    /// Accepted while Recording and while StopPending (late batches from
    /// the sink's final flush land here). A write failure closes the
    /// session as an error.
    pub fn append(&mut self, batch: &[String]) -> MonitorResult<()> {
        if !self.is_open() {
            return Err(MonitorError::InvalidState(format!(
                "append while {:?}",
                self.state
            )));
        }
        if batch.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.write_batch(batch) {
            let path = self
                .session
                .as_ref()
                .map(|s| s.info.path.display().to_string())
                .unwrap_or_default();
            let message = format!("write to {} failed: {}", path, e);
            log::error!("{}", message);

            self.session = None;
            self.state = RecorderState::Closed(RecordingOutcome::Error {
                message: message.clone(),
            });
            return Err(MonitorError::Recording(message));
        }
        Ok(())
    }

    /// Mark the end of the session's sequence span. The file stays open
    /// for late appends until `finalize`.
    pub fn stop(&mut self, end_sequence: u64) -> MonitorResult<()> {
        if self.state != RecorderState::Recording {
            return Err(MonitorError::InvalidState(format!(
                "stop_recording while {:?}",
                self.state
            )));
        }

        if let Some(session) = self.session.as_mut() {
            session.end_sequence = Some(end_sequence);
            log::info!(
                "recording session {} stop requested (end sequence {})",
                session.info.id,
                end_sequence
            );
        }
        self.state = RecorderState::StopPending;
        Ok(())
    }

    /// Close the file and verify it: re-open read-only, count this
    /// session's data lines and compare against the sequence span. The
    /// session is closed whatever the outcome.
    pub fn finalize(&mut self) -> MonitorResult<RecordingOutcome> {
        if self.state != RecorderState::StopPending {
            return Err(MonitorError::InvalidState(format!(
                "finalize while {:?}",
                self.state
            )));
        }

        let outcome = match self.session.take() {
            Some(session) => close_and_verify(session),
            None => RecordingOutcome::Error {
                message: "no open session to finalize".to_string(),
            },
        };

        match &outcome {
            RecordingOutcome::Verified { records } => {
                log::info!("recording verified: {} record(s) on disk", records)
            }
            RecordingOutcome::LossDetected { expected, actual } => log::warn!(
                "recording loss detected: expected {} record(s), found {}",
                expected,
                actual
            ),
            RecordingOutcome::Error { message } => {
                log::error!("recording finalize failed: {}", message)
            }
        }

        self.state = RecorderState::Closed(outcome.clone());
        Ok(outcome)
    }

    /// Close an open session without verification, for teardown paths
    /// that lost their upstream before a proper stop. Returns `None`
    /// when nothing is open.
    pub fn abort(&mut self, reason: &str) -> Option<RecordingOutcome> {
        if !self.is_open() {
            return None;
        }

        let outcome = RecordingOutcome::Error {
            message: format!("session aborted: {}", reason),
        };
        if let Some(mut session) = self.session.take() {
            let _ = session.writer.flush();
            let _ = session.writer.get_ref().sync_data();
            log::warn!("recording session {} aborted: {}", session.info.id, reason);
        }
        self.state = RecorderState::Closed(outcome.clone());
        Some(outcome)
    }

    fn write_batch(&mut self, batch: &[String]) -> std::io::Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no open session"))?;

        if session.needs_newline {
            // A previous writer left the last line unterminated
            writeln!(session.writer)?;
            session.needs_newline = false;
        }

        if session.fresh_file && !session.wrote_header {
            let fields = batch[0].split(',').count();
            let header = (1..=fields)
                .map(|i| format!("channel{}", i))
                .collect::<Vec<_>>()
                .join(",");
            writeln!(session.writer, "{}", header)?;
            session.wrote_header = true;
        }

        for record in batch {
            writeln!(session.writer, "{}", record)?;
        }

        // Durability over throughput: every batch reaches the disk
        session.writer.flush()?;
        session.writer.get_ref().sync_data()?;
        session.records_written += batch.len() as u64;
        Ok(())
    }

    fn fail_open(&mut self, path: &Path, e: std::io::Error) -> MonitorError {
        let message = format!("failed to open {}: {}", path.display(), e);
        log::error!("{}", message);
        self.session = None;
        self.state = RecorderState::Closed(RecordingOutcome::Error {
            message: message.clone(),
        });
        MonitorError::Recording(message)
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

fn close_and_verify(mut session: Session) -> RecordingOutcome {
    let info = session.info.clone();
    let expected = session
        .end_sequence
        .unwrap_or(info.start_sequence)
        .saturating_sub(info.start_sequence);

    if let Err(e) = session
        .writer
        .flush()
        .and_then(|_| session.writer.get_ref().sync_data())
    {
        return RecordingOutcome::Error {
            message: format!("close of {} failed: {}", info.path.display(), e),
        };
    }
    drop(session.writer);

    let total = match count_data_lines(&info.path) {
        Ok(n) => n,
        Err(e) => {
            return RecordingOutcome::Error {
                message: format!("verification of {} failed: {}", info.path.display(), e),
            }
        }
    };

    let header_lines = if session.wrote_header { 1 } else { 0 };
    let actual = total.saturating_sub(session.preexisting_lines + header_lines);

    if actual == expected {
        RecordingOutcome::Verified { records: actual }
    } else {
        RecordingOutcome::LossDetected { expected, actual }
    }
}

/// True when the file's last byte is a newline; empty files count as
/// terminated
fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Non-empty lines in the file
fn count_data_lines(path: &Path) -> std::io::Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0u64;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn records(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_round_trip_verified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.csv");

        let mut recorder = Recorder::new();
        recorder.start(&path, 100).unwrap();
        recorder.append(&records(&["1,2", "3,4"])).unwrap();
        recorder.append(&records(&["5,6"])).unwrap();
        recorder.stop(103).unwrap();
        let outcome = recorder.finalize().unwrap();

        assert_eq!(outcome, RecordingOutcome::Verified { records: 3 });
        assert_eq!(*recorder.state(), RecorderState::Closed(outcome));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "channel1,channel2\n1,2\n3,4\n5,6\n");
    }

    #[test]
    fn test_header_fields_follow_first_batch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wide.csv");

        let mut recorder = Recorder::new();
        recorder.start(&path, 0).unwrap();
        recorder.append(&records(&["1,2,3,4"])).unwrap();
        recorder.stop(1).unwrap();
        recorder.finalize().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("channel1,channel2,channel3,channel4\n"));
    }

    #[test]
    fn test_no_header_when_appending_to_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.csv");
        std::fs::write(&path, "9,9\n8,8\n").unwrap();

        let mut recorder = Recorder::new();
        recorder.start(&path, 50).unwrap();
        recorder.append(&records(&["3,3"])).unwrap();
        recorder.stop(51).unwrap();
        let outcome = recorder.finalize().unwrap();

        // Pre-existing lines are excluded; only this session is verified
        assert_eq!(outcome, RecordingOutcome::Verified { records: 1 });

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "9,9\n8,8\n3,3\n");
    }

    #[test]
    fn test_resume_terminates_unterminated_last_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.csv");
        // A previous writer died mid-line
        std::fs::write(&path, "9,9\n8,8").unwrap();

        let mut recorder = Recorder::new();
        recorder.start(&path, 20).unwrap();
        recorder.append(&records(&["3,3"])).unwrap();
        recorder.stop(21).unwrap();
        let outcome = recorder.finalize().unwrap();

        // The old partial line keeps its boundary and the new record
        // lands on its own line, so verification still balances
        assert_eq!(outcome, RecordingOutcome::Verified { records: 1 });
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "9,9\n8,8\n3,3\n");
    }

    #[test]
    fn test_loss_detected_when_appends_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lossy.csv");

        let mut recorder = Recorder::new();
        recorder.start(&path, 0).unwrap();
        recorder.append(&records(&["1,2", "3,4"])).unwrap();
        // Claims three records framed, but the last was never appended
        recorder.stop(3).unwrap();
        let outcome = recorder.finalize().unwrap();

        assert_eq!(
            outcome,
            RecordingOutcome::LossDetected {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_append_accepted_while_stop_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.csv");

        let mut recorder = Recorder::new();
        recorder.start(&path, 10).unwrap();
        recorder.append(&records(&["1,2"])).unwrap();
        recorder.stop(12).unwrap();

        // The sink's final flush arrives after stop
        recorder.append(&records(&["3,4"])).unwrap();
        let outcome = recorder.finalize().unwrap();

        assert_eq!(outcome, RecordingOutcome::Verified { records: 2 });
    }

    #[test]
    fn test_empty_session_verifies_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");

        let mut recorder = Recorder::new();
        recorder.start(&path, 7).unwrap();
        recorder.stop(7).unwrap();
        let outcome = recorder.finalize().unwrap();

        assert_eq!(outcome, RecordingOutcome::Verified { records: 0 });

        // No append happened, so no header either
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_open_failure_closes_session_as_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("out.csv");

        let mut recorder = Recorder::new();
        let err = recorder.start(&path, 0);
        assert!(err.is_err());
        assert!(matches!(
            recorder.state(),
            RecorderState::Closed(RecordingOutcome::Error { .. })
        ));

        // A failed session can be superseded by a fresh start
        let good = dir.path().join("out.csv");
        recorder.start(&good, 0).unwrap();
        assert_eq!(*recorder.state(), RecorderState::Recording);
    }

    #[test]
    fn test_invalid_transitions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.csv");
        let mut recorder = Recorder::new();

        assert!(recorder.append(&records(&["1"])).is_err());
        assert!(recorder.stop(1).is_err());
        assert!(recorder.finalize().is_err());

        recorder.start(&path, 0).unwrap();
        // finalize without stop is a caller bug
        assert!(recorder.finalize().is_err());
        // double start while recording is rejected
        assert!(recorder.start(&path, 0).is_err());
    }

    #[test]
    fn test_restart_after_close() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.csv");
        let second = dir.path().join("b.csv");

        let mut recorder = Recorder::new();
        recorder.start(&first, 0).unwrap();
        recorder.append(&records(&["1"])).unwrap();
        recorder.stop(1).unwrap();
        recorder.finalize().unwrap();

        recorder.start(&second, 1).unwrap();
        recorder.append(&records(&["2"])).unwrap();
        recorder.stop(2).unwrap();
        assert_eq!(
            recorder.finalize().unwrap(),
            RecordingOutcome::Verified { records: 1 }
        );
    }

    #[test]
    fn test_abort_closes_without_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abort.csv");

        let mut recorder = Recorder::new();
        recorder.start(&path, 0).unwrap();
        recorder.append(&records(&["1,2"])).unwrap();

        let outcome = recorder.abort("upstream vanished").unwrap();
        assert!(matches!(outcome, RecordingOutcome::Error { .. }));
        assert!(!recorder.is_open());

        // Appended data is still on disk
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("1,2\n"));

        assert!(recorder.abort("again").is_none());
    }
}
