// Control surface and task supervision
//
// One controller owns the whole pipeline for at most one connection at
// a time. Each stage is a task around a periodic interval; stages talk
// only through queues and channels. Control operations are all
// fire-and-forget: outcomes come back as status events through the
// registered callback, never as return values.
//
// Sequence bookkeeping for recording lives in the reader task, which
// also owns the framer. Start and stop requests are routed there so the
// captured start/end sequences are exact batch boundaries, and the
// recording sink's final flush is queued on the recorder channel before
// the stop and finalize commands that follow it.

use crate::buffer::{OverflowPolicy, QueueMetrics, RecordQueue};
use crate::config::MonitorConfig;
use crate::fanout::{Multiplexer, SinkConfig, SinkId};
use crate::framing::LineFramer;
use crate::recorder::{Recorder, RecorderCommand, RecordingOutcome};
use crate::source::{create_source, ByteSource, SourceConfig};
use crate::types::PlotFrame;
use crate::window::WindowProcessor;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Status events delivered through the registered callback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MonitorEvent {
    /// Link state changed; `open` mirrors `is_connected`
    PortStatus { open: bool, message: String },

    RecordingStarted { id: String, path: PathBuf },

    RecordingFinished { id: String, outcome: RecordingOutcome },

    /// Command misuse and non-fatal failures
    Error { message: String },
}

type EventCallback = Arc<RwLock<Option<Box<dyn Fn(MonitorEvent) + Send + Sync>>>>;

fn emit_event(events: &EventCallback, event: MonitorEvent) {
    log::debug!("event: {:?}", event);
    if let Some(callback) = events.read().as_ref() {
        callback(event);
    }
}

/// Presentation-side receivers. Created once with the controller and
/// live across reconnects.
pub struct MonitorOutputs {
    /// Ordered raw-record batches for the scrolling log
    pub log: mpsc::UnboundedReceiver<Vec<String>>,

    /// Sliding-window frames for the plot
    pub plot: mpsc::UnboundedReceiver<PlotFrame>,
}

/// Pipeline counters for one live connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Records framed since the connection opened
    pub records_ingested: u64,
    pub emit_queue: QueueMetrics,
    pub display_sink: QueueMetrics,
    pub recording_sink: QueueMetrics,
    pub staging: QueueMetrics,
}

enum PumpCommand {
    Write(Vec<u8>),
    StartRecording { path: PathBuf },
    StopRecording,
}

/// Everything scoped to one connection
struct LinkRuntime {
    cancel: CancellationToken,
    pump_tx: mpsc::UnboundedSender<PumpCommand>,
    resize_tx: mpsc::UnboundedSender<usize>,
    mux: Arc<Multiplexer>,
    display_sink: SinkId,
    recording_sink: SinkId,
    emit_queue: Arc<RecordQueue>,
    staging: Arc<RecordQueue>,
    ingested: Arc<AtomicU64>,
    port_open: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
}

/// Collaborator-facing surface of the acquisition pipeline.
///
/// Must be used from within a tokio runtime; `connect` spawns the
/// pipeline tasks onto it.
pub struct MonitorController {
    config: MonitorConfig,
    events: EventCallback,
    link: Mutex<Option<LinkRuntime>>,
    window_size: Arc<AtomicUsize>,
    log_tx: mpsc::UnboundedSender<Vec<String>>,
    plot_tx: mpsc::UnboundedSender<PlotFrame>,
}

impl MonitorController {
    pub fn new(config: MonitorConfig) -> (Self, MonitorOutputs) {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (plot_tx, plot_rx) = mpsc::unbounded_channel();

        let controller = Self {
            window_size: Arc::new(AtomicUsize::new(config.window_size)),
            config,
            events: Arc::new(RwLock::new(None)),
            link: Mutex::new(None),
            log_tx,
            plot_tx,
        };
        let outputs = MonitorOutputs {
            log: log_rx,
            plot: plot_rx,
        };
        (controller, outputs)
    }

    /// Register the status-event callback. Replaces any previous one.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(MonitorEvent) + Send + Sync + 'static,
    {
        *self.events.write() = Some(Box::new(callback));
    }

    /// Open the source and spin up the pipeline. Success or failure is
    /// reported as a `PortStatus` event.
    pub fn connect(&self, source_config: SourceConfig) {
        let mut link = self.link.lock();
        // A link that failed to open or died on a read error has already
        // cancelled itself; a new connect replaces it.
        let stale = link
            .as_ref()
            .map(|runtime| runtime.cancel.is_cancelled())
            .unwrap_or(false);
        if stale {
            *link = None;
        }
        if link.is_some() {
            emit_event(
                &self.events,
                MonitorEvent::Error {
                    message: "already connected".to_string(),
                },
            );
            return;
        }

        let source = create_source(&source_config);
        let cancel = CancellationToken::new();
        let mux = Arc::new(Multiplexer::new());
        let (pump_tx, pump_rx) = mpsc::unbounded_channel();
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let (recorder_tx, recorder_rx) = mpsc::unbounded_channel();

        let processor = WindowProcessor::new(
            self.window_size.load(Ordering::Relaxed),
            self.config.staging_capacity,
        );
        let staging = processor.intake();

        // Display sink feeds both live consumers: the plot staging queue
        // and the log channel.
        let display_sink = {
            let intake = processor.intake();
            let log_tx = self.log_tx.clone();
            mux.attach_sink(
                SinkConfig {
                    name: "display".to_string(),
                    flush_interval_ms: self.config.display_flush_interval_ms,
                    policy: OverflowPolicy::DropOldest,
                    capacity: self.config.display_queue_capacity,
                    start_active: true,
                },
                Box::new(move |batch| {
                    for record in &batch {
                        intake.push(record.clone());
                    }
                    let _ = log_tx.send(batch);
                }),
            )
        };

        // Recording sink queues straight onto the recorder channel, so
        // its final flush and the stop that follows share one FIFO.
        let recording_sink = {
            let recorder_tx = recorder_tx.clone();
            mux.attach_sink(
                SinkConfig {
                    name: "recording".to_string(),
                    flush_interval_ms: self.config.record_flush_interval_ms,
                    policy: OverflowPolicy::Unbounded,
                    capacity: 0,
                    start_active: false,
                },
                Box::new(move |batch| {
                    let _ = recorder_tx.send(RecorderCommand::Append(batch));
                }),
            )
        };

        let emit_queue = Arc::new(RecordQueue::new(
            OverflowPolicy::DropOldest,
            self.config.emit_queue_capacity,
        ));
        let ingested = Arc::new(AtomicU64::new(0));
        let port_open = Arc::new(AtomicBool::new(false));
        let recording = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_recorder(
            recorder_rx,
            Arc::downgrade(&mux),
            recording_sink,
            Arc::clone(&recording),
            Arc::clone(&self.events),
        ));
        tokio::spawn(run_sink_flusher(
            Arc::clone(&mux),
            display_sink,
            cancel.clone(),
        ));
        tokio::spawn(run_sink_flusher(
            Arc::clone(&mux),
            recording_sink,
            cancel.clone(),
        ));
        tokio::spawn(run_window(
            processor,
            resize_rx,
            self.plot_tx.clone(),
            self.config.window_tick_interval_ms,
            cancel.clone(),
        ));
        tokio::spawn(run_reader(ReaderContext {
            config: self.config.clone(),
            source,
            framer: LineFramer::new(),
            emit_queue: Arc::clone(&emit_queue),
            mux: Arc::clone(&mux),
            recording_sink,
            recorder_tx,
            commands: pump_rx,
            events: Arc::clone(&self.events),
            cancel: cancel.clone(),
            port_open: Arc::clone(&port_open),
            recording: Arc::clone(&recording),
            ingested: Arc::clone(&ingested),
        }));

        *link = Some(LinkRuntime {
            cancel,
            pump_tx,
            resize_tx,
            mux,
            display_sink,
            recording_sink,
            emit_queue,
            staging,
            ingested,
            port_open,
            recording,
        });
    }

    /// Tear the connection down. Any open recording session is stopped
    /// and finalized with the last observed sequence. Idempotent.
    pub fn disconnect(&self) {
        match self.link.lock().take() {
            Some(runtime) => runtime.cancel.cancel(),
            None => log::debug!("disconnect with no active link"),
        }
    }

    /// Queue raw text for the device. Newlines are the caller's choice.
    pub fn send(&self, text: &str) {
        let link = self.link.lock();
        let Some(runtime) = link.as_ref() else {
            emit_event(
                &self.events,
                MonitorEvent::Error {
                    message: "cannot send: not connected".to_string(),
                },
            );
            return;
        };

        if runtime
            .pump_tx
            .send(PumpCommand::Write(text.as_bytes().to_vec()))
            .is_err()
        {
            emit_event(
                &self.events,
                MonitorEvent::Error {
                    message: "cannot send: link is closing".to_string(),
                },
            );
        }
    }

    /// Change the plot window capacity. Applies immediately when
    /// connected and becomes the starting size for later connections.
    pub fn set_window_size(&self, size: usize) {
        if size == 0 {
            emit_event(
                &self.events,
                MonitorEvent::Error {
                    message: "window size must be positive".to_string(),
                },
            );
            return;
        }

        self.window_size.store(size, Ordering::Relaxed);
        if let Some(runtime) = self.link.lock().as_ref() {
            let _ = runtime.resize_tx.send(size);
        }
    }

    /// Begin a recording session into `path`. The session opens in the
    /// reader task so its start sequence is an exact batch boundary.
    pub fn start_recording(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let link = self.link.lock();
        let Some(runtime) = link.as_ref() else {
            emit_event(
                &self.events,
                MonitorEvent::Error {
                    message: "cannot start recording: not connected".to_string(),
                },
            );
            return;
        };
        if runtime.recording.load(Ordering::Acquire) {
            emit_event(
                &self.events,
                MonitorEvent::Error {
                    message: "recording already in progress".to_string(),
                },
            );
            return;
        }

        let _ = runtime.pump_tx.send(PumpCommand::StartRecording { path });
    }

    /// End the current recording session: drain, stop, finalize, and
    /// report the outcome as a `RecordingFinished` event.
    pub fn stop_recording(&self) {
        let link = self.link.lock();
        let Some(runtime) = link.as_ref() else {
            emit_event(
                &self.events,
                MonitorEvent::Error {
                    message: "cannot stop recording: not connected".to_string(),
                },
            );
            return;
        };
        if !runtime.recording.load(Ordering::Acquire) {
            emit_event(
                &self.events,
                MonitorEvent::Error {
                    message: "no recording in progress".to_string(),
                },
            );
            return;
        }

        let _ = runtime.pump_tx.send(PumpCommand::StopRecording);
    }

    /// True once the source is open, false after teardown starts
    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .map(|r| r.port_open.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn is_recording(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .map(|r| r.recording.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn window_size(&self) -> usize {
        self.window_size.load(Ordering::Relaxed)
    }

    /// Counters for the live connection, `None` when disconnected
    pub fn stats(&self) -> Option<MonitorStats> {
        let link = self.link.lock();
        let runtime = link.as_ref()?;
        Some(MonitorStats {
            records_ingested: runtime.ingested.load(Ordering::Relaxed),
            emit_queue: runtime.emit_queue.metrics(),
            display_sink: runtime.mux.sink_metrics(runtime.display_sink)?,
            recording_sink: runtime.mux.sink_metrics(runtime.recording_sink)?,
            staging: runtime.staging.metrics(),
        })
    }
}

impl Drop for MonitorController {
    fn drop(&mut self) {
        if let Some(runtime) = self.link.lock().take() {
            runtime.cancel.cancel();
        }
    }
}

struct ReaderContext {
    config: MonitorConfig,
    source: Box<dyn ByteSource>,
    framer: LineFramer,
    emit_queue: Arc<RecordQueue>,
    mux: Arc<Multiplexer>,
    recording_sink: SinkId,
    recorder_tx: mpsc::UnboundedSender<RecorderCommand>,
    commands: mpsc::UnboundedReceiver<PumpCommand>,
    events: EventCallback,
    cancel: CancellationToken,
    port_open: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    ingested: Arc<AtomicU64>,
}

/// Release all framed-but-unreleased records downstream as one batch
fn flush_emission(emit_queue: &RecordQueue, mux: &Multiplexer) {
    let batch = emit_queue.drain_all();
    if !batch.is_empty() {
        mux.ingest(&batch);
    }
}

/// Stop sequence for a recording session, run inside the reader task:
/// flush in-flight records into the session, capture the end sequence,
/// drain the sink (queued as appends), then stop and finalize. One FIFO
/// channel keeps the drain ahead of the finalize. May race a
/// recorder-side failure; the stop and finalize then land on a closed
/// session and are logged and ignored there.
fn finish_session(
    emit_queue: &RecordQueue,
    mux: &Multiplexer,
    recording_sink: SinkId,
    framer: &LineFramer,
    recorder_tx: &mpsc::UnboundedSender<RecorderCommand>,
    recording: &AtomicBool,
) {
    flush_emission(emit_queue, mux);
    let end_sequence = framer.sequence();
    recording.store(false, Ordering::Release);
    mux.set_sink_active(recording_sink, false);
    let _ = recorder_tx.send(RecorderCommand::Stop { end_sequence });
    let _ = recorder_tx.send(RecorderCommand::Finalize);
}

/// The reader task: polls the source, frames records, and releases them
/// downstream at the emission cadence. Also the serialization point for
/// outbound writes and recording start/stop, so sequence capture is
/// atomic with framing.
async fn run_reader(mut ctx: ReaderContext) {
    if let Err(e) = ctx.source.open() {
        log::error!("source open failed: {}", e);
        emit_event(
            &ctx.events,
            MonitorEvent::PortStatus {
                open: false,
                message: e.to_string(),
            },
        );
        ctx.cancel.cancel();
        return;
    }

    ctx.port_open.store(true, Ordering::Release);
    emit_event(
        &ctx.events,
        MonitorEvent::PortStatus {
            open: true,
            message: format!("Connected to {}.", ctx.source.describe()),
        },
    );

    let mut poll = tokio::time::interval(Duration::from_millis(ctx.config.poll_interval_ms.max(1)));
    let mut emit = tokio::time::interval(Duration::from_millis(ctx.config.emit_interval_ms.max(1)));
    let mut read_buf = vec![0u8; ctx.config.read_chunk_size.max(1)];
    let mut closed_message: Option<String> = None;

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break,

            command = ctx.commands.recv() => match command {
                Some(PumpCommand::Write(bytes)) => {
                    if let Err(e) = ctx.source.write(&bytes) {
                        log::warn!("write failed: {}", e);
                        emit_event(&ctx.events, MonitorEvent::Error {
                            message: format!("Send error: {}", e),
                        });
                    }
                }
                Some(PumpCommand::StartRecording { path }) => {
                    // The shared flag is the only session gate; the
                    // recorder task clears it when a session dies, which
                    // reopens the gate without a reconnect.
                    if ctx.recording.load(Ordering::Acquire) {
                        emit_event(&ctx.events, MonitorEvent::Error {
                            message: "recording already in progress".to_string(),
                        });
                    } else {
                        // Records framed before this point stay out of
                        // the session: release them while the recording
                        // sink is still idle.
                        flush_emission(&ctx.emit_queue, &ctx.mux);
                        let start_sequence = ctx.framer.sequence();
                        ctx.recording.store(true, Ordering::Release);
                        let _ = ctx.recorder_tx.send(RecorderCommand::Start {
                            path,
                            start_sequence,
                        });
                        ctx.mux.set_sink_active(ctx.recording_sink, true);
                    }
                }
                Some(PumpCommand::StopRecording) => {
                    if ctx.recording.load(Ordering::Acquire) {
                        finish_session(
                            &ctx.emit_queue,
                            &ctx.mux,
                            ctx.recording_sink,
                            &ctx.framer,
                            &ctx.recorder_tx,
                            &ctx.recording,
                        );
                    } else {
                        emit_event(&ctx.events, MonitorEvent::Error {
                            message: "no recording in progress".to_string(),
                        });
                    }
                }
                None => break,
            },

            _ = poll.tick() => {
                match ctx.source.read_nonblocking(&mut read_buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        for record in ctx.framer.feed(&read_buf[..n]) {
                            ctx.emit_queue.push(record);
                        }
                        ctx.ingested.store(ctx.framer.sequence(), Ordering::Relaxed);
                    }
                    Err(e) => {
                        // Fatal for the connection; no retry
                        log::error!("read failed: {}", e);
                        closed_message = Some(format!("Read error: {}", e));
                        break;
                    }
                }
            }

            _ = emit.tick() => {
                flush_emission(&ctx.emit_queue, &ctx.mux);
            }
        }
    }

    // Orderly teardown: release the last framed records, then close the
    // session with the last observed sequence before the port goes away.
    flush_emission(&ctx.emit_queue, &ctx.mux);
    if ctx.recording.load(Ordering::Acquire) {
        finish_session(
            &ctx.emit_queue,
            &ctx.mux,
            ctx.recording_sink,
            &ctx.framer,
            &ctx.recorder_tx,
            &ctx.recording,
        );
    }

    ctx.source.close();
    ctx.port_open.store(false, Ordering::Release);
    ctx.cancel.cancel();
    emit_event(
        &ctx.events,
        MonitorEvent::PortStatus {
            open: false,
            message: closed_message.unwrap_or_else(|| "Disconnected.".to_string()),
        },
    );
    log::info!("reader task stopped");
}

/// Periodic flush for one sink
async fn run_sink_flusher(mux: Arc<Multiplexer>, sink: SinkId, cancel: CancellationToken) {
    let interval_ms = mux.sink_flush_interval_ms(sink).unwrap_or(100);
    let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                mux.flush(sink);
            }
        }
    }
}

/// Window processor task: periodic drain/parse plus resize requests
async fn run_window(
    mut processor: WindowProcessor,
    mut resize_rx: mpsc::UnboundedReceiver<usize>,
    plot_tx: mpsc::UnboundedSender<PlotFrame>,
    tick_interval_ms: u64,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            size = resize_rx.recv() => match size {
                Some(size) => {
                    if let Some(frame) = processor.set_window_size(size) {
                        let _ = plot_tx.send(frame);
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                if let Some(frame) = processor.tick() {
                    let _ = plot_tx.send(frame);
                }
            }
        }
    }
    log::debug!("window task stopped");
}

/// Recorder task: consumes appends and control in channel order. Exits
/// when every sender is gone, which happens only after the reader task
/// and the recording sink have queued everything they ever will.
async fn run_recorder(
    mut commands: mpsc::UnboundedReceiver<RecorderCommand>,
    mux: Weak<Multiplexer>,
    recording_sink: SinkId,
    recording: Arc<AtomicBool>,
    events: EventCallback,
) {
    let mut recorder = Recorder::new();

    while let Some(command) = commands.recv().await {
        match command {
            RecorderCommand::Start {
                path,
                start_sequence,
            } => match recorder.start(&path, start_sequence) {
                Ok(info) => emit_event(
                    &events,
                    MonitorEvent::RecordingStarted {
                        id: info.id,
                        path: info.path,
                    },
                ),
                Err(e) => {
                    release_recording(&mux, recording_sink, &recording);
                    emit_event(
                        &events,
                        MonitorEvent::Error {
                            message: format!("Recording failed to start: {}", e),
                        },
                    );
                }
            },
            RecorderCommand::Append(batch) => {
                if !recorder.is_open() {
                    log::warn!(
                        "discarding {} record(s) queued for a closed session",
                        batch.len()
                    );
                    continue;
                }

                let session_id = recorder.session().map(|s| s.id.clone()).unwrap_or_default();
                if let Err(e) = recorder.append(&batch) {
                    release_recording(&mux, recording_sink, &recording);
                    emit_event(
                        &events,
                        MonitorEvent::RecordingFinished {
                            id: session_id,
                            outcome: RecordingOutcome::Error {
                                message: e.to_string(),
                            },
                        },
                    );
                }
            }
            RecorderCommand::Stop { end_sequence } => {
                if let Err(e) = recorder.stop(end_sequence) {
                    log::warn!("stop out of order: {}", e);
                }
            }
            RecorderCommand::Finalize => {
                let session_id = recorder.session().map(|s| s.id.clone()).unwrap_or_default();
                match recorder.finalize() {
                    Ok(outcome) => emit_event(
                        &events,
                        MonitorEvent::RecordingFinished {
                            id: session_id,
                            outcome,
                        },
                    ),
                    Err(e) => log::warn!("finalize out of order: {}", e),
                }
            }
        }
    }

    // Upstream vanished without a stop; close what we have
    if recorder.is_open() {
        let session_id = recorder.session().map(|s| s.id.clone()).unwrap_or_default();
        if let Some(outcome) = recorder.abort("command channel closed before stop") {
            emit_event(
                &events,
                MonitorEvent::RecordingFinished {
                    id: session_id,
                    outcome,
                },
            );
        }
    }
    log::debug!("recorder task stopped");
}

/// A session died under the recorder; deactivate the sink, then clear
/// the shared flag, reopening the reader's session gate. The flag is
/// cleared last: once the gate reads it as open, the old sink state is
/// already settled. Callers run this before emitting the failure event.
fn release_recording(mux: &Weak<Multiplexer>, recording_sink: SinkId, recording: &AtomicBool) {
    if let Some(mux) = mux.upgrade() {
        mux.set_sink_active(recording_sink, false);
    }
    recording.store(false, Ordering::Release);
}
