pub mod buffer;
pub mod config;
pub mod controller;
pub mod fanout;
pub mod framing;
pub mod recorder;
pub mod source;
pub mod types;
pub mod window;

pub use buffer::{OverflowPolicy, QueueMetrics, RecordQueue};
pub use config::MonitorConfig;
pub use controller::{MonitorController, MonitorEvent, MonitorOutputs, MonitorStats};
pub use fanout::{Multiplexer, SinkConfig, SinkDelivery, SinkId};
pub use framing::LineFramer;
pub use recorder::{Recorder, RecorderCommand, RecorderState, RecordingOutcome, SessionInfo};
pub use source::{create_source, ByteSource, SourceConfig};
pub use types::{MonitorError, MonitorResult, PlotFrame};
pub use window::WindowProcessor;
