//! Builder pattern for configuring and constructing a [`DemuxController`].
//!
//! # Examples
//!
//! ```no_run
//! use std::fs::File;
//! use std::sync::Arc;
//! use oggdemux::{DemuxBuilder, EventLog, ReadSeekSource};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let file = File::open("movie.ogv")?;
//!     let len = file.metadata()?.len();
//!
//!     let demux = DemuxBuilder::new()
//!         .with_source(ReadSeekSource::new(file, Some(len)))
//!         .with_sink(Arc::new(EventLog::new()))
//!         .with_byte_len(len)
//!         .build()?;
//!
//!     while demux.step()?.is_continue() {}
//!     Ok(())
//! }
//! ```
//!
//! # Settings
//!
//! - `chunk_size` - Bytes requested from the source per read, grows with the pages seen
//! - `seek_give_up_threshold` - How far past the seek point the key frame search may look
//! - `push_bisection_steps` - Upstream byte seeks allowed per time seek in push mode
//! - `push_seek_tolerance` - How far before the target a push mode seek may land
//! - `byte_len` - Total length of the input, overriding what the source reports
//! - `mode` - Random access or streaming operation

use std::time::Duration;

use crate::common::assert_error_traits;
use crate::demux::DemuxController;
use crate::reader::DEFAULT_CHUNK_SIZE;
use crate::sink::Sink;
use crate::source::Source;

/// How the demuxer gets its data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Random access: the file is scanned for chains up front and seeks bisect over it.
    #[default]
    Pull,
    /// Streaming: bytes are pushed in order, seeks are turned into upstream byte seeks.
    Push,
}

/// Demuxer configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Initial read size. Grows to twice the largest page seen.
    pub(crate) chunk_size: u64,

    /// After a bisection, the key frame search stops once pages run this far past the first
    /// timestamp it saw.
    pub(crate) seek_give_up_threshold: Duration,

    /// Upper bound on the byte seeks issued upstream for one push mode seek.
    pub(crate) push_bisection_steps: u32,

    /// A push mode seek is done once it lands at most this far before the target.
    pub(crate) push_seek_tolerance: Duration,

    /// The length of the input in bytes.
    /// Pull mode needs it for chain discovery; push mode uses it to estimate byte offsets.
    pub(crate) byte_len: Option<u64>,

    pub(crate) mode: Mode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            seek_give_up_threshold: Duration::from_secs(3),
            push_bisection_steps: 10,
            push_seek_tolerance: Duration::from_millis(500),
            byte_len: None,
            mode: Mode::Pull,
        }
    }
}

/// Error building a [`DemuxController`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("no source was configured, use `PushOnly` for push mode")]
    NoSource,
    #[error("no sink was configured")]
    NoSink,
}
assert_error_traits!(BuildError);

/// Builder for configuring and creating a demuxer.
#[derive(Clone, Debug)]
#[must_use]
pub struct DemuxBuilder<S, K> {
    source: Option<S>,
    sink: Option<K>,
    settings: Settings,
}

impl<S, K> Default for DemuxBuilder<S, K> {
    fn default() -> Self {
        Self {
            source: None,
            sink: None,
            settings: Settings::default(),
        }
    }
}

impl<S: Source, K: Sink> DemuxBuilder<S, K> {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets where the bytes come from.
    pub fn with_source(mut self, source: S) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets where packets and events go.
    pub fn with_sink(mut self, sink: K) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the initial read size.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.settings.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_seek_give_up_threshold(mut self, threshold: Duration) -> Self {
        self.settings.seek_give_up_threshold = threshold;
        self
    }

    pub fn with_push_bisection_steps(mut self, steps: u32) -> Self {
        self.settings.push_bisection_steps = steps;
        self
    }

    pub fn with_push_seek_tolerance(mut self, tolerance: Duration) -> Self {
        self.settings.push_seek_tolerance = tolerance;
        self
    }

    /// Sets the byte length of the input.
    ///
    /// In pull mode this overrides [`Source::query_length`]. In push mode it is the only way
    /// to learn the length, and seeking needs it.
    pub fn with_byte_len(mut self, byte_len: u64) -> Self {
        self.settings.byte_len = Some(byte_len);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.settings.mode = mode;
        self
    }

    /// Creates the controller.
    pub fn build(self) -> Result<DemuxController<S, K>, BuildError> {
        let source = self.source.ok_or(BuildError::NoSource)?;
        let sink = self.sink.ok_or(BuildError::NoSink)?;
        Ok(DemuxController::new(source, sink, self.settings))
    }
}
