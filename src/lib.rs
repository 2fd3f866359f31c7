//! Ogg container demultiplexer.
//!
//! An Ogg file is a sequence of pages, each carrying a piece of one logical stream. Logical
//! streams that start together form a chain, and a file may hold several chains one after the
//! other. This crate turns the pages back into timestamped codec packets for every logical
//! stream, handles the transitions between chains and seeks by time.
//!
//! The demuxer reads through a [`Source`] and delivers to a [`Sink`]:
//!
//! - In **pull mode** the source supports random access. The file is scanned for its chains
//!   first, which gives the total duration and allows seeking by bisection.
//! - In **push mode** bytes arrive in order through
//!   [`DemuxController::push_bytes`]. Seeks are turned into byte seeks for upstream to carry
//!   out, estimated from the skeleton index or the bitrate and refined as data arrives.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use oggdemux::{DemuxBuilder, Event, EventLog, ReadSeekSource, SeekRequest};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let file = File::open("chained.ogg")?;
//!     let demux = DemuxBuilder::new()
//!         .with_source(ReadSeekSource::new(file, None))
//!         .with_sink(Arc::new(EventLog::new()))
//!         .build()?;
//!
//!     demux.step()?;
//!     println!("duration: {:?}", demux.duration());
//!     demux.seek(&SeekRequest::to(Duration::from_secs(30)))?;
//!
//!     while demux.step()?.is_continue() {
//!         for event in demux.sink().take() {
//!             if let Event::Packet(serial, packet) = event {
//!                 println!("{serial:08x}: {:?}", packet.pts);
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `tracing`: log through the `tracing` crate instead of printing warnings to stderr.
//! - `crossbeam-channel`: deliver upstream byte seeks over a crossbeam channel.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod builder;
mod chain;
pub mod codec;
mod common;
mod demux;
pub mod math;
mod packet;
pub mod page;
mod reader;
mod seek;
mod sink;
mod source;
mod stream;

#[cfg(test)]
mod testing;

pub use crate::builder::{BuildError, DemuxBuilder, Mode, Settings};
pub use crate::chain::{Chain, ChainId, ChainRegistry};
pub use crate::codec::{Caps, CodecState, SkeletonIndex};
pub use crate::common::{GranulePos, Serial, GRANULE_UNSET};
pub use crate::demux::{ByteSeek, DemuxController, Error, Flow};
pub use crate::packet::{Packet, PacketOut, Packetizer};
pub use crate::page::Page;
pub use crate::reader::{Boundary, PageReader, PageResult, ReadError, DEFAULT_CHUNK_SIZE};
pub use crate::seek::{SeekError, SeekRequest};
pub use crate::sink::{Event, EventLog, OutputPacket, Segment, Sink, StreamInfo};
pub use crate::source::{PushOnly, ReadSeekSource, Source};
pub use crate::stream::{LogicalStream, StreamMode};
