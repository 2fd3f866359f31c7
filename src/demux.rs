//! Page routing, chain activation and the controller driving them.
//!
//! A [`DemuxController`] owns the demuxing state behind a mutex. The streaming thread feeds it
//! with [`step`](DemuxController::step) in pull mode or
//! [`push_bytes`](DemuxController::push_bytes) in push mode, while any other thread may
//! [`seek`](DemuxController::seek). A flushing seek signals the [`Sink`] first, so the
//! streaming side stops delivering, then takes the locks, moves the reader and signals the end
//! of the flush.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[cfg(feature = "crossbeam-channel")]
use crossbeam_channel::{Receiver, Sender};
#[cfg(not(feature = "crossbeam-channel"))]
use std::sync::mpsc::{Receiver, Sender};

use crate::builder::{DemuxBuilder, Mode, Settings};
use crate::chain::{Chain, ChainId, ChainRegistry};
use crate::codec::{skeleton_reference, SkeletonKind};
use crate::common::{assert_error_traits, log_debug, log_trace, log_warn, Serial};
use crate::math::NANOS_PER_SEC;
use crate::packet::{Packet, PacketOut};
use crate::page::Page;
use crate::reader::{Boundary, PageReader, PageResult, ReadError};
use crate::seek::{PushPhase, PushState, SeekError, SeekRequest};
use crate::sink::{OutputPacket, Segment, Sink, StreamInfo};
use crate::source::Source;
use crate::stream::Preparation;

/// A stream lagging this far behind the playback position gets a gap.
const MAX_STREAM_LAG: u64 = 2 * NANOS_PER_SEC;

/// What the caller should do after handing data to the demuxer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// Every stream is done, or the input is exhausted. A seek restarts playback.
    Eos,
    /// A flushing seek is in progress; try again.
    Flushing,
}

impl Flow {
    pub fn is_continue(self) -> bool {
        self == Flow::Continue
    }
}

/// Errors that stop the demuxer.
///
/// Damaged data never ends up here: broken pages are skipped and streams resynchronized.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("failed to read from the byte source")]
    Io(#[source] Arc<io::Error>),
    #[error("begin-of-stream page of stream {serial:08x} belongs to no known chain")]
    UnknownChain { serial: Serial },
    #[error("no Ogg chains found")]
    NoChains,
    #[error("random access needs the length of the input")]
    LengthUnknown,
    #[error("seek failed")]
    Seek(#[from] SeekError),
}
assert_error_traits!(Error);

impl From<ReadError> for Error {
    fn from(err: ReadError) -> Self {
        Error::Io(err.0)
    }
}

/// A byte position the demuxer wants upstream to deliver data from, in push mode.
///
/// Upstream confirms it by calling [`DemuxController::byte_segment`] with the same `seqnum`
/// before pushing the data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteSeek {
    pub offset: u64,
    pub seqnum: u32,
}

/// Everything the streaming and the seeking side share.
#[derive(Debug)]
pub(crate) struct DemuxState {
    pub(crate) registry: ChainRegistry,
    /// Playback segment over all chains.
    pub(crate) segment: Segment,
    pub(crate) settings: Settings,
    pub(crate) pullmode: bool,
    /// Chains were not scanned yet.
    pub(crate) need_chains: bool,
    /// The building chain resumes a chain after a push mode seek.
    pub(crate) resync: bool,
    /// Segment to announce before the next page.
    pub(crate) newsegment: Option<Segment>,
    /// Chain to activate once a seek is over.
    pub(crate) pending_activation: Option<(ChainId, Segment)>,
    pub(crate) total_time: Option<u64>,
    /// A skeleton index arrived; its offsets may point past the end of the input.
    pub(crate) check_index_overflow: bool,
    /// Bits per second of the current chain.
    pub(crate) bitrate: u64,
    pub(crate) max_packet_size: u64,
    pub(crate) max_page_size: u64,
    pub(crate) byte_length: Option<u64>,
    pub(crate) push: PushState,
    pub(crate) pending_byte_seek: Option<ByteSeek>,
    pub(crate) eos: bool,
}

impl DemuxState {
    pub(crate) fn new(settings: Settings) -> Self {
        let pullmode = settings.mode == Mode::Pull;
        DemuxState {
            registry: ChainRegistry::default(),
            segment: Segment::default(),
            pullmode,
            need_chains: pullmode,
            resync: false,
            newsegment: None,
            pending_activation: None,
            total_time: None,
            check_index_overflow: false,
            bitrate: 0,
            max_packet_size: 0,
            max_page_size: 0,
            byte_length: if pullmode { None } else { settings.byte_len },
            push: PushState::default(),
            pending_byte_seek: None,
            eos: false,
            settings,
        }
    }

    /// Routes a page to its stream. `discont` is set for pages read backwards.
    pub(crate) fn handle_page(&mut self, sink: &dyn Sink, page: &Page, discont: bool) -> Result<Flow, Error> {
        let serial = page.serial();
        self.max_page_size = self.max_page_size.max(page.len() as u64);

        let found = if page.is_begin_of_stream() {
            if let Some(id) = self.registry.find_chain(serial) {
                if let Some(segment) = self.chain_segment(id) {
                    self.activate_chain(sink, id, segment);
                }
                self.registry.find_stream(serial)
            } else if self.pullmode {
                log_warn!("begin-of-stream page of unknown chain, stream {serial:08x}");
                return Err(Error::UnknownChain { serial });
            } else {
                Some(self.building_stream(serial))
            }
        } else {
            self.registry.find_stream(serial)
        };

        match found {
            Some((id, idx)) => {
                if discont {
                    if let Some(stream) = self.registry.stream_mut(id, idx) {
                        stream.current_granule = -1;
                    }
                }
                Ok(self.submit_page(sink, id, idx, page))
            }
            None if !self.pullmode && !self.push.disable_seeking => {
                log_debug!("page of unknown stream {serial:08x}, probably chained, disabling seeking");
                self.push.disable_seeking = true;
                Ok(Flow::Continue)
            }
            None => {
                log_warn!("page of unknown stream {serial:08x}, dropping");
                Ok(Flow::Continue)
            }
        }
    }

    /// Segment for playback entering a scanned chain from its start.
    fn chain_segment(&self, id: ChainId) -> Option<Segment> {
        let chain = self.registry.get(id)?;
        let start = chain.segment_start.unwrap_or(0);
        let time = chain.begin_time.unwrap_or(0);
        Some(Segment {
            start,
            stop: chain.segment_stop,
            time,
            base: self.segment.base + time,
            position: start,
            ..self.segment.clone()
        })
    }

    /// The stream for a begin-of-stream page in push mode, in the chain being built.
    fn building_stream(&mut self, serial: Serial) -> (ChainId, usize) {
        let id = match self.registry.building {
            Some(id) => id,
            None => {
                let mut chain = Chain::new(self.push.byte_offset);
                chain.begin_time = Some(self.segment.position);
                let id = self.registry.insert(chain);
                self.registry.building = Some(id);
                id
            }
        };
        let idx = match self.registry.get_mut(id) {
            Some(chain) => match chain.position(serial) {
                Some(idx) => idx,
                None => chain.new_stream(serial),
            },
            None => 0,
        };
        (id, idx)
    }

    fn submit_page(&mut self, sink: &dyn Sink, id: ChainId, idx: usize, page: &Page) -> Flow {
        if !self.pullmode && !self.handle_push_mode_state(id, idx, page) {
            return Flow::Continue;
        }
        let reverse = self.segment.is_reverse();
        let Some(stream) = self.registry.stream_mut(id, idx) else {
            return Flow::Continue;
        };
        let sparse = stream.codec.is_sparse();
        let outs = stream.submit_page(page, reverse);

        let mut flow = Flow::Continue;
        for out in outs {
            match out {
                PacketOut::Hole => {
                    log_debug!("stream {:08x}: lost data", page.serial());
                    if sparse {
                        if let Some(stream) = self.registry.stream_mut(id, idx) {
                            stream.mark_discont();
                        }
                    } else if let Some(chain) = self.registry.get_mut(id) {
                        chain.mark_discont();
                    }
                }
                PacketOut::Packet(mut packet) => {
                    self.max_packet_size = self.max_packet_size.max(packet.data.len() as u64);
                    let result = self.submit_packet(sink, id, idx, &mut packet);
                    if !result.is_continue() {
                        flow = result;
                    }
                    // activating a chain in push mode drops the previous one
                    if self.registry.stream_mut(id, idx).is_none() {
                        break;
                    }
                }
            }
        }
        flow
    }

    /// Updates codec, timing and skeleton state with a packet. Returns `false` when the packet
    /// is unusable.
    pub(crate) fn absorb_packet(&mut self, id: ChainId, idx: usize, packet: &mut Packet) -> bool {
        let Some(stream) = self.registry.stream_mut(id, idx) else {
            return false;
        };
        let identified = match stream.classify(packet) {
            Ok(identified) => identified,
            Err(err) => {
                log_warn!(
                    "stream {:08x}: invalid granule position {} (granule {}), resetting",
                    stream.serial(),
                    err.granulepos,
                    err.granule
                );
                stream.reset();
                return false;
            }
        };
        if !stream.codec.is_skeleton() {
            return true;
        }
        if identified {
            if let Some(time) = stream.codec.total_time {
                self.total_time = Some(self.total_time.map_or(time, |t| t.max(time)));
            }
            return true;
        }

        let Some((serial, kind)) = skeleton_reference(&packet.data) else {
            return true;
        };
        let fishead = stream.codec.clone();
        let Some(target) = self.registry.get_mut(id).and_then(|c| c.stream_mut(serial)) else {
            log_warn!("skeleton data for unknown stream {serial:08x}");
            return true;
        };
        match kind {
            SkeletonKind::Fisbone => {
                target.codec.add_fisbone(&packet.data);
            }
            SkeletonKind::Index => {
                if target.codec.add_index(&fishead, &packet.data) {
                    self.check_index_overflow = true;
                }
            }
        }
        true
    }

    fn submit_packet(&mut self, sink: &dyn Sink, id: ChainId, idx: usize, packet: &mut Packet) -> Flow {
        if !self.absorb_packet(id, idx, packet) {
            return Flow::Continue;
        }

        if self.registry.building == Some(id) {
            let timed = self
                .registry
                .stream_mut(id, idx)
                .is_some_and(|s| s.start_time.is_some() && s.codec.have_headers);
            if timed {
                self.activate_building(sink, id);
            }
        }

        if self.registry.building == Some(id) {
            if !packet.is_header {
                if let Some(stream) = self.registry.stream_mut(id, idx) {
                    stream.queued.push(packet.clone());
                }
            }
            return Flow::Continue;
        }
        self.chain_peer(sink, id, idx, packet, !self.pullmode)
    }

    /// Activates the building chain once every timed stream knows where it starts.
    fn activate_building(&mut self, sink: &dyn Sink, id: ChainId) {
        let Some(chain) = self.registry.get_mut(id) else {
            return;
        };
        let begin = chain.begin_time.unwrap_or(0);
        let segment = if self.resync {
            let Some(start) = chain.collect_start_time() else {
                return;
            };
            let segment_start = chain.segment_start.unwrap_or(0);
            let time = if segment_start < start {
                start - segment_start + begin
            } else {
                begin
            };
            log_debug!("resynced at {start}, stream time {time}");
            self.resync = false;
            if self.push.phase == PushPhase::Linear {
                // landed on the key frame: decode from here, show from the requested time
                self.push.phase = PushPhase::Playing;
                let target = self.push.original_target;
                Segment {
                    rate: self.push.rate,
                    start: target,
                    stop: self.push.original_stop,
                    time: target,
                    position: target,
                    ..self.segment.clone()
                }
            } else {
                Segment {
                    start,
                    stop: chain.segment_stop,
                    time,
                    position: start,
                    ..self.segment.clone()
                }
            }
        } else {
            if !chain.collect_chain_info() {
                return;
            }
            let start = chain.segment_start.unwrap_or(0);
            Segment {
                start,
                stop: chain.segment_stop,
                time: begin,
                base: self.segment.base + begin,
                position: start,
                ..self.segment.clone()
            }
        };
        self.activate_chain(sink, id, segment);
    }

    /// Prepares a packet of the active chain and hands it to the sink.
    fn chain_peer(&mut self, sink: &dyn Sink, id: ChainId, idx: usize, packet: &Packet, push_headers: bool) -> Flow {
        if !packet.is_header && self.check_index_overflow {
            self.clip_indexes(id);
        }
        let reverse = self.segment.is_reverse();
        let Some(chain) = self.registry.get_mut(id) else {
            return Flow::Continue;
        };
        let begin = chain.begin_time.unwrap_or(0);
        let segment_start = chain.segment_start.unwrap_or(0);
        let Some(stream) = chain.streams.get_mut(idx) else {
            return Flow::Continue;
        };

        let prepared = match stream.prepare(packet, reverse) {
            Preparation::Ready(prepared) => prepared,
            Preparation::Drop => return Flow::Continue,
            Preparation::Invalid(err) => {
                log_warn!(
                    "stream {:08x}: invalid granule position {}, resetting",
                    stream.serial(),
                    err.granulepos
                );
                stream.reset();
                return Flow::Continue;
            }
        };

        if !prepared.header || push_headers {
            let data = packet
                .data
                .get(prepared.payload.clone())
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            sink.push(
                stream.serial(),
                OutputPacket {
                    data,
                    pts: prepared.pts,
                    duration: prepared.duration,
                    offset: prepared.offset,
                    offset_end: prepared.offset_end,
                    discont: prepared.discont,
                    delta_unit: prepared.delta_unit,
                    header: prepared.header,
                    clipping: prepared.clipping,
                },
            );
        }

        if prepared.header || packet.granule_position < 0 || !stream.is_timed() {
            return self.combined_flow();
        }

        let end = stream.codec.end_time_for_granulepos(packet.granule_position);
        let current = end.saturating_sub(segment_start) + begin;
        stream.position = Some(current);
        self.segment.position = current;

        if !prepared.delta_unit {
            let past_stop = self.segment.stop.is_some_and(|stop| current >= stop);
            if (!reverse && past_stop) || (reverse && current <= self.segment.start) {
                log_debug!("stream {:08x} reached the end of the segment", stream.serial());
                stream.is_eos = true;
            }
        }
        self.combined_flow()
    }

    /// Drops skeleton index entries that point past the end of the input.
    fn clip_indexes(&mut self, id: ChainId) {
        self.check_index_overflow = false;
        let Some(length) = self.byte_length else {
            return;
        };
        if self.registry.current != Some(id) {
            return;
        }
        let Some(chain) = self.registry.get_mut(id) else {
            return;
        };
        for stream in &mut chain.streams {
            let discont = stream.discont;
            let serial = stream.serial();
            let Some(index) = &mut stream.codec.index else {
                continue;
            };
            if index.last_offset().is_some_and(|last| last >= length) {
                log_warn!("skeleton index of {:08x} points past the end", serial);
                if discont || !index.clip(length) {
                    stream.codec.index = None;
                }
                stream.codec.total_time = None;
            } else if let Some(time) = stream.codec.total_time {
                self.total_time = Some(self.total_time.map_or(time, |t| t.max(time)));
            }
        }
    }

    /// `Eos` once every exposed stream of the current chain is done.
    fn combined_flow(&self) -> Flow {
        let Some(chain) = self.registry.current.and_then(|id| self.registry.get(id)) else {
            return Flow::Continue;
        };
        let mut added = chain.streams.iter().filter(|s| s.added).peekable();
        if added.peek().is_some() && added.all(|s| s.is_eos) {
            Flow::Eos
        } else {
            Flow::Continue
        }
    }

    /// Makes chain `id` the exposed one: the streams of the previous chain are removed, then
    /// the new streams are added and their headers and queued packets pushed.
    pub(crate) fn activate_chain(&mut self, sink: &dyn Sink, id: ChainId, segment: Segment) {
        if self.registry.current == Some(id) {
            self.push_queued(sink, id);
            return;
        }
        let Some(chain) = self.registry.get(id) else {
            return;
        };
        let indexed = chain.streams.iter().map(|s| s.codec.idx_bitrate).max().unwrap_or(0);
        self.bitrate = if indexed > 0 {
            indexed
        } else {
            chain.streams.iter().map(|s| u64::from(s.codec.bitrate)).sum()
        };
        log_debug!("activating chain at {}, bitrate {}", chain.offset, self.bitrate);

        self.deactivate_current(sink);

        let Some(chain) = self.registry.get_mut(id) else {
            return;
        };
        chain.mark_discont();
        let mut exposed = Vec::new();
        for (idx, stream) in chain.streams.iter_mut().enumerate() {
            if stream.added || stream.codec.is_skeleton() {
                continue;
            }
            let mut caps = stream.caps().clone();
            caps.stream_headers = stream.headers.iter().map(|p| p.data.clone()).collect();
            sink.add_stream(StreamInfo {
                serial: stream.serial(),
                caps,
            });
            stream.added = true;
            exposed.push(idx);
        }

        self.registry.current = Some(id);
        if self.registry.building == Some(id) {
            self.registry.building = None;
        }
        sink.notify_segment(&segment);

        for idx in exposed {
            let headers = self
                .registry
                .stream_mut(id, idx)
                .map(|s| s.headers.clone())
                .unwrap_or_default();
            for header in &headers {
                self.chain_peer(sink, id, idx, header, true);
            }
        }
        self.push_queued(sink, id);
    }

    /// Carries out an activation left by a seek.
    pub(crate) fn activate_pending(&mut self, sink: &dyn Sink) {
        if let Some((id, segment)) = self.pending_activation.take() {
            self.activate_chain(sink, id, segment);
        }
    }

    fn push_queued(&mut self, sink: &dyn Sink, id: ChainId) {
        let count = self.registry.get(id).map_or(0, |c| c.streams.len());
        for idx in 0..count {
            let queued = self
                .registry
                .stream_mut(id, idx)
                .map(|s| std::mem::take(&mut s.queued))
                .unwrap_or_default();
            for packet in &queued {
                self.chain_peer(sink, id, idx, packet, true);
            }
        }
    }

    fn deactivate_current(&mut self, sink: &dyn Sink) {
        let Some(old) = self.registry.current.take() else {
            return;
        };
        if let Some(chain) = self.registry.get_mut(old) {
            for stream in chain.streams.iter_mut().filter(|s| s.added) {
                sink.remove_stream(stream.serial());
                stream.added = false;
                stream.is_eos = false;
            }
        }
        // push mode chains are never visited again
        if !self.pullmode {
            self.registry.remove(old);
        }
    }

    /// Forgets timing of the current chain and rebuilds it from the next pages, after a push
    /// mode seek.
    pub(crate) fn reset_streams(&mut self) {
        let Some(id) = self.registry.current else {
            return;
        };
        if let Some(chain) = self.registry.get_mut(id) {
            for stream in &mut chain.streams {
                stream.start_time = None;
                stream.codec.accumulated_granule = 0;
                stream.current_granule = -1;
                stream.keyframe_granule = -1;
                stream.push_sync_time = None;
            }
            chain.mark_discont();
        }
        self.registry.building = Some(id);
        self.registry.current = None;
        self.resync = true;
    }

    /// Sends gaps for exposed streams lagging far behind the playback position.
    fn sync_streams(&mut self, sink: &dyn Sink) {
        if self.segment.is_reverse() {
            return;
        }
        let now = self.segment.position;
        let Some(chain) = self.registry.current.and_then(|id| self.registry.get_mut(id)) else {
            return;
        };
        for stream in chain.streams.iter_mut().filter(|s| s.added && !s.is_eos) {
            let Some(position) = stream.position else {
                continue;
            };
            if now > position + MAX_STREAM_LAG {
                log_trace!("stream {:08x} lags by {}", stream.serial(), now - position);
                sink.notify_gap(stream.serial(), position, now - position);
                stream.position = Some(now);
            }
        }
    }

    /// Upstream announces that data now comes from `offset`.
    fn handle_byte_segment<S: Source>(&mut self, reader: &mut PageReader<S>, offset: u64, seqnum: u32) {
        log_debug!("byte segment at {offset}, seqnum {seqnum}");
        self.push.byte_offset = offset;
        self.push.last_seek_offset = offset;
        reader.seek_to(offset);

        if self.push.seqnum == seqnum && self.push.phase != PushPhase::Playing {
            let (rate, target, stop, flush) = (
                self.push.rate,
                self.push.original_target,
                self.push.original_stop,
                self.push.flush,
            );
            self.segment.do_seek(rate, target, stop, flush);
            if !flush && self.registry.current.is_some() {
                self.reset_streams();
            }
        }
        if self.push.drop_until == Some(seqnum) {
            self.push.drop_until = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn channel() -> (Sender<ByteSeek>, Receiver<ByteSeek>) {
    #[cfg(not(feature = "crossbeam-channel"))]
    let (tx, rx) = {
        use std::sync::mpsc;
        mpsc::channel()
    };

    #[cfg(feature = "crossbeam-channel")]
    let (tx, rx) = {
        use crossbeam_channel::unbounded;
        unbounded()
    };
    (tx, rx)
}

/// Demultiplexes an Ogg stream into packets for a [`Sink`].
///
/// Build one with [`DemuxBuilder`]. The controller can be shared between the streaming thread
/// and the thread issuing seeks.
pub struct DemuxController<S, K> {
    state: Mutex<DemuxState>,
    reader: Mutex<PageReader<S>>,
    sink: K,
    flushing: AtomicBool,
    /// Bumped by every seek: pages read before it are stale.
    epoch: AtomicU64,
    upstream_tx: Sender<ByteSeek>,
    upstream_rx: Mutex<Option<Receiver<ByteSeek>>>,
}

impl<S: Source, K: Sink> DemuxController<S, K> {
    pub(crate) fn new(source: S, sink: K, settings: Settings) -> Self {
        let reader = PageReader::new(source, settings.byte_len, settings.chunk_size);
        let (upstream_tx, upstream_rx) = channel();
        DemuxController {
            state: Mutex::new(DemuxState::new(settings)),
            reader: Mutex::new(reader),
            sink,
            flushing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            upstream_tx,
            upstream_rx: Mutex::new(Some(upstream_rx)),
        }
    }

    pub fn builder() -> DemuxBuilder<S, K> {
        DemuxBuilder::new()
    }

    /// The sink packets are delivered to.
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Demuxes one page in pull mode.
    ///
    /// The first call scans the file for chains. The source is read without holding the state
    /// lock, so seeks from other threads are never blocked on I/O.
    pub fn step(&self) -> Result<Flow, Error> {
        if self.flushing.load(Ordering::SeqCst) {
            return Ok(Flow::Flushing);
        }

        let scan = {
            let state = lock(&self.state);
            if state.eos {
                return Ok(Flow::Eos);
            }
            state.need_chains.then(|| state.settings.clone())
        };
        if let Some(settings) = scan {
            self.scan_chains(settings)?;
        }

        let (reverse, epoch) = {
            let state = lock(&self.state);
            (state.segment.is_reverse(), self.epoch.load(Ordering::SeqCst))
        };

        let read = {
            let mut reader = lock(&self.reader);
            let read = if reverse {
                read_backward(&mut *reader)?
            } else {
                read_forward(&mut *reader)?
            };
            if let Some(page) = &read {
                reader.update_chunk_size(page);
            }
            read
        };

        let mut state = lock(&self.state);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            log_debug!("dropping page read before a seek");
            return Ok(Flow::Continue);
        }
        let Some(page) = read else {
            log_debug!("reached the end of the input");
            state.eos = true;
            self.sink.notify_eos();
            return Ok(Flow::Eos);
        };

        if let Some(segment) = state.newsegment.take() {
            self.sink.notify_segment(&segment);
        }
        let flow = state.handle_page(&self.sink, &page, reverse)?;
        state.sync_streams(&self.sink);
        if flow == Flow::Eos {
            state.eos = true;
            self.sink.notify_eos();
        }
        Ok(flow)
    }

    /// Finds the chains on a state of its own, holding only the reader lock, and installs it.
    fn scan_chains(&self, settings: Settings) -> Result<(), Error> {
        let mut scanned = DemuxState::new(settings);
        {
            let mut reader = lock(&self.reader);
            scanned.find_chains(&mut *reader)?;
            scanned.need_chains = false;
            scanned.perform_seek_pull(&mut *reader, None)?;
        }

        let mut state = lock(&self.state);
        if state.need_chains {
            *state = scanned;
            state.activate_pending(&self.sink);
        }
        Ok(())
    }

    /// Hands bytes received from upstream to the demuxer, in push mode.
    ///
    /// While a seek waits for upstream to deliver from the new position, data is dropped.
    pub fn push_bytes(&self, data: &[u8]) -> Result<Flow, Error> {
        let mut state = lock(&self.state);
        if state.push.drop_until.is_some() {
            log_trace!("dropping {} bytes while seeking", data.len());
            return Ok(Flow::Continue);
        }
        if state.eos {
            return Ok(Flow::Eos);
        }

        let mut reader = lock(&self.reader);
        reader.feed(data);
        let mut flow = Flow::Continue;
        while let Some((offset, page)) = reader.next_buffered() {
            state.push.byte_offset = offset + page.len() as u64;
            if let Some(segment) = state.newsegment.take() {
                self.sink.notify_segment(&segment);
            }
            let result = state.handle_page(&self.sink, &page, false)?;

            if let Some(seek) = state.pending_byte_seek.take() {
                self.send_upstream(seek);
                // everything buffered comes from before the seek
                let offset = reader.offset();
                reader.seek_to(offset);
                break;
            }
            state.sync_streams(&self.sink);
            if !result.is_continue() {
                flow = result;
                break;
            }
        }

        if flow == Flow::Eos {
            state.eos = true;
            self.sink.notify_eos();
        }
        Ok(flow)
    }

    /// Upstream has no more data, in push mode.
    pub fn end_of_stream(&self) {
        let mut state = lock(&self.state);
        if !state.eos {
            state.eos = true;
            self.sink.notify_eos();
        }
    }

    /// Moves playback to another time.
    ///
    /// In pull mode the reader is positioned before this returns. In push mode a [`ByteSeek`]
    /// is sent to [`upstream_seeks`](Self::upstream_seeks); more may follow while the landing
    /// position is refined. On failure playback carries on where it was.
    pub fn seek(&self, request: &SeekRequest) -> Result<(), SeekError> {
        {
            let state = lock(&self.state);
            if state.pullmode && state.registry.is_empty() {
                log_debug!("no chains to seek in");
                return Err(SeekError::NoChain);
            }
            if !state.pullmode {
                drop(state);
                return self.seek_push(request);
            }
        }

        if request.flush {
            self.sink.flush_start();
            self.flushing.store(true, Ordering::SeqCst);
        }

        let mut state = lock(&self.state);
        let mut reader = lock(&self.reader);
        let result = state.perform_seek_pull(&mut *reader, Some(request));
        drop(reader);
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if request.flush {
            self.flushing.store(false, Ordering::SeqCst);
            self.sink.flush_stop();
        }
        if result.is_ok() {
            state.eos = false;
            state.activate_pending(&self.sink);
        }
        result
    }

    fn seek_push(&self, request: &SeekRequest) -> Result<(), SeekError> {
        let mut state = lock(&self.state);
        let chunk = lock(&self.reader).chunk_size();
        let seek = state.perform_seek_push(request, chunk)?;

        if request.flush {
            self.sink.flush_start();
        }
        self.send_upstream(seek);
        if request.flush {
            state.reset_streams();
            self.sink.flush_stop();
        }
        state.eos = false;
        Ok(())
    }

    fn send_upstream(&self, seek: ByteSeek) {
        log_debug!("asking upstream for offset {}, seqnum {}", seek.offset, seek.seqnum);
        if self.upstream_tx.send(seek).is_err() {
            log_warn!("nobody listens for upstream seeks");
        }
    }

    /// Upstream confirms it delivers data from `offset` on, in push mode.
    ///
    /// `seqnum` is the one of the [`ByteSeek`] being answered, or any other value when
    /// upstream moved on its own.
    pub fn byte_segment(&self, offset: u64, seqnum: u32) {
        let mut state = lock(&self.state);
        let mut reader = lock(&self.reader);
        state.handle_byte_segment(&mut *reader, offset, seqnum);
    }

    /// Upstream could not carry out the last [`ByteSeek`]. Seeking is disabled from then on.
    pub fn upstream_seek_failed(&self) {
        let mut state = lock(&self.state);
        log_warn!("upstream seek failed, disabling seeking");
        state.push.phase = PushPhase::Playing;
        state.push.disable_seeking = true;
        state.push.drop_until = None;
    }

    /// Receiver of the byte seeks meant for upstream. Can be taken once.
    pub fn upstream_seeks(&self) -> Option<Receiver<ByteSeek>> {
        lock(&self.upstream_rx).take()
    }

    /// Total playing time, once known.
    pub fn duration(&self) -> Option<Duration> {
        lock(&self.state).total_time.map(Duration::from_nanos)
    }

    /// Time of the last packet delivered, while a chain is exposed.
    pub fn position(&self) -> Option<Duration> {
        let state = lock(&self.state);
        state.registry.current?;
        Some(Duration::from_nanos(state.segment.position))
    }
}

fn read_forward<S: Source>(reader: &mut PageReader<S>) -> Result<Option<Page>, ReadError> {
    if reader.length().is_some_and(|len| reader.offset() >= len) {
        return Ok(None);
    }
    match reader.next_page(Boundary::Unbounded)? {
        PageResult::Page { page, .. } => Ok(Some(page)),
        PageResult::BoundaryReached | PageResult::Eof => Ok(None),
    }
}

fn read_backward<S: Source>(reader: &mut PageReader<S>) -> Result<Option<Page>, ReadError> {
    if reader.offset() == 0 {
        return Ok(None);
    }
    match reader.prev_page()? {
        PageResult::Page { offset, page } => {
            // the next read goes on from in front of this page
            reader.seek_to(offset);
            Ok(Some(page))
        }
        PageResult::BoundaryReached | PageResult::Eof => Ok(None),
    }
}
