//! Locating the bytes that hold a playback time.
//!
//! In pull mode the whole file is scanned for chains once, and seeks bisect the byte range of
//! the chain that contains the target, then step back to the earliest key frame any stream
//! needs. In push mode the demuxer cannot read where it wants: it estimates a byte offset,
//! asks upstream to go there, and refines the estimate from the time of the page it lands on.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{Chain, ChainId};
use crate::common::{assert_error_traits, log_debug, log_trace, log_warn, Serial, GRANULE_UNSET};
use crate::demux::{ByteSeek, DemuxState, Error};
use crate::math::{nanos, scale, NANOS_PER_SEC};
use crate::packet::PacketOut;
use crate::page::Page;
use crate::reader::{Boundary, PageReader, PageResult, ReadError};
use crate::sink::Segment;
use crate::source::Source;

/// Bits per byte, scaled to nanoseconds, for bitrate conversions.
const BITS_NANOS: u64 = 8 * NANOS_PER_SEC;

/// Error returned when a seek cannot be carried out.
///
/// Demuxing continues from where it was before the seek.
#[derive(Debug, thiserror::Error, Clone)]
pub enum SeekError {
    #[error("no chain is known yet")]
    NoChain,
    #[error("the input cannot be seeked")]
    NotSeekable,
    #[error("ran out of data before reaching the seek target")]
    Exhausted,
    #[error("failed to read from the byte source")]
    Io(#[source] Arc<io::Error>),
    #[error("seeking is not possible right now")]
    Unsupported,
}
assert_error_traits!(SeekError);

impl From<ReadError> for SeekError {
    fn from(err: ReadError) -> Self {
        SeekError::Io(err.0)
    }
}

/// A request to continue playback from another time.
#[derive(Clone, Debug, PartialEq)]
pub struct SeekRequest {
    /// Playback rate; negative plays backwards.
    pub rate: f64,
    pub start: Duration,
    pub stop: Option<Duration>,
    /// Decode from the key frame but only output from `start`.
    pub accurate: bool,
    /// Move the segment start to the key frame the seek landed on.
    pub key_unit: bool,
    /// Discard data in flight and restart the running time.
    pub flush: bool,
}

impl Default for SeekRequest {
    fn default() -> Self {
        SeekRequest {
            rate: 1.0,
            start: Duration::ZERO,
            stop: None,
            accurate: false,
            key_unit: false,
            flush: true,
        }
    }
}

impl SeekRequest {
    /// A flushing forward seek to `start`.
    pub fn to(start: Duration) -> Self {
        SeekRequest {
            start,
            ..SeekRequest::default()
        }
    }
}

/// Byte and time range of a bisection.
#[derive(Clone, Copy, Debug)]
struct Window {
    begin: u64,
    end: u64,
    begin_time: u64,
    end_time: u64,
}

/// Reads the next page that starts before `end`.
fn next_before<S: Source>(reader: &mut PageReader<S>, end: u64) -> Result<PageResult, ReadError> {
    match end.checked_sub(reader.offset()) {
        Some(left) if left > 0 => reader.next_page(Boundary::Bytes(left)),
        _ => Ok(PageResult::BoundaryReached),
    }
}

impl DemuxState {
    /// Scans the whole file for its chains and the time span of each.
    pub(crate) fn find_chains<S: Source>(&mut self, reader: &mut PageReader<S>) -> Result<(), Error> {
        let length = reader
            .length()
            .filter(|&len| len > 0)
            .ok_or(Error::LengthUnknown)?;
        self.byte_length = Some(length);
        log_debug!("file length {length}");

        reader.seek_to(0);
        let first = self.read_chain(reader)?.ok_or(Error::NoChains)?;

        // If the last page belongs to the first chain, the file is not chained.
        reader.seek_to(length);
        let last = match reader.prev_page()? {
            PageResult::Page { page, .. } => page,
            PageResult::BoundaryReached | PageResult::Eof => {
                log_debug!("can't get last page");
                self.registry.remove(first);
                return Err(Error::NoChains);
            }
        };
        let chained = self
            .registry
            .get(first)
            .is_some_and(|chain| !chain.has_stream(last.serial()));
        let searched = if chained { 0 } else { length };
        self.bisect_forward_serialno(reader, searched, length, first)?;

        self.collect_info();
        Ok(())
    }

    /// Finds where each chain ends by bisecting on serial numbers, starting with chain `id`
    /// known to extend at least up to `searched`.
    fn bisect_forward_serialno<S: Source>(
        &mut self,
        reader: &mut PageReader<S>,
        mut searched: u64,
        end: u64,
        mut id: ChainId,
    ) -> Result<(), Error> {
        loop {
            let mut end_searched = end;
            let mut next = end;

            // guards against garbage between the last page of a chain and the first of the next
            while searched < end_searched {
                let bisect = if end_searched - searched < reader.chunk_size() {
                    searched
                } else {
                    searched + (end_searched - searched) / 2
                };
                reader.seek_to(bisect);
                match reader.next_page(Boundary::Unbounded)? {
                    PageResult::Page { offset, page } => {
                        let ours = self
                            .registry
                            .get(id)
                            .is_some_and(|chain| chain.has_stream(page.serial()));
                        if ours {
                            searched = offset + page.len() as u64;
                        } else {
                            end_searched = bisect;
                            next = offset;
                        }
                    }
                    PageResult::BoundaryReached | PageResult::Eof => end_searched = bisect,
                }
            }

            log_trace!("current chain ends at {searched}");
            if let Some(chain) = self.registry.get_mut(id) {
                chain.end_offset = Some(searched);
            }
            self.read_end_chain(reader, id)?;
            self.registry.append(id);

            reader.seek_to(next);
            match self.read_chain(reader)? {
                Some(next_id) if searched < end => {
                    searched = reader.offset();
                    id = next_id;
                }
                Some(next_id) => {
                    self.registry.remove(next_id);
                    return Ok(());
                }
                None => {
                    log_trace!("no next chain");
                    return Ok(());
                }
            }
        }
    }

    /// Reads the begin-of-stream pages at the reader position into a new chain, then enough
    /// pages to learn the start time of each stream.
    ///
    /// Returns `None` when there is no chain at the position.
    fn read_chain<S: Source>(&mut self, reader: &mut PageReader<S>) -> Result<Option<ChainId>, Error> {
        let offset = reader.offset();
        log_trace!("reading chain at {offset}");
        let mut id = None;

        let mut page = loop {
            let page = match reader.next_page(Boundary::Unbounded)? {
                PageResult::Page { page, .. } => page,
                PageResult::BoundaryReached | PageResult::Eof => {
                    log_debug!("reached the end while reading begin-of-stream pages");
                    if let Some(id) = id {
                        self.registry.remove(id);
                    }
                    return Ok(None);
                }
            };
            if !page.is_begin_of_stream() {
                if id.is_none() {
                    log_warn!("no chain found, no Ogg data in stream?");
                    return Ok(None);
                }
                break page;
            }

            let chain_id = *id.get_or_insert_with(|| self.registry.insert(Chain::new(offset)));
            let Some(chain) = self.registry.get_mut(chain_id) else {
                return Ok(None);
            };
            if chain.has_stream(page.serial()) {
                log_warn!("found serial {:08x} begin-of-stream page twice, ignoring", page.serial());
                continue;
            }
            let idx = chain.new_stream(page.serial());
            self.scan_page(chain_id, idx, &page);
        };

        let Some(id) = id else {
            return Ok(None);
        };
        if let Some(chain) = self.registry.get_mut(id) {
            chain.have_bos = true;
        }

        // Pages of a serial outside the chain send the reader back to this offset.
        let data_offset = reader.offset();
        loop {
            let Some(chain) = self.registry.get(id) else {
                break;
            };
            let Some(idx) = chain.position(page.serial()) else {
                log_trace!("unknown serial {:08x}", page.serial());
                reader.seek_to(data_offset);
                break;
            };
            self.scan_page(id, idx, &page);

            let Some(chain) = self.registry.get(id) else {
                break;
            };
            let stream = &chain.streams[idx];
            // a stream that ends before its start time is known leaves no way to find it
            let hopeless = stream.is_timed() && stream.start_time.is_none() && page.is_end_of_stream();
            let done = chain
                .streams
                .iter()
                .filter(|s| s.is_timed())
                .all(|s| s.start_time.is_some());
            if hopeless || done {
                break;
            }

            page = match reader.next_page(Boundary::Unbounded)? {
                PageResult::Page { page, .. } => page,
                PageResult::BoundaryReached | PageResult::Eof => break,
            };
        }
        log_trace!("done reading chain");
        Ok(Some(id))
    }

    /// Submits a page read while scanning: packets only update codec and timing state.
    fn scan_page(&mut self, id: ChainId, idx: usize, page: &Page) {
        let Some(stream) = self.registry.stream_mut(id, idx) else {
            return;
        };
        for out in stream.submit_page(page, false) {
            if let PacketOut::Packet(mut packet) = out {
                self.absorb_packet(id, idx, &mut packet);
            }
        }
    }

    /// Finds the time of the last page of chain `id` by reading backwards from its end.
    fn read_end_chain<S: Source>(&mut self, reader: &mut PageReader<S>, id: ChainId) -> Result<(), Error> {
        let Some(chain) = self.registry.get_mut(id) else {
            return Ok(());
        };
        let end = chain.end_offset.unwrap_or(chain.offset);
        let mut begin = end;
        let mut last = None;

        loop {
            begin = begin.saturating_sub(reader.chunk_size());
            reader.seek_to(begin);

            // the last page found is not necessarily the final one, keep reading up to the end
            while reader.offset() < end {
                let page = match next_before(reader, end)? {
                    PageResult::Page { page, .. } => page,
                    PageResult::BoundaryReached | PageResult::Eof => break,
                };
                let Some(idx) = chain.position(page.serial()) else {
                    continue;
                };
                let codec = &chain.streams[idx].codec;
                if codec.is_skeleton() || codec.is_unknown() {
                    continue;
                }
                if page.granule_position() != GRANULE_UNSET {
                    last = Some((idx, page.granule_position()));
                }
            }
            if last.is_some() || begin == 0 {
                break;
            }
        }

        chain.segment_stop =
            last.map(|(idx, granulepos)| chain.streams[idx].codec.end_time_for_granulepos(granulepos));
        log_debug!("chain at {}: segment stop {:?}", chain.offset, chain.segment_stop);
        Ok(())
    }

    /// Lays the chains out on one timeline and sums up the duration.
    fn collect_info(&mut self) {
        let mut total = 0;
        for id in self.registry.chains().to_vec() {
            let Some(chain) = self.registry.get_mut(id) else {
                continue;
            };
            chain.begin_time = Some(total);
            chain.collect_chain_info();
            total += chain.total_time.unwrap_or(0);
        }
        self.total_time = Some(total);
        self.segment.duration = Some(total);
    }

    /// Bisects `window` of chain `id` for the last page that ends before `target`, and leaves
    /// the reader on it. Only pages of `only_serial` count when given.
    ///
    /// Returns the offset of that page, or the window start when every page is past the
    /// target.
    fn do_binary_search<S: Source>(
        &mut self,
        reader: &mut PageReader<S>,
        id: ChainId,
        window: Window,
        target: u64,
        only_serial: Option<Serial>,
    ) -> Result<u64, SeekError> {
        let chunk = reader.chunk_size();
        let Window {
            mut begin,
            mut end,
            mut begin_time,
            mut end_time,
        } = window;
        let mut best = begin;
        log_debug!("chain offset {begin}, end offset {end}, target {target}");

        while begin < end {
            let mut bisect = if end - begin < chunk || end_time <= begin_time {
                begin
            } else {
                // interpolate over the window, assuming a constant bitrate
                let guess = (i128::from(target) - i128::from(begin_time)) * i128::from(end - begin)
                    / i128::from(end_time - begin_time)
                    + i128::from(begin)
                    - i128::from(chunk);
                guess.clamp(i128::from(begin), i128::from(end - 1)) as u64
            };
            log_trace!("bisect {begin} < {bisect} < {end}, time {begin_time} < {target} < {end_time}");
            reader.seek_to(bisect);

            while begin < end {
                let (offset, page) = match next_before(reader, end)? {
                    PageResult::Page { offset, page } => (offset, page),
                    PageResult::Eof => return Err(SeekError::Exhausted),
                    PageResult::BoundaryReached => {
                        if bisect <= begin + 1 {
                            end = begin;
                        } else {
                            bisect = bisect.saturating_sub(chunk).max(begin + 1);
                            reader.seek_to(bisect);
                        }
                        continue;
                    }
                };

                let granulepos = page.granule_position();
                if granulepos == GRANULE_UNSET || only_serial.is_some_and(|s| s != page.serial()) {
                    continue;
                }
                let Some(chain) = self.registry.get_mut(id) else {
                    return Err(SeekError::NoChain);
                };
                let chain_begin = chain.begin_time.unwrap_or(0);
                let Some(stream) = chain.stream_mut(page.serial()) else {
                    continue;
                };
                if stream.codec.is_skeleton() || stream.codec.is_unknown() {
                    continue;
                }
                let Some(start_time) = stream.start_time else {
                    continue;
                };
                let time = stream.codec.end_time_for_granulepos(granulepos);
                if time < start_time {
                    continue;
                }
                let time = time - start_time + chain_begin;
                log_trace!("found page at {offset} with time {time}");

                if time < target {
                    best = offset;
                    begin = reader.offset();
                    begin_time = time;
                    bisect = begin;
                } else if bisect <= begin + 1 {
                    end = begin;
                } else if end == reader.offset() {
                    end = offset;
                    bisect = bisect.saturating_sub(chunk).max(begin + 1);
                    reader.seek_to(bisect);
                } else {
                    end = offset;
                    end_time = time;
                    break;
                }
            }
        }

        log_debug!("seeking to {best}");
        reader.seek_to(best);
        Ok(best)
    }

    /// Positions the reader for playback from `segment.position` and returns the chain that
    /// holds it.
    ///
    /// After bisecting to the target, the pages that follow are read once per stream to learn
    /// where its last key frame before the target is; the earliest of those is bisected to in
    /// turn so every stream can decode from its first packet.
    pub(crate) fn do_seek<S: Source>(
        &mut self,
        reader: &mut PageReader<S>,
        segment: &mut Segment,
        key_unit: bool,
    ) -> Result<ChainId, SeekError> {
        let position = segment.position;
        let reverse = segment.is_reverse();

        let mut total = self.total_time.unwrap_or(0);
        let mut found = None;
        for &id in self.registry.chains().iter().rev() {
            let chain_total = self.registry.get(id).and_then(Chain::total_time).unwrap_or(0);
            total = total.saturating_sub(chain_total);
            found = Some(id);
            if position >= total {
                break;
            }
        }
        let id = found.ok_or(SeekError::NoChain)?;
        let chain = self.registry.get(id).ok_or(SeekError::NoChain)?;

        let begin_time = chain.begin_time.unwrap_or(0);
        let window = Window {
            begin: chain.offset,
            end: chain.end_offset.ok_or(SeekError::NotSeekable)?,
            begin_time,
            end_time: begin_time + chain.total_time.unwrap_or(0),
        };
        let target = (position + begin_time).saturating_sub(total);
        let mut pending = chain.streams.iter().filter(|s| s.is_timed()).count();
        log_debug!("find keyframes for {pending}/{} streams", chain.streams.len());

        let mut best = self.do_binary_search(reader, id, window, target, None)?;

        let threshold = nanos(self.settings.seek_give_up_threshold);
        let mut keytarget = target;
        let mut key_serial = None;
        let mut first_time = None;
        while pending > 0 {
            let page = match next_before(reader, window.end)? {
                PageResult::Page { page, .. } => page,
                PageResult::BoundaryReached => break,
                PageResult::Eof => return Err(SeekError::Exhausted),
            };
            let Some(stream) = self
                .registry
                .get_mut(id)
                .and_then(|chain| chain.stream_mut(page.serial()))
            else {
                continue;
            };
            if !stream.is_timed() {
                continue;
            }
            let granulepos = page.granule_position();
            if granulepos == GRANULE_UNSET || granulepos == 0 {
                continue;
            }

            // Streams with long holes (one ending early) must not make us read forever.
            let time = stream.codec.end_time_for_granulepos(granulepos);
            let first = *first_time.get_or_insert(time);
            if time.saturating_sub(first) > threshold {
                log_warn!("no key frame data found within {threshold} ns, giving up");
                key_serial = None;
                keytarget = target;
                break;
            }

            let start_time = stream.start_time.unwrap_or(0);
            // in reverse, go past the page with the lower timestamp
            if reverse && (time + begin_time).saturating_sub(start_time) < target {
                continue;
            }
            if stream.keyframe_granule != GRANULE_UNSET {
                continue;
            }

            stream.keyframe_granule = stream.codec.key_granule(granulepos);
            let keyframe_time =
                (stream.codec.granule_to_time(stream.keyframe_granule) + begin_time).saturating_sub(start_time);
            log_trace!(
                "stream {:08x} key frame at {keyframe_time}, target {keytarget}",
                stream.serial()
            );
            if keyframe_time < keytarget {
                key_serial = Some(stream.serial());
                keytarget = keyframe_time;
            }
            pending -= 1;
        }

        if !reverse {
            match key_serial {
                Some(serial) if keytarget != target => {
                    log_debug!("final seek to key frame at {keytarget}");
                    self.do_binary_search(reader, id, window, keytarget, Some(serial))?;
                }
                _ => {
                    if key_serial.is_none() {
                        best = window.begin;
                    }
                    reader.seek_to(best);
                }
            }
        }

        if key_unit {
            if !reverse {
                segment.time = keytarget;
            }
            segment.position = keytarget;
        }
        Ok(id)
    }

    /// Looks the target up in the skeleton indexes of chain `id`.
    ///
    /// Returns the lowest keypoint offset over all indexed streams, with its time.
    pub(crate) fn do_index_search(&self, id: ChainId, begin_time: u64, target: u64) -> Option<(u64, u64)> {
        let target = target.saturating_sub(begin_time);
        self.registry
            .get(id)?
            .streams
            .iter()
            .filter_map(|stream| stream.codec.search_index(target))
            .min_by_key(|&(offset, _)| offset)
    }

    /// Seeks in pull mode and prepares the segment for the chain it lands in.
    ///
    /// Without a request this starts playback from the beginning. When the target cannot be
    /// reached the reader goes back to where it was and the error is returned.
    ///
    /// Landing in another chain leaves its activation in `pending_activation`, to be carried
    /// out once the flush is over.
    pub(crate) fn perform_seek_pull<S: Source>(
        &mut self,
        reader: &mut PageReader<S>,
        request: Option<&SeekRequest>,
    ) -> Result<(), SeekError> {
        let saved_offset = reader.offset();
        let saved_segment = self.segment.clone();
        let key_unit = request.is_some_and(|r| r.key_unit);
        if let Some(request) = request {
            self.segment.do_seek(
                request.rate,
                nanos(request.start),
                request.stop.map(nanos),
                request.flush,
            );
        }
        log_debug!("segment start {}, stop {:?}", self.segment.start, self.segment.stop);

        for chain in self.registry.iter_mut() {
            chain.reset();
        }

        let mut segment = self.segment.clone();
        let id = match self.do_seek(reader, &mut segment, key_unit) {
            Ok(id) => id,
            Err(err) => {
                log_warn!("seek failed: {err}");
                reader.seek_to(saved_offset);
                self.segment = saved_segment;
                if let Some(chain) = self.registry.current.and_then(|id| self.registry.get_mut(id)) {
                    chain.mark_discont();
                }
                return Err(err);
            }
        };
        self.segment = segment;

        let Some(chain) = self.registry.get(id) else {
            return Err(SeekError::NoChain);
        };
        // segment values cover all chains, move them inside this one
        let begin_time = chain.begin_time.unwrap_or(0);
        let segment_start = chain.segment_start.unwrap_or(0);
        let start = self.segment.start.saturating_sub(begin_time) + segment_start;
        let stop = self.segment.stop.or(self.segment.duration).map(|stop| {
            let stop = stop.saturating_sub(begin_time) + segment_start;
            chain.segment_stop.map_or(stop, |chain_stop| stop.min(chain_stop))
        });
        let position = self.segment.position.saturating_sub(begin_time) + segment_start;

        let mut out = self.segment.clone();
        out.position = position;
        if out.is_reverse() {
            out.start = start;
            out.stop = Some(position);
        } else {
            out.start = position;
            out.stop = stop;
        }

        if self.registry.current != Some(id) {
            self.pending_activation = Some((id, out));
        } else {
            if let Some(chain) = self.registry.get_mut(id) {
                chain.mark_discont();
            }
            // sent by the streaming side before the next page
            self.newsegment = Some(out);
        }
        Ok(())
    }

    /// Starts a push mode seek: estimates where `request.start` is in the input and returns
    /// the byte seek to send upstream.
    pub(crate) fn perform_seek_push(&mut self, request: &SeekRequest, chunk: u64) -> Result<ByteSeek, SeekError> {
        let Some(id) = self.registry.current else {
            log_warn!("no chain to seek on");
            return Err(SeekError::NoChain);
        };
        if self.push.disable_seeking {
            log_debug!("seeking disabled");
            return Err(SeekError::NotSeekable);
        }
        if self.push.phase != PushPhase::Playing {
            log_debug!("already seeking, try again later");
            return Err(SeekError::Unsupported);
        }
        let Some(length) = self.byte_length.filter(|&len| len > 0) else {
            return Err(SeekError::NotSeekable);
        };

        let start = nanos(request.start);
        let time_length = self.total_time.filter(|&t| t > 0);
        let best = match self.do_index_search(id, 0, start) {
            Some((offset, time)) => {
                log_debug!("index gave offset {offset} for time {time}");
                offset
            }
            None => {
                let bitrate = if let Some(time_length) = time_length {
                    scale(length, BITS_NANOS, time_length)
                } else if self.push.time_offset > 0 {
                    scale(self.push.byte_offset, BITS_NANOS, self.push.time_offset)
                } else if self.bitrate > 0 {
                    self.bitrate
                } else {
                    // the bisection improves on this once it has a first landing
                    1000
                };
                scale(start, bitrate, BITS_NANOS)
            }
        };
        // step back by about one page so we land in front of the target
        let best = best.saturating_sub(chunk).min(length - 1);

        let push = &mut self.push;
        push.offset0 = 0;
        push.offset1 = length - 1;
        push.time0 = push.start_time.unwrap_or(0);
        push.time1 = time_length;
        push.seqnum = push.seqnum.wrapping_add(1).max(1);
        push.target = start;
        push.prev_seek_time = None;
        push.original_target = start;
        push.original_stop = request.stop.map(nanos);
        push.rate = request.rate;
        push.accurate = request.accurate;
        push.flush = request.flush;
        push.phase = PushPhase::Bisect;
        push.secant = false;
        push.undershot = false;
        push.steps = 1;
        push.drop_until = Some(push.seqnum);
        let seqnum = push.seqnum;
        log_debug!(
            "bisecting {} - {} for {start}, first guess {best}",
            push.offset0,
            push.offset1
        );

        if request.flush {
            if let Some(chain) = self.registry.get_mut(id) {
                for stream in &mut chain.streams {
                    stream.push_sync_time = None;
                }
            }
        }
        Ok(ByteSeek { offset: best, seqnum })
    }

    /// Looks at a page arriving in push mode while a seek refines its landing position.
    ///
    /// Returns `false` when the page must not be submitted. A further byte seek, if needed,
    /// is left in `pending_byte_seek`.
    pub(crate) fn handle_push_mode_state(&mut self, id: ChainId, idx: usize, page: &Page) -> bool {
        let granulepos = page.granule_position();
        let Some(stream) = self.registry.stream_mut(id, idx) else {
            return false;
        };
        let typed = stream.mode() == crate::stream::StreamMode::Streaming && !stream.codec.is_unknown();
        if granulepos >= 0 && typed {
            if self.push.start_time.is_none() {
                self.push.start_time = stream.codec.start_time_for_granulepos(granulepos);
                log_debug!("stream start time {:?}", self.push.start_time);
            }
            self.push.time_offset = stream.codec.end_time_for_granulepos(granulepos);
        }

        if self.push.phase != PushPhase::Bisect {
            return true;
        }
        // sync on real granule positions only
        if granulepos < 0 || !typed {
            stream.absorb_page(page);
            return false;
        }

        let time = stream.codec.end_time_for_granulepos(granulepos);
        stream.push_sync_time.get_or_insert(time);
        let sync_time = self
            .registry
            .building
            .and_then(|building| self.registry.get(building))
            .and_then(Chain::collect_sync_time);
        let Some(sync_time) = sync_time else {
            log_trace!("not enough timing info collected for sync, waiting for more");
            if let Some(stream) = self.registry.stream_mut(id, idx) {
                stream.absorb_page(page);
            }
            return false;
        };

        let push = &mut self.push;
        push.last_seek_time = sync_time;
        log_debug!(
            "bisection seeked at {}, time {sync_time}, target {}",
            push.last_seek_offset,
            push.target
        );
        // open ended: no bisection possible, pretend the landing was good
        let quality = if push.time1.is_some() {
            push.seek_quality()
        } else {
            1.0
        };
        push.prev_seek_time = Some(push.last_seek_time);
        push.setup_bounds();
        let best = push.estimate_target(quality, self.max_packet_size, self.max_page_size, self.bitrate);
        let close_enough = push.close_enough(nanos(self.settings.push_seek_tolerance), self.max_packet_size);
        let out_of_steps = push.steps >= self.settings.push_bisection_steps;

        if close_enough || best == push.last_seek_offset || out_of_steps {
            if push.accurate {
                log_debug!("seek to key frame done, skipping to {}", push.original_target);
                push.phase = PushPhase::Linear;
            } else {
                log_debug!("seek to key frame done, playing");
                push.phase = PushPhase::Playing;
            }
            log_debug!("push seek took {} steps", push.steps);
            return push.phase == PushPhase::Playing;
        }

        push.steps += 1;
        push.drop_until = Some(push.seqnum);
        let seek = ByteSeek {
            offset: best,
            seqnum: push.seqnum,
        };
        if let Some(chain) = self.registry.building.and_then(|b| self.registry.get_mut(b)) {
            for stream in &mut chain.streams {
                stream.push_sync_time = None;
                stream.reset();
            }
        }
        log_debug!("seeking to {}", seek.offset);
        self.pending_byte_seek = Some(seek);
        false
    }
}

/// Progress of a seek in push mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum PushPhase {
    #[default]
    Playing,
    /// Refining the landing position with byte seeks.
    Bisect,
    /// Landed on the key frame; data flows but the segment starts at the requested time.
    Linear,
}

/// Push mode seeking state.
///
/// The byte window `offset0..offset1` spans times `time0..time1`; every landing narrows it on
/// the side of the target it fell on.
#[derive(Debug, Default)]
pub(crate) struct PushState {
    pub(crate) phase: PushPhase,
    /// Set once a second chain shows up: byte estimates over chained input are meaningless.
    pub(crate) disable_seeking: bool,
    /// Byte offset of the data being received.
    pub(crate) byte_offset: u64,
    /// Time of the latest page with a granule position.
    pub(crate) time_offset: u64,
    pub(crate) start_time: Option<u64>,
    pub(crate) offset0: u64,
    pub(crate) offset1: u64,
    pub(crate) time0: u64,
    pub(crate) time1: Option<u64>,
    pub(crate) target: u64,
    pub(crate) original_target: u64,
    pub(crate) original_stop: Option<u64>,
    pub(crate) rate: f64,
    pub(crate) accurate: bool,
    pub(crate) flush: bool,
    pub(crate) last_seek_offset: u64,
    pub(crate) last_seek_time: u64,
    pub(crate) prev_seek_time: Option<u64>,
    /// The last estimate came from the secant rather than a blend with the midpoint.
    pub(crate) secant: bool,
    pub(crate) undershot: bool,
    pub(crate) steps: u32,
    pub(crate) seqnum: u32,
    /// Data is dropped until upstream confirms the byte seek with this number.
    pub(crate) drop_until: Option<u32>,
}

impl PushState {
    /// How well the last estimate did: 1 for a perfect landing, towards 0 when the error
    /// dwarfs the distance moved.
    pub(crate) fn seek_quality(&self) -> f32 {
        let Some(prev) = self.prev_seek_time else {
            return 1.0;
        };
        let diff = self.target.abs_diff(self.last_seek_time);
        let dist = self.last_seek_time.abs_diff(prev);
        if dist == 0 {
            0.0
        } else {
            1.0 / (1.0 + diff as f32 / dist as f32)
        }
    }

    /// Moves the bound on the side of the target the last landing fell on.
    pub(crate) fn setup_bounds(&mut self) {
        if self.last_seek_time >= self.target {
            log_trace!("overshot by {}", self.last_seek_time - self.target);
            self.offset1 = self.last_seek_offset;
            self.time1 = Some(self.last_seek_time);
            self.undershot = false;
        } else {
            log_trace!("undershot by {}", self.target - self.last_seek_time);
            self.offset0 = self.last_seek_offset;
            self.time0 = self.last_seek_time;
            self.undershot = true;
        }
    }

    /// Next byte offset to try, interpolated over the current window.
    pub(crate) fn estimate_target(&mut self, quality: f32, max_packet: u64, max_page: u64, bitrate: u64) -> u64 {
        let along = self.target.saturating_sub(self.time0);
        let mut best = match self.time1 {
            None => {
                let bitrate = if self.last_seek_time == self.start_time.unwrap_or(0) {
                    if bitrate > 0 {
                        bitrate
                    } else {
                        1000
                    }
                } else {
                    scale(
                        self.last_seek_offset,
                        BITS_NANOS,
                        self.last_seek_time.saturating_sub(self.start_time.unwrap_or(0)),
                    )
                };
                self.secant = true;
                i128::from(self.offset0) + i128::from(scale(along, bitrate, BITS_NANOS))
            }
            Some(time1) if time1 == self.time0 => i128::from(self.offset0),
            Some(time1) => {
                let bitrate = scale(
                    self.offset1.saturating_sub(self.offset0),
                    BITS_NANOS,
                    time1.saturating_sub(self.time0),
                );
                let secant = i128::from(self.offset0) + i128::from(scale(along, bitrate, BITS_NANOS));
                if quality < 0.5 && self.secant {
                    // a bad landing gives up to a quarter of the weight to plain bisection
                    let mid = (self.offset0 + self.offset1) / 2;
                    let weight = 1.0 - f64::from((0.5 - quality) / 0.5) * 0.25;
                    self.secant = false;
                    (secant as f64 * weight + mid as f64 * (1.0 - weight)) as i128
                } else {
                    self.secant = true;
                    secant
                }
            }
        };

        // aim early enough to catch the start of the page we want, unless we keep undershooting
        if !self.undershot {
            best -= i128::from(max_packet.max(max_page));
        }

        let (low, high) = (i128::from(self.offset0), i128::from(self.offset1));
        let margin = i128::from(max_packet);
        if best > high - margin {
            best = high - margin;
        } else if best < low + margin {
            best = low + margin;
        }
        best.clamp(low, high.max(low)) as u64
    }

    /// Whether the last landing is good enough to start playing from.
    pub(crate) fn close_enough(&self, tolerance: u64, max_packet: u64) -> bool {
        if self.target == 0 {
            return self.last_seek_time == 0;
        }
        let threshold = tolerance.min(self.target);
        let byte_threshold = max_packet.max(64 * 1024);
        self.last_seek_time < self.target
            && (self.last_seek_time >= self.target - threshold
                || self.offset1 <= self.offset0 + byte_threshold)
    }
}
