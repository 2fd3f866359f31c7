//! One logical stream: the pages of a single serial number, turned into timestamped packets.

use std::collections::VecDeque;
use std::ops::Range;

use crate::codec::{ogm_prefix_len, Caps, CodecState};
use crate::common::{log_debug, log_trace, log_warn, GranulePos, Serial, GRANULE_UNSET};
use crate::math::units_to_nanos;
use crate::packet::{Packet, PacketOut, Packetizer};
use crate::page::Page;

/// Whether the codec of a stream is known yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// No packet was submitted yet.
    Initializing,
    /// The first packet selected a codec (possibly the unknown one).
    Streaming,
}

/// A granule position that cannot be mapped to a granule. The stream has to be reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InvalidGranule {
    pub(crate) granulepos: GranulePos,
    pub(crate) granule: i64,
}

/// Timing and flags computed for a packet about to leave the demuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Prepared {
    /// Part of the packet data that is payload.
    pub(crate) payload: Range<usize>,
    pub(crate) pts: Option<u64>,
    pub(crate) duration: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) offset_end: GranulePos,
    pub(crate) delta_unit: bool,
    pub(crate) header: bool,
    pub(crate) discont: bool,
    /// Samples to drop at the start and end of the decoded packet.
    pub(crate) clipping: Option<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Preparation {
    Ready(Prepared),
    /// Not for output: a codec-private header, no timestamp yet, or the stream is not exposed.
    Drop,
    Invalid(InvalidGranule),
}

/// Pages of one serial number, reassembled into packets and timed through its codec.
#[derive(Debug)]
pub struct LogicalStream {
    serial: Serial,
    mode: StreamMode,
    packetizer: Packetizer,
    pub(crate) codec: CodecState,
    /// Granule at the end of the last packet, `-1` while unknown.
    pub(crate) current_granule: i64,
    pub(crate) prev_granule: i64,
    pub(crate) keyframe_granule: i64,
    /// Time of the first sample of the stream.
    pub(crate) start_time: Option<u64>,
    /// Header packets, collected before the first data packet.
    pub(crate) headers: Vec<Packet>,
    /// Data packets waiting for their chain to become active.
    pub(crate) queued: Vec<Packet>,
    /// Continued pages read backwards, waiting for the page before them.
    continued: VecDeque<Page>,
    pub(crate) discont: bool,
    pub(crate) added: bool,
    pub(crate) is_eos: bool,
    pub(crate) position: Option<u64>,
    need_header_flag: bool,
    /// First page time seen while bisecting in push mode.
    pub(crate) push_sync_time: Option<u64>,
}

impl LogicalStream {
    pub(crate) fn new(serial: Serial) -> Self {
        let mut stream = LogicalStream {
            serial,
            mode: StreamMode::Initializing,
            packetizer: Packetizer::new(serial),
            codec: CodecState::default(),
            current_granule: GRANULE_UNSET,
            prev_granule: GRANULE_UNSET,
            keyframe_granule: GRANULE_UNSET,
            start_time: None,
            headers: Vec::new(),
            queued: Vec::new(),
            continued: VecDeque::new(),
            discont: false,
            added: false,
            is_eos: false,
            position: None,
            need_header_flag: false,
            push_sync_time: None,
        };
        stream.mark_discont();
        stream
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn codec(&self) -> &CodecState {
        &self.codec
    }

    pub fn caps(&self) -> &Caps {
        self.codec.caps()
    }

    pub fn start_time(&self) -> Option<u64> {
        self.start_time
    }

    pub fn current_granule(&self) -> i64 {
        self.current_granule
    }

    /// Whether the stream counts for chain timing: skeleton, sparse and unknown streams do not.
    pub(crate) fn is_timed(&self) -> bool {
        !self.codec.is_skeleton() && !self.codec.is_sparse() && !self.codec.is_unknown()
    }

    /// Forgets framing and granule tracking. Headers and start time survive.
    pub(crate) fn reset(&mut self) {
        log_debug!("stream {:08x}: reset", self.serial);
        self.packetizer.reset();
        self.continued.clear();
        self.position = None;
        self.forget_granule();
        self.is_eos = false;
    }

    fn forget_granule(&mut self) {
        self.current_granule = GRANULE_UNSET;
        self.prev_granule = GRANULE_UNSET;
        self.keyframe_granule = GRANULE_UNSET;
    }

    pub(crate) fn mark_discont(&mut self) {
        self.discont = true;
        self.codec.mark_discont();
    }

    /// Feeds a page without taking packets out.
    ///
    /// The packets stay buffered in the packetizer and come out with the next
    /// [`submit_page`](Self::submit_page).
    pub(crate) fn absorb_page(&mut self, page: &Page) -> bool {
        if !self.page_in(page) {
            return false;
        }
        self.setup_first_granule(page);
        true
    }

    fn page_in(&mut self, page: &Page) -> bool {
        match self.packetizer.page_in(page) {
            Ok(()) => true,
            Err(err) => {
                log_warn!("stream {:08x} choked on page: {err}, resetting", self.serial);
                self.reset();
                false
            }
        }
    }

    /// Feeds a page and returns the packets it completes, in stream order.
    ///
    /// When reading backwards, continued pages are kept until the page before them arrives;
    /// the packet spanning both is then completed from the buffered pages.
    pub(crate) fn submit_page(&mut self, page: &Page, reverse: bool) -> Vec<PacketOut> {
        let mut continued = false;
        if reverse {
            continued = page.is_continued();
            // A page that is not continued starts at least one packet, even if none ends here.
            let packets = match page.packets() {
                0 if !continued => 1,
                n => n,
            };
            if packets == 0 {
                log_trace!("stream {:08x}: no decodable packets, need a previous page", self.serial);
                self.continued.push_front(page.clone());
                return Vec::new();
            }
        }

        if !self.page_in(page) {
            return Vec::new();
        }
        if !reverse && self.packetizer.pending().any(|out| matches!(out, PacketOut::Hole)) {
            // packets went missing, the granule restarts from this page
            log_debug!("stream {:08x}: lost data, granule unknown", self.serial);
            self.forget_granule();
            self.codec.mark_discont();
        }
        if self.current_granule == GRANULE_UNSET {
            self.setup_first_granule(page);
        }
        let mut out = self.take_packets(None);

        if !self.continued.is_empty() {
            while let Some(next) = self.continued.pop_front() {
                if !self.page_in(&next) {
                    return out;
                }
            }
            out.extend(self.take_packets(Some(1)));
            // the rest was already delivered when these pages were read
            self.packetizer.drain();
        }

        if continued {
            self.continued.push_front(page.clone());
        }
        out
    }

    fn take_packets(&mut self, limit: Option<usize>) -> Vec<PacketOut> {
        let mut out = Vec::new();
        let mut calls = 0;
        while limit.is_none_or(|limit| calls < limit) {
            calls += 1;
            match self.packetizer.packet_out() {
                None => break,
                Some(PacketOut::Packet(packet)) if packet.granule_position < GRANULE_UNSET => {
                    log_warn!(
                        "stream {:08x}: invalid granule position {}, resetting",
                        self.serial,
                        packet.granule_position
                    );
                    self.reset();
                    break;
                }
                Some(item) => out.push(item),
            }
        }
        out
    }

    /// Derives the granule at the start of a page from its granule position, by subtracting
    /// the durations of the packets completed on it.
    fn setup_first_granule(&mut self, page: &Page) {
        if self.current_granule != GRANULE_UNSET {
            return;
        }
        let granulepos = page.granule_position();
        if granulepos <= 0 {
            return;
        }
        let mut granule = self.codec.granulepos_to_granule(granulepos);
        let packets = page.packets();
        if packets == 0 {
            log_warn!("stream {:08x}: page completes no packet but has a granule", self.serial);
            return;
        }

        // Durations may depend on the previous packet; measuring must not disturb that.
        let saved = self.codec.codec.clone();
        let mut counted = 0;
        let mut valid = true;
        // A hole in front is a continued packet after a seek.
        let pending = self
            .packetizer
            .pending()
            .skip_while(|out| matches!(out, PacketOut::Hole));
        for out in pending.take(packets) {
            match out {
                PacketOut::Hole => {
                    valid = false;
                    break;
                }
                PacketOut::Packet(packet) => {
                    granule -= self.codec.packet_duration(&packet.data);
                    counted += 1;
                }
            }
        }
        self.codec.codec = saved;

        if counted < packets {
            log_warn!(
                "stream {:08x}: short read getting {packets} packets off first page",
                self.serial
            );
            valid = false;
        }
        if valid {
            // negative values mean samples to clip at the start
            self.current_granule = granule.max(0);
            log_debug!(
                "stream {:08x}: starting with granule {}",
                self.serial,
                self.current_granule
            );
        }
    }

    /// Runs codec identification and header bookkeeping for a packet, and sets
    /// `packet.is_header`.
    ///
    /// Returns `true` when this packet identified the codec.
    pub(crate) fn classify(&mut self, packet: &mut Packet) -> Result<bool, InvalidGranule> {
        let mut identified = false;
        if self.mode == StreamMode::Initializing {
            if !self.codec.setup(&packet.data) {
                log_warn!("stream {:08x}: unknown codec", self.serial);
            }
            self.mode = StreamMode::Streaming;
            identified = true;
        }
        if self.codec.is_unknown() {
            packet.is_header = false;
            self.codec.have_headers = true;
            return Ok(identified);
        }

        let granule = self.codec.granulepos_to_granule(packet.granule_position);
        if granule > 0 {
            self.current_granule = granule;
        } else if granule < GRANULE_UNSET {
            return Err(InvalidGranule {
                granulepos: packet.granule_position,
                granule,
            });
        }

        // restart header counting, headers may be re-sent after a seek or chain scan
        if packet.is_begin_of_stream {
            self.codec.n_header_packets_seen = 0;
            if !self.codec.have_headers {
                self.headers.clear();
            }
        }

        packet.is_header = self.codec.is_header(&packet.data);
        if packet.is_header {
            self.codec.n_header_packets_seen += 1;
            if !self.codec.have_headers {
                self.headers.push(packet.clone());
            }
            return Ok(identified);
        }

        self.codec.have_headers = true;
        if self.start_time.is_none() {
            let duration = self.codec.packet_duration(&packet.data);
            if duration != -1 {
                self.codec.accumulated_granule += duration;
            }

            if packet.granule_position != GRANULE_UNSET {
                let granule = self.codec.granulepos_to_granule(packet.granule_position);
                if granule < 0 {
                    return Err(InvalidGranule {
                        granulepos: packet.granule_position,
                        granule,
                    });
                }
                let start_granule = (granule - self.codec.accumulated_granule).max(0);
                let start_time = self.codec.granule_to_time(start_granule);
                log_debug!(
                    "stream {:08x}: start time {start_time} from granule {granule}, accumulated {}",
                    self.serial,
                    self.codec.accumulated_granule
                );
                self.start_time = Some(start_time);
            } else {
                packet.granule_position = self.codec.granule_to_granulepos(
                    self.codec.accumulated_granule + self.current_granule,
                    self.keyframe_granule,
                );
            }
        }
        Ok(identified)
    }

    /// Computes timestamps and flags for a classified packet and advances the granule
    /// tracking.
    ///
    /// Data packets are dropped until a granule is known, so the first packet after a seek
    /// always carries a timestamp. In `reverse` playback they pass without timestamps instead.
    pub(crate) fn prepare(&mut self, packet: &Packet, reverse: bool) -> Preparation {
        let data = &packet.data;
        let mut offset = 0;
        let mut len = data.len();
        let delta_unit;

        if self.codec.is_unknown() {
            if !self.added {
                return Preparation::Drop;
            }
            return Preparation::Ready(Prepared {
                payload: 0..len,
                pts: None,
                duration: None,
                offset: None,
                offset_end: GRANULE_UNSET,
                delta_unit: false,
                header: false,
                discont: std::mem::take(&mut self.discont),
                clipping: None,
            });
        }

        if self.codec.is_ogm {
            let Some(&first) = data.first() else {
                return Preparation::Drop;
            };
            if first & 1 != 0 || (self.codec.is_ogm_text && first & 3 != 0) {
                return Preparation::Drop;
            }
            offset = ogm_prefix_len(first);
            delta_unit = (first & 0x08) >> 3 == 0;
            if self.codec.is_ogm_text {
                while len > 0 && data[len - 1] == 0 {
                    len -= 1;
                }
            }
        } else if self.codec.is_vp8() {
            if packet.is_header || data.starts_with(b"OVP80") {
                // the first data packet carries the header flag instead
                self.need_header_flag = true;
                return Preparation::Drop;
            }
            delta_unit = !self.codec.is_packet_keyframe(data);
        } else {
            delta_unit = !self.codec.is_packet_keyframe(data);
        }

        let duration = if packet.is_header {
            0
        } else {
            self.codec.packet_duration(data)
        };
        // unknown durations do not move the granule
        let step = duration.max(0);

        let mut out = Prepared {
            payload: offset..len,
            pts: None,
            duration: None,
            offset: None,
            offset_end: GRANULE_UNSET,
            delta_unit,
            header: false,
            discont: false,
            clipping: None,
        };

        if packet.is_header {
            out.offset = Some(0);
        } else {
            if packet.granule_position > GRANULE_UNSET {
                let granule = self.codec.granulepos_to_granule(packet.granule_position);
                if granule < 0 {
                    return Preparation::Invalid(InvalidGranule {
                        granulepos: packet.granule_position,
                        granule,
                    });
                }
                self.current_granule = granule;
                self.keyframe_granule = self.codec.key_granule(packet.granule_position);
            } else if self.current_granule != GRANULE_UNSET {
                self.current_granule += step;
                if !delta_unit {
                    self.keyframe_granule = self.current_granule;
                }
            }

            if self.current_granule == GRANULE_UNSET {
                self.prev_granule = GRANULE_UNSET;
                if !reverse {
                    log_trace!("stream {:08x}: no granule yet, dropping", self.serial);
                    return Preparation::Drop;
                }
            } else {
                self.time_packet(&mut out, duration, packet.is_end_of_stream);
            }
            self.prev_granule = self.current_granule;
        }

        if self.codec.is_ogm_text && offset >= len {
            return Preparation::Drop;
        }
        if offset > len || !self.added {
            return Preparation::Drop;
        }

        out.header = packet.is_header || std::mem::take(&mut self.need_header_flag);
        if self.discont {
            out.discont = true;
            if reverse || out.pts.is_some() {
                self.discont = false;
            }
        }
        Preparation::Ready(out)
    }

    fn time_packet(&self, out: &mut Prepared, duration: i64, end_of_stream: bool) {
        let codec = &self.codec;
        let current = self.current_granule;
        let step = duration.max(0);

        if codec.is_ogm || codec.is_sparse() {
            out.pts = Some(codec.granule_to_time(current));
            out.duration = match codec.granule_rate() {
                Some(rate) if duration >= 0 || codec.is_ogm => {
                    Some(units_to_nanos(step as u64, rate))
                }
                _ => None,
            };
        } else {
            let pre_skip = -codec.granule_offset;
            let mut clip_start = 0;
            let mut clip_end = 0;

            // The last packet may be clipped: its granule is then smaller than the
            // previous one plus its length, so time it from the previous granule.
            if end_of_stream && self.prev_granule >= 0 {
                out.pts = Some(codec.granule_to_time(self.prev_granule));
                if codec.audio_clipping && current < self.prev_granule + step {
                    clip_end = (self.prev_granule + step - current) as u64;
                }
            } else {
                out.pts = Some(codec.granule_to_time(current - step));
            }
            if codec.audio_clipping && current - step < pre_skip {
                clip_start = if current >= pre_skip {
                    let already_removed = (current - step).max(0);
                    if already_removed > pre_skip {
                        0
                    } else {
                        (pre_skip - already_removed) as u64
                    }
                } else {
                    current as u64
                };
            }
            out.duration = out
                .pts
                .map(|pts| codec.granule_to_time(current).saturating_sub(pts));
            if clip_start != 0 || clip_end != 0 {
                out.clipping = Some((clip_start, clip_end));
            }
        }
        out.offset_end = codec.granule_to_granulepos(current, self.keyframe_granule);
        out.offset = Some(codec.granule_to_time(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{vorbis_id_header, PageBuilder};

    fn vorbis_stream() -> LogicalStream {
        let mut stream = LogicalStream::new(1);
        let mut id = Packet::new(vorbis_id_header(44_100, 8, 11));
        id.is_begin_of_stream = true;
        assert_eq!(stream.classify(&mut id), Ok(true));
        assert!(id.is_header);
        stream
    }

    #[test]
    fn first_packet_identifies_codec() {
        let stream = vorbis_stream();
        assert_eq!(stream.mode(), StreamMode::Streaming);
        assert_eq!(stream.caps().media_type, "audio/x-vorbis");
        assert_eq!(stream.headers.len(), 1);
    }

    #[test]
    fn unknown_codec_is_kept() {
        let mut stream = LogicalStream::new(3);
        let mut packet = Packet::new(b"garbage".to_vec());
        assert_eq!(stream.classify(&mut packet), Ok(true));
        assert_eq!(stream.caps().media_type, crate::codec::UNKNOWN_MEDIA_TYPE);
        assert!(!packet.is_header);
    }

    #[test]
    fn start_time_from_first_granule() {
        let mut stream = vorbis_stream();
        // vorbis data packets have an even first byte; without mode info they last 0
        let mut data = Packet::new(vec![0; 10]);
        data.granule_position = 44_100;
        stream.classify(&mut data).unwrap();
        assert!(!data.is_header);
        assert_eq!(stream.start_time(), Some(1_000_000_000));
        assert_eq!(stream.current_granule(), 44_100);
    }

    #[test]
    fn drops_packets_until_granule_known() {
        let mut stream = vorbis_stream();
        stream.added = true;
        let mut data = Packet::new(vec![0; 10]);
        stream.classify(&mut data).unwrap();
        assert_eq!(stream.prepare(&data, false), Preparation::Drop);

        let mut timed = Packet::new(vec![0; 10]);
        timed.granule_position = 4096;
        stream.classify(&mut timed).unwrap();
        let Preparation::Ready(out) = stream.prepare(&timed, false) else {
            panic!("expected output");
        };
        assert_eq!(out.offset, Some(4096 * 1_000_000_000 / 44_100));
        assert_eq!(out.offset_end, 4096);
        assert!(out.discont);
        assert!(!stream.discont);
    }

    #[test]
    fn reverse_passes_untimed_packets() {
        let mut stream = vorbis_stream();
        stream.added = true;
        let mut data = Packet::new(vec![0; 10]);
        stream.classify(&mut data).unwrap();
        let Preparation::Ready(out) = stream.prepare(&data, true) else {
            panic!("expected output");
        };
        assert_eq!(out.pts, None);
        assert!(out.discont);
        assert!(!stream.discont);
    }

    #[test]
    fn lost_page_restarts_granule_from_next_page() {
        let mut stream = vorbis_stream();
        let page = |sequence, granule| {
            PageBuilder::new(1)
                .sequence(sequence)
                .granule(granule)
                .packet(&[0; 10])
                .build()
        };

        stream.submit_page(&page(0, 100), false);
        assert_eq!(stream.current_granule(), 100);
        stream.keyframe_granule = 100;
        stream.prev_granule = 100;

        let out = stream.submit_page(&page(2, 300), false);
        assert!(matches!(out.first(), Some(PacketOut::Hole)));
        assert_eq!(stream.current_granule(), 300);
        assert_eq!(stream.keyframe_granule, GRANULE_UNSET);
        assert_eq!(stream.prev_granule, GRANULE_UNSET);
    }

    #[test]
    fn vp8_header_flag_moves_to_first_frame() {
        let mut header = b"OVP80\x01\x01".to_vec();
        header.resize(26, 0);
        header[21] = 30;
        header[25] = 1;
        let mut stream = LogicalStream::new(5);
        stream.added = true;

        let mut id = Packet::new(header);
        id.is_begin_of_stream = true;
        stream.classify(&mut id).unwrap();
        assert!(id.is_header);
        assert_eq!(stream.prepare(&id, false), Preparation::Drop);

        let mut comment = Packet::new(b"OVP80\x02 comments".to_vec());
        stream.classify(&mut comment).unwrap();
        assert_eq!(stream.prepare(&comment, false), Preparation::Drop);

        // shown key frame at granule 1
        let mut frame = Packet::new(vec![0x10, 0, 0, 0]);
        frame.granule_position = (1 << 32) | (3 << 30);
        stream.classify(&mut frame).unwrap();
        let Preparation::Ready(out) = stream.prepare(&frame, false) else {
            panic!("expected output");
        };
        assert!(out.header);
        assert!(!out.delta_unit);
    }

    #[test]
    fn invalid_granule_is_reported() {
        let mut stream = vorbis_stream();
        let mut data = Packet::new(vec![0; 4]);
        data.granule_position = -5;
        assert!(stream.classify(&mut data).is_err());
    }

    #[test]
    fn reverse_joins_continued_page() {
        let head = vec![7u8; 255];
        let tail = vec![8u8; 20];
        let first = PageBuilder::new(1)
            .sequence(0)
            .granule(10)
            .packet(b"one")
            .partial(&head)
            .build();
        let second = PageBuilder::new(1)
            .sequence(1)
            .continued()
            .granule(20)
            .packet(&tail)
            .build();

        let data = |out: Vec<PacketOut>| -> Vec<Vec<u8>> {
            out.into_iter()
                .filter_map(|p| match p {
                    PacketOut::Packet(p) => Some(p.data),
                    PacketOut::Hole => None,
                })
                .collect()
        };

        let mut stream = LogicalStream::new(1);
        assert!(data(stream.submit_page(&second, true)).is_empty());
        let packets = data(stream.submit_page(&first, true));
        let mut joined = head.clone();
        joined.extend_from_slice(&tail);
        assert_eq!(packets, vec![b"one".to_vec(), joined]);
    }
}
