#![allow(dead_code)]
//! Builders for synthetic Ogg files.
//!
//! In a separate folder so it is not run as an integration test itself.

use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oggdemux::page::page_checksum;
use oggdemux::{
    DemuxBuilder, DemuxController, Event, EventLog, Mode, OutputPacket, PushOnly,
    ReadSeekSource, Serial, Source,
};

pub const THEORA_SERIAL: Serial = 0x0000_7e01;
pub const VORBIS_SERIAL: Serial = 0x0000_0b02;
pub const THEORA_SHIFT: u8 = 6;
pub const THEORA_FPS: u32 = 10;
/// Frames between two Theora key frames.
pub const KEY_INTERVAL: i64 = 10;
pub const VORBIS_RATE: u32 = 44_100;
/// Samples per Vorbis packet once the first block is decoded.
pub const VORBIS_BLOCK: i64 = 1024;

pub type PullDemux<S = ReadSeekSource<Cursor<Vec<u8>>>> = DemuxController<S, Arc<EventLog>>;
pub type PushDemux = DemuxController<PushOnly, Arc<EventLog>>;

/// A page under construction.
#[derive(Clone, Debug)]
pub struct OggPage {
    serial: Serial,
    sequence: u32,
    granule: i64,
    flags: u8,
    lacing: Vec<u8>,
    body: Vec<u8>,
}

impl OggPage {
    pub fn new(serial: Serial, sequence: u32) -> Self {
        OggPage {
            serial,
            sequence,
            granule: -1,
            flags: 0,
            lacing: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn bos(mut self) -> Self {
        self.flags |= 0x02;
        self
    }

    pub fn eos(mut self) -> Self {
        self.flags |= 0x04;
        self
    }

    pub fn continued(mut self) -> Self {
        self.flags |= 0x01;
        self
    }

    pub fn granule(mut self, granule: i64) -> Self {
        self.granule = granule;
        self
    }

    pub fn packet(mut self, data: &[u8]) -> Self {
        let mut rest = data.len();
        while rest >= 255 {
            self.lacing.push(255);
            rest -= 255;
        }
        self.lacing.push(rest as u8);
        self.body.extend_from_slice(data);
        self
    }

    /// The head of a packet that goes on in the next page. Must fill whole segments.
    pub fn partial(mut self, data: &[u8]) -> Self {
        assert_eq!(data.len() % 255, 0);
        self.lacing.extend(std::iter::repeat_n(255, data.len() / 255));
        self.body.extend_from_slice(data);
        self
    }

    pub fn bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(27 + self.lacing.len() + self.body.len());
        out.extend_from_slice(b"OggS");
        out.push(0);
        out.push(self.flags);
        out.extend_from_slice(&self.granule.to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.push(self.lacing.len() as u8);
        out.extend_from_slice(&self.lacing);
        let crc = page_checksum(&out, &self.body);
        out[22..26].copy_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Hands out pages of one logical stream with increasing sequence numbers.
#[derive(Debug)]
pub struct StreamWriter {
    serial: Serial,
    sequence: u32,
}

impl StreamWriter {
    pub fn new(serial: Serial) -> Self {
        StreamWriter { serial, sequence: 0 }
    }

    pub fn page(&mut self) -> OggPage {
        let page = OggPage::new(self.serial, self.sequence);
        self.sequence += 1;
        page
    }
}

/// A page together with the time it ends at, for interleaving streams.
#[derive(Clone, Debug)]
pub struct TimedPage {
    pub end: f64,
    pub bytes: Vec<u8>,
}

/// Orders the pages of several streams by end time, keeping each stream's order.
pub fn interleave(streams: Vec<Vec<TimedPage>>) -> Vec<u8> {
    let mut pages: Vec<TimedPage> = streams.into_iter().flatten().collect();
    pages.sort_by(|a, b| a.end.total_cmp(&b.end));
    pages.into_iter().flat_map(|p| p.bytes).collect()
}

pub fn theora_id_header() -> Vec<u8> {
    let mut data = vec![0u8; 42];
    data[..7].copy_from_slice(b"\x80theora");
    data[7] = 3;
    data[8] = 2;
    data[9] = 1;
    data[22..26].copy_from_slice(&THEORA_FPS.to_be_bytes());
    data[26..30].copy_from_slice(&1u32.to_be_bytes());
    data[40] = (THEORA_SHIFT >> 3) & 3;
    data[41] = (THEORA_SHIFT & 7) << 5;
    data
}

/// Frame numbers start at 1; frame 1, 11, 21... are key frames.
pub fn theora_key(frame: i64) -> i64 {
    (frame - 1) / KEY_INTERVAL * KEY_INTERVAL + 1
}

pub fn theora_granulepos(frame: i64) -> i64 {
    let key = theora_key(frame);
    (key << THEORA_SHIFT) | (frame - key)
}

pub fn theora_frame(frame: i64, size: usize) -> Vec<u8> {
    let mut packet = vec![if theora_key(frame) == frame { 0x00 } else { 0x40 }];
    packet.resize(size, frame as u8);
    packet
}

/// Time at which `frame` is shown, in nanoseconds.
pub fn theora_pts(frame: i64) -> u64 {
    (frame as u64 - 1) * 1_000_000_000 / u64::from(THEORA_FPS)
}

/// Identification, comment and setup pages. All end at time zero.
pub fn theora_headers(writer: &mut StreamWriter) -> Vec<TimedPage> {
    let pages = [
        writer.page().bos().granule(0).packet(&theora_id_header()),
        writer.page().granule(0).packet(b"\x81theora"),
        writer.page().granule(0).packet(b"\x82theora"),
    ];
    pages
        .into_iter()
        .map(|page| TimedPage {
            end: 0.0,
            bytes: page.bytes(),
        })
        .collect()
}

/// One page per frame, the last one flagged end-of-stream.
pub fn theora_frames(writer: &mut StreamWriter, frames: i64, size: usize) -> Vec<TimedPage> {
    (1..=frames)
        .map(|frame| {
            let mut page = writer
                .page()
                .granule(theora_granulepos(frame))
                .packet(&theora_frame(frame, size));
            if frame == frames {
                page = page.eos();
            }
            TimedPage {
                end: frame as f64 / f64::from(THEORA_FPS),
                bytes: page.bytes(),
            }
        })
        .collect()
}

/// Two frames per page, only the second one carrying the granule position. `frames` must be
/// even.
pub fn theora_frame_pairs(writer: &mut StreamWriter, frames: i64, size: usize) -> Vec<TimedPage> {
    (1..=frames)
        .step_by(2)
        .map(|frame| {
            let mut page = writer
                .page()
                .packet(&theora_frame(frame, size))
                .granule(theora_granulepos(frame + 1))
                .packet(&theora_frame(frame + 1, size));
            if frame + 1 == frames {
                page = page.eos();
            }
            TimedPage {
                end: (frame + 1) as f64 / f64::from(THEORA_FPS),
                bytes: page.bytes(),
            }
        })
        .collect()
}

/// A 10 fps Theora file of `frames` frames of `size` bytes each, one frame per page.
pub fn theora_file(serial: Serial, frames: i64, size: usize) -> Vec<u8> {
    let mut writer = StreamWriter::new(serial);
    let mut pages = theora_headers(&mut writer);
    pages.extend(theora_frames(&mut writer, frames, size));
    pages.into_iter().flat_map(|p| p.bytes).collect()
}

/// Like [`theora_file`], with frame `split` spread over two pages.
pub fn theora_file_with_split(serial: Serial, frames: i64, split: i64) -> Vec<u8> {
    let mut writer = StreamWriter::new(serial);
    let mut out: Vec<u8> = theora_headers(&mut writer).into_iter().flat_map(|p| p.bytes).collect();
    for frame in 1..=frames {
        if frame == split {
            let packet = theora_frame(frame, 600);
            out.extend(writer.page().partial(&packet[..510]).bytes());
            out.extend(
                writer
                    .page()
                    .continued()
                    .granule(theora_granulepos(frame))
                    .packet(&packet[510..])
                    .bytes(),
            );
            continue;
        }
        let mut page = writer
            .page()
            .granule(theora_granulepos(frame))
            .packet(&theora_frame(frame, 300));
        if frame == frames {
            page = page.eos();
        }
        out.extend(page.bytes());
    }
    out
}

pub fn vorbis_id_header() -> Vec<u8> {
    let mut data = b"\x01vorbis".to_vec();
    data.extend_from_slice(&0u32.to_le_bytes());
    data.push(2);
    data.extend_from_slice(&VORBIS_RATE.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&128_000u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    // short blocks of 256, long blocks of 2048 samples
    data.push((11 << 4) | 8);
    data.push(1);
    data
}

struct BitWriter {
    bytes: Vec<u8>,
    bit: usize,
}

impl BitWriter {
    fn put(&mut self, value: u32, count: usize) {
        for n in 0..count {
            if self.bit % 8 == 0 {
                self.bytes.push(0);
            }
            let last = self.bytes.len() - 1;
            self.bytes[last] |= (((value >> n) & 1) as u8) << (self.bit % 8);
            self.bit += 1;
        }
    }
}

/// A setup header whose mode table holds a single long-block mode.
pub fn vorbis_setup_header() -> Vec<u8> {
    let prefix = b"\x05vorbis\xff\xff\xff\xff";
    let mut writer = BitWriter {
        bytes: prefix.to_vec(),
        bit: prefix.len() * 8,
    };
    writer.put(0, 6);
    writer.put(1, 1);
    writer.put(0, 16);
    writer.put(0, 16);
    writer.put(0, 8);
    writer.put(1, 1);
    writer.bytes
}

pub fn vorbis_headers(writer: &mut StreamWriter) -> Vec<TimedPage> {
    let pages = [
        writer.page().bos().granule(0).packet(&vorbis_id_header()),
        writer.page().granule(0).packet(b"\x03vorbis\0\0\0\0\0\0\0\0\x01"),
        writer.page().granule(0).packet(&vorbis_setup_header()),
    ];
    pages
        .into_iter()
        .map(|page| TimedPage {
            end: 0.0,
            bytes: page.bytes(),
        })
        .collect()
}

/// `pages` data pages. The first carries two packets, the very first of which decodes to
/// nothing; every page ends [`VORBIS_BLOCK`] samples after the previous one.
pub fn vorbis_data(writer: &mut StreamWriter, pages: i64) -> Vec<TimedPage> {
    let packet = vec![0u8; 200];
    (1..=pages)
        .map(|n| {
            let mut page = writer.page();
            if n == 1 {
                page = page.packet(&packet);
            }
            page = page.granule(n * VORBIS_BLOCK).packet(&packet);
            if n == pages {
                page = page.eos();
            }
            TimedPage {
                end: (n * VORBIS_BLOCK) as f64 / f64::from(VORBIS_RATE),
                bytes: page.bytes(),
            }
        })
        .collect()
}

pub fn vorbis_file(serial: Serial, pages: i64) -> Vec<u8> {
    let mut writer = StreamWriter::new(serial);
    let mut out = vorbis_headers(&mut writer);
    out.extend(vorbis_data(&mut writer, pages));
    out.into_iter().flat_map(|p| p.bytes).collect()
}

/// Theora and Vorbis multiplexed in one chain, both begin-of-stream pages first.
pub fn theora_vorbis_file(frames: i64, vorbis_pages: i64) -> Vec<u8> {
    let mut theora = StreamWriter::new(THEORA_SERIAL);
    let mut vorbis = StreamWriter::new(VORBIS_SERIAL);
    let mut theora_head = theora_headers(&mut theora);
    let mut vorbis_head = vorbis_headers(&mut vorbis);

    let mut out = theora_head.remove(0).bytes;
    out.extend(vorbis_head.remove(0).bytes);
    out.extend(theora_head.into_iter().chain(vorbis_head).flat_map(|p| p.bytes));
    out.extend(interleave(vec![
        theora_frames(&mut theora, frames, 300),
        vorbis_data(&mut vorbis, vorbis_pages),
    ]));
    out
}

/// A stream no codec claims, `pages` pages long.
pub fn unknown_stream(serial: Serial, pages: i64) -> Vec<TimedPage> {
    let mut writer = StreamWriter::new(serial);
    let mut out = vec![TimedPage {
        end: 0.0,
        bytes: writer.page().bos().packet(b"XYZW not a codec").bytes(),
    }];
    for n in 1..=pages {
        let mut page = writer.page().packet(&[n as u8; 64]);
        if n == pages {
            page = page.eos();
        }
        out.push(TimedPage {
            end: n as f64 * 0.25,
            bytes: page.bytes(),
        });
    }
    out
}

/// A [`Source`] over memory that counts the reads made through it.
#[derive(Clone, Debug)]
pub struct CountingSource {
    data: Arc<Vec<u8>>,
    reads: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn new(data: Vec<u8>) -> Self {
        CountingSource {
            data: Arc::new(data),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Source for CountingSource {
    fn read_range(&mut self, offset: u64, length: usize) -> io::Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let Some(rest) = self.data.get(offset as usize..).filter(|rest| !rest.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(rest[..length.min(rest.len())].to_vec()))
    }

    fn query_length(&mut self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

pub fn pull_demux(data: Vec<u8>) -> PullDemux {
    DemuxBuilder::new()
        .with_source(ReadSeekSource::new(Cursor::new(data), None))
        .with_sink(Arc::new(EventLog::new()))
        .build()
        .unwrap()
}

pub fn counting_demux(source: CountingSource) -> PullDemux<CountingSource> {
    DemuxBuilder::new()
        .with_source(source)
        .with_sink(Arc::new(EventLog::new()))
        .build()
        .unwrap()
}

pub fn push_demux(byte_len: u64) -> PushDemux {
    DemuxBuilder::new()
        .with_source(PushOnly)
        .with_sink(Arc::new(EventLog::new()))
        .with_mode(Mode::Push)
        .with_byte_len(byte_len)
        .build()
        .unwrap()
}

/// Steps until the demuxer stops, then takes what it produced.
pub fn run_to_end<S: Source>(demux: &PullDemux<S>) -> Vec<Event> {
    while demux.step().unwrap().is_continue() {}
    demux.sink().take()
}

/// Data packets of `serial`, headers left out.
pub fn data_packets(events: &[Event], serial: Serial) -> Vec<&OutputPacket> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Packet(s, packet) if *s == serial && !packet.header => Some(packet),
            _ => None,
        })
        .collect()
}

pub fn secs(nanos: u64) -> f64 {
    Duration::from_nanos(nanos).as_secs_f64()
}
