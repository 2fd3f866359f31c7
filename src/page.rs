//! Ogg page framing.
//!
//! A physical Ogg stream is a sequence of pages. Each page starts with the capture pattern
//! `OggS`, carries a fixed 27 byte header followed by a lacing table of up to 255 segment
//! sizes and finally the page body. Packets are split into 255 byte segments; a lacing value
//! smaller than 255 terminates a packet.
//!
//! [`PageSync`] turns an arbitrary byte stream into validated [`Page`]s, reporting garbage
//! (bad capture pattern or checksum) as skipped bytes rather than as errors.

use crate::common::{GranulePos, Serial};

/// Size of the fixed part of a page header.
pub const HEADER_SIZE: usize = 27;

/// Largest possible page: full header, full lacing table, 255 full segments.
pub const MAX_PAGE_SIZE: usize = HEADER_SIZE + 255 + 255 * 255;

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04c1_1db7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

/// Updates an Ogg CRC-32 (polynomial 0x04c11db7, not reflected, no final xor).
#[inline]
pub fn crc32(crc: u32, data: &[u8]) -> u32 {
    data.iter().fold(crc, |crc, &byte| {
        (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ byte) as usize]
    })
}

/// Checksum of a page, computed with the checksum field itself zeroed.
pub fn page_checksum(header: &[u8], body: &[u8]) -> u32 {
    let crc = crc32(0, &header[..22]);
    let crc = crc32(crc, &[0; 4]);
    let crc = crc32(crc, &header[26..]);
    crc32(crc, body)
}

/// One complete, checksum-verified Ogg page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    header: Vec<u8>,
    body: Vec<u8>,
}

impl Page {
    /// Builds a page from raw header and body bytes.
    ///
    /// The header must contain the fixed part and the complete lacing table. No checksum
    /// verification is done here; use [`PageSync`] to read untrusted data.
    pub fn from_raw(header: Vec<u8>, body: Vec<u8>) -> Option<Page> {
        if header.len() < HEADER_SIZE || &header[..4] != CAPTURE_PATTERN {
            return None;
        }
        if header.len() != HEADER_SIZE + header[26] as usize {
            return None;
        }
        let body_len: usize = header[HEADER_SIZE..].iter().map(|&v| v as usize).sum();
        if body_len != body.len() {
            return None;
        }
        Some(Page { header, body })
    }

    pub fn version(&self) -> u8 {
        self.header[4]
    }

    pub fn is_continued(&self) -> bool {
        self.header[5] & FLAG_CONTINUED != 0
    }

    pub fn is_begin_of_stream(&self) -> bool {
        self.header[5] & FLAG_BOS != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.header[5] & FLAG_EOS != 0
    }

    /// Granule position of the last packet completed on this page, `-1` if none completes.
    pub fn granule_position(&self) -> GranulePos {
        i64::from_le_bytes(le_array(&self.header[6..14]))
    }

    pub fn serial(&self) -> Serial {
        u32::from_le_bytes(le_array(&self.header[14..18]))
    }

    pub fn sequence(&self) -> u32 {
        u32::from_le_bytes(le_array(&self.header[18..22]))
    }

    pub fn checksum(&self) -> u32 {
        u32::from_le_bytes(le_array(&self.header[22..26]))
    }

    /// The lacing table.
    pub fn segments(&self) -> &[u8] {
        &self.header[HEADER_SIZE..]
    }

    /// Number of packets that end on this page.
    pub fn packets(&self) -> usize {
        self.segments().iter().filter(|&&v| v < 255).count()
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Total size of the page on the wire.
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Outcome of one [`PageSync::page_seek`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Sync {
    /// A complete page was framed; its bytes have been consumed.
    Page(Page),
    /// This many bytes were discarded while looking for a capture pattern.
    Skipped(usize),
    /// The buffered data ends inside a page.
    NeedMore,
}

/// Incremental page framer.
///
/// Bytes are appended with [`feed`](PageSync::feed) and consumed by
/// [`page_seek`](PageSync::page_seek), one page or one run of garbage at a time.
#[derive(Debug, Default)]
pub struct PageSync {
    buf: Vec<u8>,
    start: usize,
}

impl PageSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends data to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        if self.start > 0 && self.start * 2 >= self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Drops all buffered data.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.start = 0;
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Frames the next page, or reports how many bytes had to be skipped to get closer to one.
    pub fn page_seek(&mut self) -> Sync {
        let data = &self.buf[self.start..];
        if data.len() < HEADER_SIZE {
            if !data.is_empty() && !CAPTURE_PATTERN.starts_with(&data[..data.len().min(4)]) {
                return self.skip_garbage();
            }
            return Sync::NeedMore;
        }
        if &data[..4] != CAPTURE_PATTERN {
            return self.skip_garbage();
        }

        let header_len = HEADER_SIZE + data[26] as usize;
        if data.len() < header_len {
            return Sync::NeedMore;
        }
        let body_len: usize = data[HEADER_SIZE..header_len]
            .iter()
            .map(|&v| v as usize)
            .sum();
        if data.len() < header_len + body_len {
            return Sync::NeedMore;
        }

        let header = &data[..header_len];
        let body = &data[header_len..header_len + body_len];
        let stored = u32::from_le_bytes(le_array(&header[22..26]));
        if page_checksum(header, body) != stored {
            return self.skip_garbage();
        }

        let page = Page {
            header: header.to_vec(),
            body: body.to_vec(),
        };
        self.start += header_len + body_len;
        Sync::Page(page)
    }

    fn skip_garbage(&mut self) -> Sync {
        let data = &self.buf[self.start..];
        let skipped = data[1..]
            .iter()
            .position(|&b| b == b'O')
            .map_or(data.len(), |pos| pos + 1);
        self.start += skipped;
        Sync::Skipped(skipped)
    }
}
