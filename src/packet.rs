//! Packet reassembly from pages of a single logical stream.

use std::collections::VecDeque;

use crate::common::{log_debug, GranulePos, Serial, GRANULE_UNSET};
use crate::page::Page;

/// A codec packet reassembled from one or more page segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Granule position of the page this packet completed on, if it was the last packet
    /// completed there; `-1` otherwise.
    pub granule_position: GranulePos,
    /// First packet of a page flagged begin-of-stream.
    pub is_begin_of_stream: bool,
    /// Last packet of a page flagged end-of-stream.
    pub is_end_of_stream: bool,
    pub sequence_number: u64,
    /// Decided by the codec when the packet is submitted; never derived from the page flags.
    pub is_header: bool,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Packet {
            data,
            granule_position: GRANULE_UNSET,
            is_begin_of_stream: false,
            is_end_of_stream: false,
            sequence_number: 0,
            is_header: false,
        }
    }
}

/// What the packetizer yields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketOut {
    Packet(Packet),
    /// Data was lost between two pages.
    Hole,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PageInError {
    #[error("page of serial {page:08x} submitted to stream {stream:08x}")]
    WrongSerial { page: Serial, stream: Serial },
    #[error("unsupported page version {0}")]
    Version(u8),
}

#[derive(Debug, Default)]
struct Partial {
    data: Vec<u8>,
    bos: bool,
}

/// Pages in, packets out, for one serial number.
///
/// Lost pages (sequence gaps) surface as a [`PacketOut::Hole`] and drop any packet that was
/// only partially received. A continued page without a pending head has its leading
/// continuation segments discarded.
#[derive(Debug)]
pub struct Packetizer {
    serial: Serial,
    expected_sequence: Option<u32>,
    partial: Option<Partial>,
    ready: VecDeque<PacketOut>,
    packet_number: u64,
}

impl Packetizer {
    pub fn new(serial: Serial) -> Self {
        Packetizer {
            serial,
            expected_sequence: Some(0),
            partial: None,
            ready: VecDeque::new(),
            packet_number: 0,
        }
    }

    /// Forgets all buffered data; the next page is accepted whatever its sequence number.
    pub fn reset(&mut self) {
        self.expected_sequence = None;
        self.partial = None;
        self.ready.clear();
    }

    pub fn page_in(&mut self, page: &Page) -> Result<(), PageInError> {
        if page.serial() != self.serial {
            return Err(PageInError::WrongSerial {
                page: page.serial(),
                stream: self.serial,
            });
        }
        if page.version() != 0 {
            return Err(PageInError::Version(page.version()));
        }

        let sequence = page.sequence();
        if self.expected_sequence != Some(sequence) {
            if self.partial.take().is_some() {
                log_debug!("stream {:08x}: dropping partial packet", self.serial);
            }
            if self.expected_sequence.is_some() {
                self.ready.push_back(PacketOut::Hole);
            }
        }

        let segments = page.segments();
        let body = page.body_bytes();
        let mut seg = 0;
        let mut pos = 0usize;
        let mut bos = page.is_begin_of_stream();

        if page.is_continued() && self.partial.is_none() {
            bos = false;
            while seg < segments.len() {
                let val = segments[seg] as usize;
                pos += val;
                seg += 1;
                if val < 255 {
                    break;
                }
            }
        }

        let mut last_complete = None;
        while seg < segments.len() {
            let val = segments[seg] as usize;
            let partial = self.partial.get_or_insert_with(|| Partial {
                data: Vec::new(),
                bos: std::mem::take(&mut bos),
            });
            partial.data.extend_from_slice(&body[pos..pos + val]);
            pos += val;
            seg += 1;

            if val < 255 {
                if let Some(done) = self.partial.take() {
                    let mut packet = Packet::new(done.data);
                    packet.is_begin_of_stream = done.bos;
                    self.ready.push_back(PacketOut::Packet(packet));
                    last_complete = Some(self.ready.len() - 1);
                }
            }
        }

        if let Some(idx) = last_complete {
            if let Some(PacketOut::Packet(packet)) = self.ready.get_mut(idx) {
                packet.granule_position = page.granule_position();
                if page.is_end_of_stream() && seg == segments.len() && self.partial.is_none() {
                    packet.is_end_of_stream = true;
                }
            }
        }
        self.expected_sequence = Some(sequence.wrapping_add(1));
        Ok(())
    }

    /// Takes the next packet or hole, if any is ready.
    pub fn packet_out(&mut self) -> Option<PacketOut> {
        let mut out = self.ready.pop_front()?;
        if let PacketOut::Packet(packet) = &mut out {
            packet.sequence_number = self.packet_number;
        }
        self.packet_number += 1;
        Some(out)
    }

    /// Packets completed but not yet taken, without consuming them.
    pub fn pending(&self) -> impl Iterator<Item = &PacketOut> {
        self.ready.iter()
    }

    /// Discards everything that is ready to be taken.
    pub fn drain(&mut self) {
        while self.packet_out().is_some() {}
    }
}
