//! Helpers for building Ogg pages in unit tests.

use crate::page::{page_checksum, Page};

#[derive(Clone, Debug)]
pub struct PageBuilder {
    serial: u32,
    sequence: u32,
    granule: i64,
    flags: u8,
    lacing: Vec<u8>,
    body: Vec<u8>,
}

impl PageBuilder {
    pub fn new(serial: u32) -> Self {
        PageBuilder {
            serial,
            sequence: 0,
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

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Appends a complete packet.
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

    /// Appends the head of a packet that continues on the next page.
    pub fn partial(mut self, data: &[u8]) -> Self {
        assert_eq!(data.len() % 255, 0, "partial packets must fill whole segments");
        self.lacing.extend(std::iter::repeat(255).take(data.len() / 255));
        self.body.extend_from_slice(data);
        self
    }

    pub fn build(self) -> Page {
        let mut header = Vec::with_capacity(27 + self.lacing.len());
        header.extend_from_slice(b"OggS");
        header.push(0);
        header.push(self.flags);
        header.extend_from_slice(&self.granule.to_le_bytes());
        header.extend_from_slice(&self.serial.to_le_bytes());
        header.extend_from_slice(&self.sequence.to_le_bytes());
        header.extend_from_slice(&[0; 4]);
        header.push(self.lacing.len() as u8);
        header.extend_from_slice(&self.lacing);
        let crc = page_checksum(&header, &self.body);
        header[22..26].copy_from_slice(&crc.to_le_bytes());
        Page::from_raw(header, self.body).expect("valid page layout")
    }

    pub fn build_bytes(self) -> Vec<u8> {
        let page = self.build();
        let mut bytes = page.header_bytes().to_vec();
        bytes.extend_from_slice(page.body_bytes());
        bytes
    }
}

/// A minimal Vorbis identification header.
pub fn vorbis_id_header(rate: u32, short_log2: u8, long_log2: u8) -> Vec<u8> {
    let mut data = b"\x01vorbis".to_vec();
    data.extend_from_slice(&0u32.to_le_bytes());
    data.push(2);
    data.extend_from_slice(&rate.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&128_000u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.push((long_log2 << 4) | short_log2);
    data.push(1);
    data
}

/// A Theora identification header with the given frame rate and keyframe shift.
pub fn theora_id_header(fps_num: u32, fps_den: u32, shift: u8) -> Vec<u8> {
    let mut data = vec![0u8; 42];
    data[..7].copy_from_slice(b"\x80theora");
    data[7] = 3;
    data[8] = 2;
    data[9] = 1;
    data[22..26].copy_from_slice(&fps_num.to_be_bytes());
    data[26..30].copy_from_slice(&fps_den.to_be_bytes());
    data[40] = (shift >> 3) & 3;
    data[41] = (shift & 7) << 5;
    data
}
