//! Vorbis: packet durations depend on the block size of the current and previous packet.
//!
//! The block size of an audio packet is selected by its mode number, and the table of modes
//! lives at the very end of the setup header. Decoding the whole setup header is not needed:
//! the mode table can be recovered by walking backwards from the framing bit, since each mode
//! entry has a fixed layout with two fields that must be zero.

use super::{granule_rate, le32, Caps, Codec, CodecState};
use crate::common::log_warn;

/// Bits of one mode entry: block flag, window type, transform type, mapping.
const MODE_BITS: usize = 1 + 16 + 16 + 8;
const MAX_MODES: usize = 64;

#[derive(Clone, Debug, Default)]
pub(crate) struct Vorbis {
    short_size: i64,
    long_size: i64,
    pub(crate) last_size: i64,
    /// Block flag of each mode, `true` for long blocks.
    modes: Vec<bool>,
    mode_bits: u32,
}

pub(super) fn setup(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let channels = data[11];
    let rate = le32(data, 12)?;
    let upper = le32(data, 16)? as i32;
    let nominal = le32(data, 20)? as i32;
    let lower = le32(data, 24)? as i32;

    state.granule_shift = Some(0);
    state.preroll = 2;
    state.n_header_packets = 3;
    state.bitrate = [nominal, upper, lower]
        .into_iter()
        .find(|&b| b > 0)
        .map_or(0, |b| b as u32);
    state.granule_rate = Some(granule_rate(rate.into(), 1)?);

    let sizes = data[28];
    let vorbis = Vorbis {
        short_size: 1 << (sizes & 0x0f),
        long_size: 1 << (sizes >> 4),
        ..Vorbis::default()
    };

    let mut caps = Caps::new("audio/x-vorbis");
    caps.rate = Some(rate);
    caps.channels = Some(channels.into());
    state.caps = caps;
    Some(Codec::Vorbis(vorbis))
}

/// Header packets have an odd packet type. The setup header fills in the mode table.
pub(super) fn is_header(vorbis: &mut Vorbis, data: &[u8]) -> bool {
    match data.first() {
        Some(&kind) if kind & 1 == 1 => {
            if kind == 5 {
                match parse_modes(data) {
                    Some(modes) => {
                        vorbis.mode_bits = ilog(modes.len() as u32 - 1);
                        vorbis.modes = modes;
                    }
                    None => log_warn!("could not find the vorbis mode table"),
                }
            }
            true
        }
        _ => false,
    }
}

pub(super) fn packet_duration(vorbis: &mut Vorbis, data: &[u8]) -> i64 {
    let Some(&first) = data.first() else {
        return 0;
    };
    if first & 1 == 1 {
        return 0;
    }

    let mode = usize::from(first >> 1) & ((1 << vorbis.mode_bits) - 1);
    let size = if vorbis.modes.get(mode).copied().unwrap_or(false) {
        vorbis.long_size
    } else {
        vorbis.short_size
    };
    let duration = if vorbis.last_size == 0 {
        0
    } else {
        vorbis.last_size / 4 + size / 4
    };
    vorbis.last_size = size;
    duration
}

fn ilog(v: u32) -> u32 {
    u32::BITS - v.leading_zeros()
}

/// Reads `count` bits (at most 32) starting at bit `start`, least significant bit first.
fn bits(data: &[u8], start: usize, count: usize) -> u32 {
    (0..count).fold(0, |acc, n| {
        let i = start + n;
        let bit = (data[i / 8] >> (i % 8)) & 1;
        acc | (u32::from(bit) << n)
    })
}

fn parse_modes(data: &[u8]) -> Option<Vec<bool>> {
    let last = data.iter().rposition(|&b| b != 0)?;
    let framing = last * 8 + 7 - data[last].leading_zeros() as usize;

    let mut end = framing;
    let mut flags = Vec::new();
    let mut count = None;
    while end >= MODE_BITS + 6 && flags.len() < MAX_MODES {
        let start = end - MODE_BITS;
        let window = bits(data, start + 1, 16);
        let transform = bits(data, start + 17, 16);
        let mapping = bits(data, start + 33, 8);
        if window != 0 || transform != 0 || mapping > 63 {
            break;
        }
        flags.push(bits(data, start, 1) == 1);
        end = start;
        // The six bits in front of the first mode hold the mode count minus one.
        if bits(data, end - 6, 6) as usize + 1 == flags.len() {
            count = Some(flags.len());
        }
    }

    flags.truncate(count?);
    flags.reverse();
    Some(flags)
}
