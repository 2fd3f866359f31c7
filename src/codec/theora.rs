//! Theora: frame counts split into key frame index and distance by the keyframe shift.

use num_rational::Ratio;

use super::{be24, be32, granule_rate, Caps, Codec, CodecState};
use crate::common::{log_warn, GranulePos};

#[derive(Clone, Copy, Debug)]
pub(crate) struct Theora {
    /// Bitstreams older than 3.2.1 count the key frame itself as offset zero.
    pub(crate) zero_keyoffset: bool,
}

pub(super) fn setup(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let version = u32::from_be_bytes([0, data[7], data[8], data[9]]);
    let width = be24(data, 14)?;
    let height = be24(data, 17)?;
    let fps_n = be32(data, 22)?;
    let fps_d = be32(data, 26)?;
    let mut par_n = be24(data, 30)?;
    let mut par_d = be24(data, 33)?;

    state.granule_shift = Some((u32::from(data[40] & 0x03) << 3) + u32::from(data[41] >> 5));
    state.is_video = true;
    state.n_header_packets = 3;
    state.frame_size = 1;
    state.bitrate = be24(data, 37)?;

    let Some(rate) = granule_rate(fps_n.into(), fps_d.into()) else {
        log_warn!("theora frame rate {fps_n}/{fps_d}");
        return None;
    };
    state.granule_rate = Some(rate);

    let mut caps = Caps::new("video/x-theora");
    if width > 0 && height > 0 {
        caps.width = Some(width);
        caps.height = Some(height);
    }
    if par_n == 0 || par_d == 0 {
        par_n = 1;
        par_d = 1;
    }
    caps.framerate = Some(rate);
    caps.pixel_aspect_ratio = Some(Ratio::new(par_n, par_d));
    state.caps = caps;

    Some(Codec::Theora(Theora {
        zero_keyoffset: version < 0x03_02_01,
    }))
}

pub(super) fn granulepos_to_granule(
    theora: &Theora,
    shift: Option<u32>,
    granulepos: GranulePos,
) -> i64 {
    match shift {
        Some(shift) if shift != 0 => {
            let keyindex = granulepos >> shift;
            let mut keyoffset = granulepos - (keyindex << shift);
            if theora.zero_keyoffset {
                keyoffset += 1;
            }
            keyindex + keyoffset
        }
        _ => granulepos,
    }
}

pub(super) fn is_granulepos_keyframe(shift: Option<u32>, granulepos: GranulePos) -> bool {
    let Some(shift) = shift else {
        return false;
    };
    let mask = (1u64 << shift) - 1;
    granulepos as u64 & mask == 0
}

pub(super) fn is_packet_keyframe(data: &[u8]) -> bool {
    data.first().is_some_and(|&b| b & 0xc0 == 0)
}

pub(super) fn is_header(data: &[u8]) -> bool {
    data.first().is_some_and(|&b| b & 0x80 != 0)
}
