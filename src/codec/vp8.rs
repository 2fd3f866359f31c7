//! VP8: a granule position packs the presentation frame number in the upper 32 bits and the
//! distance to the last key frame in bits 3..30.

use num_rational::Ratio;

use super::{be16, be24, be32, granule_rate, Caps, Codec, CodecState};
use crate::common::{GranulePos, GRANULE_UNSET};

const DISTANCE_MASK: u64 = 0x07ff_ffff;

pub(super) fn setup(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let width = be16(data, 8)?;
    let height = be16(data, 10)?;
    let par_n = be24(data, 12)?;
    let par_d = be24(data, 15)?;
    let fps_n = be32(data, 18)?;
    let fps_d = be32(data, 22)?;

    state.is_video = true;
    state.granule_rate = granule_rate(fps_n.into(), fps_d.into());
    state.n_header_packets = 2;
    state.frame_size = 1;

    let mut caps = Caps::new("video/x-vp8");
    caps.width = Some(width.into());
    caps.height = Some(height.into());
    caps.framerate = state.granule_rate;
    caps.pixel_aspect_ratio = (par_n != 0 && par_d != 0).then(|| Ratio::new(par_n, par_d));
    state.caps = caps;
    Some(Codec::Vp8)
}

pub(super) fn granulepos_to_granule(granulepos: GranulePos) -> i64 {
    (granulepos as u64 >> 32) as i64
}

pub(super) fn granule_to_granulepos(granule: i64, keyframe_granule: i64) -> GranulePos {
    // Invisible frame count is not tracked, all three bits set means "unknown".
    let invisible = 0x3u64;
    let distance = granule.wrapping_sub(keyframe_granule) as u64;
    ((granule as u64) << 32 | invisible << 30 | distance << 3) as i64
}

pub(super) fn key_granule(granulepos: GranulePos) -> i64 {
    if granulepos == GRANULE_UNSET || granulepos == 0 {
        return granulepos;
    }
    let gp = granulepos as u64;
    let pts = gp >> 32;
    let distance = (gp >> 3) & DISTANCE_MASK;
    pts.saturating_sub(distance) as i64
}

pub(super) fn is_granulepos_keyframe(granulepos: GranulePos) -> bool {
    (granulepos as u64 >> 3) & DISTANCE_MASK == 0
}

/// Bit 0 of the frame tag is clear on key frames.
pub(super) fn is_packet_keyframe(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] & 1 == 0
}

pub(super) fn is_header(data: &[u8]) -> bool {
    data.starts_with(b"OVP80")
}

/// Invisible frames (show_frame bit clear) take no time.
pub(super) fn packet_duration(data: &[u8]) -> i64 {
    if data.len() < 3 {
        return 0;
    }
    i64::from((data[0] >> 4) & 1)
}
