//! Opus: 48 kHz granules, pre-skip applied as a negative granule offset.

use super::{granule_rate, le16, le32, Caps, Codec, CodecState};
use crate::common::{log_warn, GranulePos, GRANULE_UNSET};

/// Samples per frame at 48 kHz, by TOC configuration number.
const FRAME_DURATIONS: [i64; 32] = [
    480, 960, 1920, 2880, // SILK NB
    480, 960, 1920, 2880, // SILK MB
    480, 960, 1920, 2880, // SILK WB
    480, 960, // Hybrid SWB
    480, 960, // Hybrid FB
    120, 240, 480, 960, // CELT NB
    120, 240, 480, 960, // CELT WB
    120, 240, 480, 960, // CELT SWB
    120, 240, 480, 960, // CELT FB
];

/// Longest legal packet, 120 ms.
const MAX_PACKET_DURATION: i64 = 5760;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Opus {
    /// Smallest granule position seen so far.
    pub(crate) first_granpos: GranulePos,
}

pub(super) fn setup(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let pre_skip = le16(data, 10)?;

    state.granule_rate = granule_rate(48_000, 1);
    state.granule_shift = Some(0);
    state.n_header_packets = 2;
    state.audio_clipping = true;
    state.granule_offset = -i64::from(pre_skip);

    let mut caps = Caps::new("audio/x-opus");
    caps.channels = Some(data[9].into());
    caps.rate = le32(data, 12).filter(|&rate| rate > 0);
    state.caps = caps;

    Some(Codec::Opus(Opus {
        first_granpos: GRANULE_UNSET,
    }))
}

pub(super) fn granulepos_to_granule(opus: &mut Opus, granulepos: GranulePos) -> i64 {
    if opus.first_granpos < 0 || granulepos < opus.first_granpos {
        opus.first_granpos = granulepos;
    }
    granulepos
}

pub(super) fn is_header(data: &[u8]) -> bool {
    data.len() >= 8 && data.starts_with(b"Opus")
}

pub(super) fn packet_duration(data: &[u8]) -> i64 {
    let Some(&toc) = data.first() else {
        return 0;
    };
    if is_header(data) {
        return 0;
    }

    let frames = match toc & 3 {
        0 => 1,
        1 | 2 => 2,
        _ => match data.get(1) {
            Some(&count) => i64::from(count & 63),
            None => {
                log_warn!("code 3 opus packet shorter than 2 bytes");
                return 0;
            }
        },
    };
    let duration = frames * FRAME_DURATIONS[usize::from(toc >> 3)];
    if duration > MAX_PACKET_DURATION {
        log_warn!("opus packet longer than 120 ms");
        return 0;
    }
    duration
}
