//! FLAC, in both the current (`\x7fFLAC`) and the pre-1.1.1 (`fLaC`) Ogg mapping.

use super::{be16, be32, granule_rate, Caps, Codec, CodecState};

pub(super) fn setup(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let info = be32(data, 27)?;
    let rate = (info & 0xffff_f000) >> 12;
    let channels = ((info & 0x0000_0e00) >> 9) + 1;

    state.granule_shift = Some(0);
    state.n_header_packets = be16(data, 7)?.into();
    state.granule_rate = Some(granule_rate(rate.into(), 1)?);

    let mut caps = Caps::new("audio/x-flac");
    caps.rate = Some(rate);
    caps.channels = Some(channels);
    state.caps = caps;
    Some(Codec::Flac)
}

/// The legacy mapping has no header of its own; the rate arrives with STREAMINFO in the
/// second packet.
pub(super) fn setup_legacy(state: &mut CodecState, _data: &[u8]) -> Option<Codec> {
    state.granule_shift = Some(0);
    state.n_header_packets = 3;
    state.caps = Caps::new("audio/x-flac");
    Some(Codec::FlacLegacy)
}

pub(super) fn legacy_streaminfo_rate(data: &[u8]) -> Option<u64> {
    let bytes = data.get(14..17)?;
    let rate = (u64::from(bytes[0]) << 12) | (u64::from(bytes[1]) << 4) | u64::from(bytes[2] >> 4);
    Some(rate)
}

/// Audio frames start with the 0xff sync byte, everything else is metadata.
pub(super) fn is_header(data: &[u8]) -> bool {
    data.first().is_some_and(|&b| b != 0xff)
}

/// Block size of a frame, decoded from its header.
pub(super) fn packet_duration(data: &[u8]) -> i64 {
    if data.len() < 4 {
        return -1;
    }

    let index = data[2] >> 4;
    match index {
        1 => 192,
        2..=5 => 576 << (index - 2),
        8.. => 256 << (index - 8),
        6 | 7 => {
            // Block size is stored after the UTF-8 coded frame number.
            let size_bytes = usize::from(index - 6) + 1;
            if data.len() < 4 + 1 + size_bytes {
                return -1;
            }
            let len = match data[4].leading_ones() as usize {
                0 => 1,
                2 => return -1,
                n => n,
            };
            let Some(size) = data.get(4 + len..4 + len + size_bytes) else {
                return -1;
            };
            if size_bytes == 1 {
                i64::from(size[0]) + 1
            } else {
                i64::from(u16::from_be_bytes([size[0], size[1]])) + 1
            }
        }
        _ => -1,
    }
}
